//! Database migrations for the follow-up service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_000001_create_connections;
mod m2025_11_10_000002_create_followup_jobs;
mod m2025_11_10_000003_create_replies;
mod m2025_11_10_000004_create_send_attempts;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_000001_create_connections::Migration),
            Box::new(m2025_11_10_000002_create_followup_jobs::Migration),
            Box::new(m2025_11_10_000003_create_replies::Migration),
            Box::new(m2025_11_10_000004_create_send_attempts::Migration),
        ]
    }
}
