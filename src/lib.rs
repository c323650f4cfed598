//! # Follow-up Scheduler Library
//!
//! Schedules follow-up emails, dispatches them through per-user provider
//! connections with a bounded retry ladder, and exposes the REST API that
//! controls them.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatcher;
pub mod drafts;
pub mod error;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod template;
pub use migration;
