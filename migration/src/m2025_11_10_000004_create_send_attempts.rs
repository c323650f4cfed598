//! Migration to create the send_attempts audit table.
//!
//! One row per claimed dispatch, recording the provider receipt or the
//! classified failure.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SendAttempts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SendAttempts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SendAttempts::FollowupJobId).uuid().not_null())
                    .col(
                        ColumnDef::new(SendAttempts::AttemptNumber)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SendAttempts::Outcome).text().not_null())
                    .col(ColumnDef::new(SendAttempts::ErrorCode).text().null())
                    .col(ColumnDef::new(SendAttempts::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(SendAttempts::ProviderMessageId)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SendAttempts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_send_attempts_followup_job_id")
                            .from(SendAttempts::Table, SendAttempts::FollowupJobId)
                            .to(FollowupJobs::Table, FollowupJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_send_attempts_followup_job_id")
                    .table(SendAttempts::Table)
                    .col(SendAttempts::FollowupJobId)
                    .col(SendAttempts::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_send_attempts_followup_job_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SendAttempts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SendAttempts {
    Table,
    Id,
    FollowupJobId,
    AttemptNumber,
    Outcome,
    ErrorCode,
    ErrorMessage,
    ProviderMessageId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum FollowupJobs {
    Table,
    Id,
}
