//! Migration to create the followup_jobs table.
//!
//! The table doubles as the dispatch queue: the worker polls it by
//! `(status, scheduled_at)` and claims rows with conditional updates.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FollowupJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FollowupJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FollowupJobs::UserId).uuid().not_null())
                    .col(ColumnDef::new(FollowupJobs::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(FollowupJobs::Recipient).text().not_null())
                    .col(
                        ColumnDef::new(FollowupJobs::OriginalSubject)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(FollowupJobs::OriginalBody).text().null())
                    .col(
                        ColumnDef::new(FollowupJobs::OriginalMessageId)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::DelayHours)
                            .integer()
                            .not_null()
                            .default(24),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::Tone)
                            .text()
                            .not_null()
                            .default("professional"),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::MaxFollowups)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::StopOnReply)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(FollowupJobs::DraftSubject).text().null())
                    .col(ColumnDef::new(FollowupJobs::DraftBody).text().null())
                    .col(
                        ColumnDef::new(FollowupJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::SentAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::ProviderMessageId)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::ReplyReceivedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::FailureCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(FollowupJobs::LastError).text().null())
                    .col(ColumnDef::new(FollowupJobs::ClaimToken).uuid().null())
                    .col(
                        ColumnDef::new(FollowupJobs::ClaimedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(FollowupJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_followup_jobs_connection_id")
                            .from(FollowupJobs::Table, FollowupJobs::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        // Due-job scan: status filter then oldest scheduled_at first
        manager
            .create_index(
                Index::create()
                    .name("idx_followup_jobs_status_scheduled")
                    .table(FollowupJobs::Table)
                    .col(FollowupJobs::Status)
                    .col(FollowupJobs::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        // Reply cascade: siblings for the same user and recipient
        manager
            .create_index(
                Index::create()
                    .name("idx_followup_jobs_user_recipient")
                    .table(FollowupJobs::Table)
                    .col(FollowupJobs::UserId)
                    .col(FollowupJobs::Recipient)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_followup_jobs_user_created")
                    .table(FollowupJobs::Table)
                    .col(FollowupJobs::UserId)
                    .col(FollowupJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for index in [
            "idx_followup_jobs_status_scheduled",
            "idx_followup_jobs_user_recipient",
            "idx_followup_jobs_user_created",
        ] {
            manager
                .drop_index(Index::drop().name(index).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(FollowupJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FollowupJobs {
    Table,
    Id,
    UserId,
    ConnectionId,
    Recipient,
    OriginalSubject,
    OriginalBody,
    OriginalMessageId,
    DelayHours,
    Tone,
    MaxFollowups,
    StopOnReply,
    DraftSubject,
    DraftBody,
    Status,
    ScheduledAt,
    SentAt,
    ProviderMessageId,
    ReplyReceivedAt,
    FailureCount,
    Attempts,
    LastError,
    ClaimToken,
    ClaimedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
