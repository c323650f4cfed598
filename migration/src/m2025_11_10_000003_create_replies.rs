//! Migration to create the replies table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Replies::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Replies::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Replies::FollowupJobId).uuid().not_null())
                    .col(ColumnDef::new(Replies::UserId).uuid().not_null())
                    .col(ColumnDef::new(Replies::FromEmail).text().not_null())
                    .col(ColumnDef::new(Replies::FromName).text().null())
                    .col(ColumnDef::new(Replies::Subject).text().not_null())
                    .col(ColumnDef::new(Replies::Body).text().not_null())
                    .col(ColumnDef::new(Replies::MessageId).text().null())
                    .col(ColumnDef::new(Replies::InReplyTo).text().null())
                    .col(
                        ColumnDef::new(Replies::ReceivedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Replies::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_replies_followup_job_id")
                            .from(Replies::Table, Replies::FollowupJobId)
                            .to(FollowupJobs::Table, FollowupJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_replies_followup_job_id")
                    .table(Replies::Table)
                    .col(Replies::FollowupJobId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_replies_followup_job_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Replies::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Replies {
    Table,
    Id,
    FollowupJobId,
    UserId,
    FromEmail,
    FromName,
    Subject,
    Body,
    MessageId,
    InReplyTo,
    ReceivedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum FollowupJobs {
    Table,
    Id,
}
