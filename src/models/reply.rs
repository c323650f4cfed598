//! Reply entity model
//!
//! Inbound replies recorded against a follow-up. Writing one moves the job to
//! `replied` and may cancel sibling jobs for the same recipient.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "replies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Follow-up the reply answers
    pub followup_job_id: Uuid,

    pub user_id: Uuid,

    pub from_email: String,

    pub from_name: Option<String>,

    pub subject: String,

    pub body: String,

    /// Message-ID of the reply itself
    pub message_id: Option<String>,

    /// Message-ID the reply points back to
    pub in_reply_to: Option<String>,

    pub received_at: DateTimeWithTimeZone,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::followup_job::Entity",
        from = "Column::FollowupJobId",
        to = "super::followup_job::Column::Id"
    )]
    FollowUpJob,
}

impl Related<super::followup_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FollowUpJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
