//! SendAttempt entity model
//!
//! Audit trail of dispatch outcomes. The job row keeps the authoritative
//! failure count and last error; these rows are append-only history.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "send_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub followup_job_id: Uuid,

    /// Ladder position of the claim that produced this attempt
    pub attempt_number: i32,

    /// `sent` or `failed`
    pub outcome: String,

    /// Classified failure code (e.g. `transient`, `timeout`, `connection_inactive`)
    pub error_code: Option<String>,

    pub error_message: Option<String>,

    pub provider_message_id: Option<String>,

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
