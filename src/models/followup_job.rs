//! FollowUpJob entity model
//!
//! One row per scheduled follow-up email. The table is also the dispatch queue;
//! see [`FollowUpStatus`] for the lifecycle.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::connection::UnknownVariant;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "followup_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Connection used to send
    pub connection_id: Uuid,

    /// Recipient address of the original email and of the follow-up
    pub recipient: String,

    pub original_subject: String,

    pub original_body: Option<String>,

    /// Message-ID of the original email, used as the thread anchor for replies
    pub original_message_id: Option<String>,

    pub delay_hours: i32,

    /// Draft tone (`professional`, `friendly`, `urgent`)
    pub tone: String,

    pub max_followups: i32,

    pub stop_on_reply: bool,

    pub draft_subject: Option<String>,

    pub draft_body: Option<String>,

    /// Lifecycle status, see [`FollowUpStatus`]
    pub status: String,

    /// When the job becomes eligible for dispatch
    pub scheduled_at: DateTimeWithTimeZone,

    pub sent_at: Option<DateTimeWithTimeZone>,

    /// Receipt returned by the provider on a successful send
    pub provider_message_id: Option<String>,

    pub reply_received_at: Option<DateTimeWithTimeZone>,

    /// Every recorded dispatch failure. Never reset.
    pub failure_count: i32,

    /// Position on the retry ladder for the current cycle. Reset by manual retry.
    pub attempts: i32,

    pub last_error: Option<String>,

    /// Outstanding dispatch claim; a row with a claim is never picked up again
    pub claim_token: Option<Uuid>,

    pub claimed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connection::Entity",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
    #[sea_orm(has_many = "super::reply::Entity")]
    Reply,
    #[sea_orm(has_many = "super::send_attempt::Entity")]
    SendAttempt,
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl Related<super::reply::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Reply.def()
    }
}

impl Related<super::send_attempt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SendAttempt.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn status(&self) -> Result<FollowUpStatus, UnknownVariant> {
        self.status.parse()
    }
}

/// Follow-up lifecycle.
///
/// ```text
/// pending|scheduled --(send ok)-------------------> sent
/// pending|scheduled --(send fails, retries left)--> pending
/// pending|scheduled --(retries exhausted)---------> failed
/// pending|scheduled --(cancel)--------------------> cancelled
/// pending|scheduled|sent --(reply)----------------> replied
/// failed --(manual retry)-------------------------> pending
/// ```
///
/// `replied`, `cancelled` and `failed` are terminal for the worker. A claimed
/// send that completes after a concurrent cancel still lands on `sent`; see
/// [`FollowUpStatus::accepts_claimed_send`]. One that completes after a reply
/// keeps `replied` and only records the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Pending,
    Scheduled,
    Sent,
    Replied,
    Cancelled,
    Failed,
}

impl FollowUpStatus {
    pub const ALL: [FollowUpStatus; 6] = [
        FollowUpStatus::Pending,
        FollowUpStatus::Scheduled,
        FollowUpStatus::Sent,
        FollowUpStatus::Replied,
        FollowUpStatus::Cancelled,
        FollowUpStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpStatus::Pending => "pending",
            FollowUpStatus::Scheduled => "scheduled",
            FollowUpStatus::Sent => "sent",
            FollowUpStatus::Replied => "replied",
            FollowUpStatus::Cancelled => "cancelled",
            FollowUpStatus::Failed => "failed",
        }
    }

    /// Statuses the dispatch worker may pick up once due.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, FollowUpStatus::Pending | FollowUpStatus::Scheduled)
    }

    /// The single transition table. Every store mutation checks it.
    pub fn can_transition_to(&self, next: FollowUpStatus) -> bool {
        use FollowUpStatus::*;

        match (self, next) {
            (Pending | Scheduled, Pending | Sent | Failed | Cancelled | Replied) => true,
            (Sent, Replied) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }

    /// Statuses from which a claimed, already-delivered send may be recorded.
    /// Includes `cancelled` because cancellation does not interrupt an
    /// in-flight provider call.
    pub fn accepts_claimed_send(&self) -> bool {
        self.can_transition_to(FollowUpStatus::Sent) || *self == FollowUpStatus::Cancelled
    }

    /// Every status allowed to move to `next`, for conditional update filters.
    pub fn sources_of(next: FollowUpStatus) -> Vec<FollowUpStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    pub fn sources_of_as_str(next: FollowUpStatus) -> Vec<&'static str> {
        Self::sources_of(next)
            .into_iter()
            .map(|status| status.as_str())
            .collect()
    }
}

impl fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FollowUpStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownVariant {
                kind: "follow-up status",
                value: value.to_string(),
            })
    }
}

/// Tone used when drafting follow-up copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    #[default]
    Professional,
    Friendly,
    Urgent,
}

impl Tone {
    pub const ALL: [Tone; 3] = [Tone::Professional, Tone::Friendly, Tone::Urgent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Professional => "professional",
            Tone::Friendly => "friendly",
            Tone::Urgent => "urgent",
        }
    }

    /// Phrase used in draft prompts.
    pub fn description(&self) -> &'static str {
        match self {
            Tone::Professional => "professional and polite",
            Tone::Friendly => "warm and friendly, but still professional",
            Tone::Urgent => "polite but with a sense of urgency",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tone {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tone| tone.as_str() == value)
            .ok_or_else(|| UnknownVariant {
                kind: "tone",
                value: value.to_string(),
            })
    }
}
