//! # Follow-up Store
//!
//! Persistence and state transitions for follow-up jobs. The `followup_jobs`
//! table doubles as the dispatch queue: every status change is a single-row
//! conditional update whose precondition set is derived from
//! [`FollowUpStatus::can_transition_to`], so concurrent writers cannot move a
//! job along an edge the lifecycle does not allow.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use metrics::counter;
use regex::Regex;
use sea_orm::prelude::*;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{self, ApiError};
use crate::models::connection::{self, Entity as Connection};
use crate::models::followup_job::{self, Column, Entity as FollowUpJob, FollowUpStatus, Model, Tone};
use crate::models::{reply, send_attempt};

/// Delay before each automatic retry, indexed by the attempt that failed.
/// A retryable failure on attempt four or later is terminal.
pub const RETRY_LADDER_SECS: [i64; 3] = [60, 300, 900];

pub const MIN_DELAY_HOURS: i32 = 1;
pub const MAX_DELAY_HOURS: i32 = 168;
pub const DEFAULT_DELAY_HOURS: i32 = 24;
pub const MIN_FOLLOWUPS: i32 = 1;
pub const MAX_FOLLOWUPS: i32 = 5;
pub const DEFAULT_LIST_LIMIT: u64 = 50;
pub const MAX_LIST_LIMIT: u64 = 100;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles")
});

/// Delay before the next automatic attempt after `attempt_number` failed.
pub fn retry_delay(attempt_number: i32) -> Option<Duration> {
    usize::try_from(attempt_number)
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|index| RETRY_LADDER_SECS.get(index))
        .map(|secs| Duration::seconds(*secs))
}

pub fn is_valid_email(address: &str) -> bool {
    EMAIL_PATTERN.is_match(address)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{message}")]
    Validation { field: &'static str, message: String },
    #[error("{resource} not found")]
    NotFound { resource: &'static str },
    #[error("cannot {action} a follow-up that is {status}")]
    InvalidState { action: &'static str, status: String },
    #[error("connection is {status}, not active")]
    ConnectionInactive { status: String },
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    fn validation(field: &'static str, message: impl Into<String>) -> Self {
        StoreError::Validation {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(action: &'static str, status: &str) -> Self {
        StoreError::InvalidState {
            action,
            status: status.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation { field, message } => {
                error::validation_error(&message, json!({ field: message.clone() }))
            }
            StoreError::NotFound { resource } => error::not_found(resource),
            StoreError::InvalidState { action, status } => error::invalid_state(
                &format!("cannot {} a follow-up that is {}", action, status),
                &status,
            ),
            StoreError::ConnectionInactive { status } => error::connection_inactive(&status),
            StoreError::Conflict(message) => error::conflict(&message),
            StoreError::Database(db_err) => ApiError::from(db_err),
            StoreError::Internal(err) => ApiError::from(err),
        }
    }
}

/// Request to schedule a follow-up.
#[derive(Debug, Clone, Default)]
pub struct NewFollowUp {
    pub connection_id: Option<Uuid>,
    pub recipient: String,
    pub original_subject: String,
    pub original_body: Option<String>,
    pub original_message_id: Option<String>,
    pub delay_hours: Option<i32>,
    pub tone: Option<String>,
    pub max_followups: Option<i32>,
    pub stop_on_reply: Option<bool>,
    pub draft_subject: Option<String>,
    pub draft_body: Option<String>,
}

/// Raw list query; validated by [`FollowUpStore::list_for_user`].
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Raw reply query; dates are `YYYY-MM-DD`, both ends inclusive.
#[derive(Debug, Clone, Default)]
pub struct ReplyListParams {
    pub followup_job_id: Option<Uuid>,
    pub search: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Midnight UTC of a `YYYY-MM-DD` query value
fn parse_day(field: &'static str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        StoreError::validation(field, format!("{} must be formatted YYYY-MM-DD", field))
    })?;
    Ok(Some(day.and_time(NaiveTime::MIN).and_utc()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Worker pass: the job must also be due.
    Due,
    /// Manual send-now: ignores `scheduled_at`.
    Immediate,
}

/// Outstanding dispatch lease on one job.
#[derive(Debug, Clone)]
pub struct DispatchClaim {
    pub token: Uuid,
    /// The job as it was right after the claim was taken
    pub job: Model,
}

impl DispatchClaim {
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// One-based attempt number within the current retry cycle
    pub fn attempt(&self) -> i32 {
        self.job.attempts
    }
}

/// Classified reason a claimed dispatch did not deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl DispatchFailure {
    pub fn connection_inactive(status: &str) -> Self {
        Self {
            code: "connection_inactive",
            message: format!("Connection is {}, not active", status),
            retryable: false,
        }
    }

    pub fn connection_missing() -> Self {
        Self {
            code: "connection_inactive",
            message: "Connection no longer exists".to_string(),
            retryable: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// Back to `pending` with a later `scheduled_at`
    Rescheduled(Model),
    /// Terminal `failed`
    Failed(Model),
    /// Job left its dispatchable state while the claim was out (cancelled);
    /// the failure is recorded but the status is untouched.
    Superseded(Model),
}

impl FailureOutcome {
    pub fn job(&self) -> &Model {
        match self {
            FailureOutcome::Rescheduled(job)
            | FailureOutcome::Failed(job)
            | FailureOutcome::Superseded(job) => job,
        }
    }
}

/// Audit entry for one claimed dispatch.
#[derive(Debug, Clone, Copy)]
pub enum AttemptRecord<'a> {
    Sent { provider_message_id: &'a str },
    Failed(&'a DispatchFailure),
}

/// Which job a reply belongs to.
#[derive(Debug, Clone)]
pub enum ReplyTarget {
    Job(Uuid),
    /// Most recent repliable job for this user and recipient
    Recipient { user_id: Uuid, recipient: String },
}

#[derive(Debug, Clone, Default)]
pub struct ReplyDetails {
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub reply: reply::Model,
    pub job: Model,
    pub cancelled_job_ids: Vec<Uuid>,
}

fn dispatchable_statuses() -> Vec<&'static str> {
    FollowUpStatus::ALL
        .into_iter()
        .filter(FollowUpStatus::is_dispatchable)
        .map(|status| status.as_str())
        .collect()
}

fn claimed_send_statuses() -> Vec<&'static str> {
    FollowUpStatus::ALL
        .into_iter()
        .filter(FollowUpStatus::accepts_claimed_send)
        .map(|status| status.as_str())
        .collect()
}

pub(crate) fn parse_status(job: &Model) -> Result<FollowUpStatus, StoreError> {
    job.status().map_err(|e| StoreError::Database(DbErr::Custom(e.to_string())))
}

/// Repository for follow-up job persistence and transitions
#[derive(Debug, Clone)]
pub struct FollowUpStore {
    db: DatabaseConnection,
}

impl FollowUpStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Validates and inserts a `pending` job due `delay_hours` from now.
    pub async fn enqueue(&self, user_id: Uuid, new: NewFollowUp) -> Result<Model, StoreError> {
        let recipient = new.recipient.trim().to_ascii_lowercase();
        if !is_valid_email(&recipient) {
            return Err(StoreError::validation(
                "recipient",
                "recipient must be a valid email address",
            ));
        }

        let original_subject = new.original_subject.trim().to_string();
        if original_subject.is_empty() {
            return Err(StoreError::validation(
                "original_subject",
                "original_subject must not be empty",
            ));
        }

        let delay_hours = new.delay_hours.unwrap_or(DEFAULT_DELAY_HOURS);
        if !(MIN_DELAY_HOURS..=MAX_DELAY_HOURS).contains(&delay_hours) {
            return Err(StoreError::validation(
                "delay_hours",
                format!(
                    "delay_hours must be between {} and {}",
                    MIN_DELAY_HOURS, MAX_DELAY_HOURS
                ),
            ));
        }

        let max_followups = new.max_followups.unwrap_or(MIN_FOLLOWUPS);
        if !(MIN_FOLLOWUPS..=MAX_FOLLOWUPS).contains(&max_followups) {
            return Err(StoreError::validation(
                "max_followups",
                format!(
                    "max_followups must be between {} and {}",
                    MIN_FOLLOWUPS, MAX_FOLLOWUPS
                ),
            ));
        }

        let tone = match new.tone.as_deref() {
            None => Tone::default(),
            Some(raw) => raw.parse::<Tone>().map_err(|_| {
                StoreError::validation(
                    "tone",
                    "tone must be one of professional, friendly, urgent",
                )
            })?,
        };

        let connection = self.resolve_connection(user_id, new.connection_id).await?;

        let now = Utc::now();
        let job = followup_job::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            connection_id: Set(connection.id),
            recipient: Set(recipient),
            original_subject: Set(original_subject),
            original_body: Set(new.original_body),
            original_message_id: Set(new.original_message_id),
            delay_hours: Set(delay_hours),
            tone: Set(tone.as_str().to_string()),
            max_followups: Set(max_followups),
            stop_on_reply: Set(new.stop_on_reply.unwrap_or(true)),
            draft_subject: Set(new.draft_subject),
            draft_body: Set(new.draft_body),
            status: Set(FollowUpStatus::Pending.as_str().to_string()),
            scheduled_at: Set((now + Duration::hours(i64::from(delay_hours))).fixed_offset()),
            sent_at: Set(None),
            provider_message_id: Set(None),
            reply_received_at: Set(None),
            failure_count: Set(0),
            attempts: Set(0),
            last_error: Set(None),
            claim_token: Set(None),
            claimed_at: Set(None),
            created_at: Set(now.fixed_offset()),
            updated_at: Set(now.fixed_offset()),
        };

        let created = job.insert(&self.db).await?;

        tracing::info!(
            user_id = %user_id,
            job_id = %created.id,
            connection_id = %created.connection_id,
            scheduled_at = %created.scheduled_at,
            "Follow-up scheduled"
        );

        Ok(created)
    }

    async fn resolve_connection(
        &self,
        user_id: Uuid,
        connection_id: Option<Uuid>,
    ) -> Result<connection::Model, StoreError> {
        let Some(connection_id) = connection_id else {
            return Connection::find()
                .filter(connection::Column::UserId.eq(user_id))
                .filter(connection::Column::Status.eq("active"))
                .order_by_asc(connection::Column::CreatedAt)
                .order_by_asc(connection::Column::Id)
                .one(&self.db)
                .await?
                .ok_or_else(|| StoreError::ConnectionInactive {
                    status: "missing".to_string(),
                });
        };

        let connection = Connection::find_by_id(connection_id)
            .filter(connection::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound {
                resource: "Connection",
            })?;

        if !connection.is_active() {
            return Err(StoreError::ConnectionInactive {
                status: connection.status.clone(),
            });
        }

        Ok(connection)
    }

    /// Dispatchable, unclaimed jobs due at `now`, oldest first.
    pub async fn list_due(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Model>, StoreError> {
        Ok(FollowUpJob::find()
            .filter(Column::Status.is_in(dispatchable_statuses()))
            .filter(Column::ScheduledAt.lte(now.fixed_offset()))
            .filter(Column::ClaimToken.is_null())
            .order_by_asc(Column::ScheduledAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Takes the dispatch lease on a job. `None` means another dispatcher
    /// holds it or the job is no longer eligible.
    pub async fn claim(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
        mode: ClaimMode,
    ) -> Result<Option<DispatchClaim>, StoreError> {
        let token = Uuid::new_v4();
        let now = now.fixed_offset();

        let mut update = FollowUpJob::update_many()
            .col_expr(Column::ClaimToken, Expr::value(Some(token)))
            .col_expr(Column::ClaimedAt, Expr::value(Some(now)))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(dispatchable_statuses()))
            .filter(Column::ClaimToken.is_null());

        if mode == ClaimMode::Due {
            update = update.filter(Column::ScheduledAt.lte(now));
        }

        let result = update.exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Ok(None);
        }

        let job = FollowUpJob::find_by_id(job_id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound {
                resource: "Follow-up",
            })?;

        tracing::debug!(job_id = %job_id, attempt = job.attempts, ?mode, "Dispatch claim taken");

        Ok(Some(DispatchClaim { token, job }))
    }

    /// Records a delivered send. Repeating the call on a `sent` job is a no-op.
    pub async fn mark_sent(
        &self,
        claim: &DispatchClaim,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<Model, StoreError> {
        let current = self.get(claim.job_id()).await?.ok_or(StoreError::NotFound {
            resource: "Follow-up",
        })?;
        let status = parse_status(&current)?;

        if status == FollowUpStatus::Sent {
            return Ok(current);
        }
        if current.claim_token != Some(claim.token) {
            return Err(StoreError::Conflict(
                "dispatch claim is no longer held".to_string(),
            ));
        }
        if status == FollowUpStatus::Replied {
            return self
                .record_send_after_reply(claim, provider_message_id, sent_at)
                .await;
        }
        if !status.accepts_claimed_send() {
            return Err(StoreError::invalid_state("mark as sent", &current.status));
        }

        let result = FollowUpJob::update_many()
            .col_expr(Column::Status, Expr::value(FollowUpStatus::Sent.as_str()))
            .col_expr(Column::SentAt, Expr::value(Some(sent_at.fixed_offset())))
            .col_expr(
                Column::ProviderMessageId,
                Expr::value(Some(provider_message_id.to_string())),
            )
            .col_expr(Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::ClaimedAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(claim.job_id()))
            .filter(Column::ClaimToken.eq(claim.token))
            .filter(Column::Status.is_in(claimed_send_statuses()))
            .exec(&self.db)
            .await?;

        let updated = self.get(claim.job_id()).await?.ok_or(StoreError::NotFound {
            resource: "Follow-up",
        })?;

        if result.rows_affected == 0 {
            if updated.status == FollowUpStatus::Sent.as_str() {
                return Ok(updated);
            }
            if updated.status == FollowUpStatus::Replied.as_str()
                && updated.claim_token == Some(claim.token)
            {
                return self
                    .record_send_after_reply(claim, provider_message_id, sent_at)
                    .await;
            }
            return Err(StoreError::Conflict(format!(
                "follow-up moved to {} while sending",
                updated.status
            )));
        }

        if status == FollowUpStatus::Cancelled {
            counter!("followups_send_conflicts_total").increment(1);
            tracing::warn!(
                job_id = %claim.job_id(),
                user_id = %updated.user_id,
                "Follow-up was cancelled while its send was in flight; recorded as sent"
            );
        }

        Ok(updated)
    }

    /// A reply landed while the send was in flight. The job stays `replied`;
    /// the delivery receipt is kept and the claim released.
    async fn record_send_after_reply(
        &self,
        claim: &DispatchClaim,
        provider_message_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<Model, StoreError> {
        let result = FollowUpJob::update_many()
            .col_expr(Column::SentAt, Expr::value(Some(sent_at.fixed_offset())))
            .col_expr(
                Column::ProviderMessageId,
                Expr::value(Some(provider_message_id.to_string())),
            )
            .col_expr(Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::ClaimedAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(claim.job_id()))
            .filter(Column::ClaimToken.eq(claim.token))
            .filter(Column::Status.eq(FollowUpStatus::Replied.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::Conflict(
                "dispatch claim is no longer held".to_string(),
            ));
        }

        let updated = self.get(claim.job_id()).await?.ok_or(StoreError::NotFound {
            resource: "Follow-up",
        })?;

        counter!("followups_send_conflicts_total").increment(1);
        tracing::warn!(
            job_id = %claim.job_id(),
            user_id = %updated.user_id,
            "Reply arrived while the follow-up was being sent; kept replied"
        );

        Ok(updated)
    }

    /// Records a failed attempt and moves the job along the retry ladder.
    pub async fn mark_failed(
        &self,
        claim: &DispatchClaim,
        failure: &DispatchFailure,
        attempt_number: i32,
    ) -> Result<FailureOutcome, StoreError> {
        let now = Utc::now();
        let next_delay = if failure.retryable {
            retry_delay(attempt_number)
        } else {
            None
        };
        let next_status = if next_delay.is_some() {
            FollowUpStatus::Pending
        } else {
            FollowUpStatus::Failed
        };
        let last_error = if failure.retryable && next_delay.is_none() {
            format!("Max retries exceeded: {}", failure.message)
        } else {
            failure.message.clone()
        };

        let mut update = FollowUpJob::update_many()
            .col_expr(Column::Status, Expr::value(next_status.as_str()))
            .col_expr(Column::FailureCount, Expr::col(Column::FailureCount).add(1))
            .col_expr(Column::LastError, Expr::value(Some(last_error)))
            .col_expr(Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::ClaimedAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()));
        if let Some(delay) = next_delay {
            update = update.col_expr(Column::ScheduledAt, Expr::value((now + delay).fixed_offset()));
        }

        let result = update
            .filter(Column::Id.eq(claim.job_id()))
            .filter(Column::ClaimToken.eq(claim.token))
            .filter(Column::Status.is_in(dispatchable_statuses()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return self.record_superseded_failure(claim, failure).await;
        }

        let job = self.get(claim.job_id()).await?.ok_or(StoreError::NotFound {
            resource: "Follow-up",
        })?;

        Ok(match next_status {
            FollowUpStatus::Pending => FailureOutcome::Rescheduled(job),
            _ => FailureOutcome::Failed(job),
        })
    }

    async fn record_superseded_failure(
        &self,
        claim: &DispatchClaim,
        failure: &DispatchFailure,
    ) -> Result<FailureOutcome, StoreError> {
        let result = FollowUpJob::update_many()
            .col_expr(Column::FailureCount, Expr::col(Column::FailureCount).add(1))
            .col_expr(Column::LastError, Expr::value(Some(failure.message.clone())))
            .col_expr(Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::ClaimedAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(claim.job_id()))
            .filter(Column::ClaimToken.eq(claim.token))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::Conflict(
                "dispatch claim is no longer held".to_string(),
            ));
        }

        let job = self.get(claim.job_id()).await?.ok_or(StoreError::NotFound {
            resource: "Follow-up",
        })?;
        Ok(FailureOutcome::Superseded(job))
    }

    /// Cancels a `pending`/`scheduled` job. An in-flight claim is left alone.
    pub async fn cancel(&self, user_id: Uuid, job_id: Uuid) -> Result<Model, StoreError> {
        let job = self.find_for_user(user_id, job_id).await?;
        if !parse_status(&job)?.can_transition_to(FollowUpStatus::Cancelled) {
            return Err(StoreError::invalid_state("cancel", &job.status));
        }

        let result = FollowUpJob::update_many()
            .col_expr(Column::Status, Expr::value(FollowUpStatus::Cancelled.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(FollowUpStatus::sources_of_as_str(
                FollowUpStatus::Cancelled,
            )))
            .exec(&self.db)
            .await?;

        let updated = self.find_for_user(user_id, job_id).await?;
        if result.rows_affected == 0 {
            return Err(StoreError::invalid_state("cancel", &updated.status));
        }

        tracing::info!(user_id = %user_id, job_id = %job_id, "Follow-up cancelled");
        Ok(updated)
    }

    /// Records an inbound reply and cancels the user's other pending follow-ups
    /// to the same recipient when the replied job or the sibling itself has
    /// `stop_on_reply`. All-or-nothing.
    pub async fn record_reply(
        &self,
        target: ReplyTarget,
        details: ReplyDetails,
    ) -> Result<ReplyOutcome, StoreError> {
        let txn = self.db.begin().await?;
        let repliable = FollowUpStatus::sources_of_as_str(FollowUpStatus::Replied);

        let job = match target {
            ReplyTarget::Job(job_id) => FollowUpJob::find_by_id(job_id).one(&txn).await?,
            ReplyTarget::Recipient { user_id, recipient } => {
                FollowUpJob::find()
                    .filter(Column::UserId.eq(user_id))
                    .filter(Column::Recipient.eq(recipient.trim().to_ascii_lowercase()))
                    .filter(Column::Status.is_in(repliable.clone()))
                    .order_by_desc(Column::CreatedAt)
                    .one(&txn)
                    .await?
            }
        }
        .ok_or(StoreError::NotFound {
            resource: "Follow-up",
        })?;

        if !parse_status(&job)?.can_transition_to(FollowUpStatus::Replied) {
            return Err(StoreError::invalid_state("record a reply on", &job.status));
        }

        let now = Utc::now().fixed_offset();
        let received_at = details
            .received_at
            .map(|at| at.fixed_offset())
            .unwrap_or(now);

        let subject = if details.subject.trim().is_empty() {
            format!(
                "Re: {}",
                job.draft_subject
                    .as_deref()
                    .unwrap_or(&job.original_subject)
            )
        } else {
            details.subject
        };
        let in_reply_to = details
            .in_reply_to
            .filter(|id| !id.trim().is_empty())
            .or_else(|| job.original_message_id.clone());

        let reply = reply::ActiveModel {
            id: Set(Uuid::new_v4()),
            followup_job_id: Set(job.id),
            user_id: Set(job.user_id),
            from_email: Set(details
                .from_email
                .map(|email| email.trim().to_ascii_lowercase())
                .unwrap_or_else(|| job.recipient.clone())),
            from_name: Set(details.from_name),
            subject: Set(subject),
            body: Set(details.body),
            message_id: Set(details.message_id),
            in_reply_to: Set(in_reply_to),
            received_at: Set(received_at),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let result = FollowUpJob::update_many()
            .col_expr(Column::Status, Expr::value(FollowUpStatus::Replied.as_str()))
            .col_expr(Column::ReplyReceivedAt, Expr::value(Some(received_at)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job.id))
            .filter(Column::Status.is_in(repliable))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(StoreError::Conflict(
                "follow-up changed while recording the reply".to_string(),
            ));
        }

        // A sibling stops if either side asked to stop on reply
        let cancellable = FollowUpStatus::sources_of_as_str(FollowUpStatus::Cancelled);
        let mut siblings = FollowUpJob::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::UserId.eq(job.user_id))
            .filter(Column::Recipient.eq(job.recipient.clone()))
            .filter(Column::Id.ne(job.id))
            .filter(Column::Status.is_in(cancellable.clone()));
        if !job.stop_on_reply {
            siblings = siblings.filter(Column::StopOnReply.eq(true));
        }
        let cancelled_job_ids = siblings.into_tuple::<Uuid>().all(&txn).await?;

        if !cancelled_job_ids.is_empty() {
            FollowUpJob::update_many()
                .col_expr(Column::Status, Expr::value(FollowUpStatus::Cancelled.as_str()))
                .col_expr(
                    Column::LastError,
                    Expr::value(Some(format!(
                        "Cancelled: reply received to follow-up {}",
                        job.id
                    ))),
                )
                .col_expr(Column::UpdatedAt, Expr::value(now))
                .filter(Column::Id.is_in(cancelled_job_ids.clone()))
                .filter(Column::Status.is_in(cancellable))
                .exec(&txn)
                .await?;
        }

        let job = FollowUpJob::find_by_id(job.id)
            .one(&txn)
            .await?
            .ok_or(StoreError::NotFound {
                resource: "Follow-up",
            })?;

        txn.commit().await?;

        tracing::info!(
            user_id = %job.user_id,
            job_id = %job.id,
            cancelled = cancelled_job_ids.len(),
            "Reply recorded"
        );

        Ok(ReplyOutcome {
            reply,
            job,
            cancelled_job_ids,
        })
    }

    /// Puts a `failed` job back in the queue, due immediately, with a fresh
    /// retry ladder. `failure_count` and `last_error` are kept.
    pub async fn reset_for_retry(&self, user_id: Uuid, job_id: Uuid) -> Result<Model, StoreError> {
        let job = self.find_for_user(user_id, job_id).await?;
        if parse_status(&job)? != FollowUpStatus::Failed {
            return Err(StoreError::invalid_state("retry", &job.status));
        }

        let now = Utc::now().fixed_offset();
        let result = FollowUpJob::update_many()
            .col_expr(Column::Status, Expr::value(FollowUpStatus::Pending.as_str()))
            .col_expr(Column::ScheduledAt, Expr::value(now))
            .col_expr(Column::Attempts, Expr::value(0))
            .col_expr(Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::ClaimedAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(FollowUpStatus::Failed.as_str()))
            .exec(&self.db)
            .await?;

        let updated = self.find_for_user(user_id, job_id).await?;
        if result.rows_affected == 0 {
            return Err(StoreError::invalid_state("retry", &updated.status));
        }

        tracing::info!(
            user_id = %user_id,
            job_id = %job_id,
            failure_count = updated.failure_count,
            "Follow-up queued for retry"
        );
        Ok(updated)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Model>, StoreError> {
        Ok(FollowUpJob::find_by_id(job_id).one(&self.db).await?)
    }

    /// A job owned by `user_id`; someone else's job is indistinguishable from
    /// a missing one.
    pub async fn find_for_user(&self, user_id: Uuid, job_id: Uuid) -> Result<Model, StoreError> {
        FollowUpJob::find_by_id(job_id)
            .filter(Column::UserId.eq(user_id))
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound {
                resource: "Follow-up",
            })
    }

    /// Newest first
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        params: ListParams,
    ) -> Result<Vec<Model>, StoreError> {
        let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(StoreError::validation(
                "limit",
                format!("limit must be between 1 and {}", MAX_LIST_LIMIT),
            ));
        }

        let mut query = FollowUpJob::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id);

        if let Some(raw) = params.status.as_deref().filter(|s| !s.is_empty()) {
            let status = raw.parse::<FollowUpStatus>().map_err(|_| {
                StoreError::validation(
                    "status",
                    "status must be one of pending, scheduled, sent, replied, cancelled, failed",
                )
            })?;
            query = query.filter(Column::Status.eq(status.as_str()));
        }

        Ok(query
            .offset(params.offset.unwrap_or(0))
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Replies received by a user, newest first.
    pub async fn list_replies(
        &self,
        user_id: Uuid,
        params: ReplyListParams,
    ) -> Result<Vec<reply::Model>, StoreError> {
        let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(StoreError::validation(
                "limit",
                format!("limit must be between 1 and {}", MAX_LIST_LIMIT),
            ));
        }

        let mut query = reply::Entity::find().filter(reply::Column::UserId.eq(user_id));

        if let Some(search) = params.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            query = query.filter(
                Condition::any()
                    .add(reply::Column::FromEmail.contains(search.to_ascii_lowercase()))
                    .add(reply::Column::Subject.contains(search))
                    .add(reply::Column::Body.contains(search)),
            );
        }
        if let Some(start) = parse_day("start_date", params.start_date.as_deref())? {
            query = query.filter(reply::Column::ReceivedAt.gte(start.fixed_offset()));
        }
        if let Some(end) = parse_day("end_date", params.end_date.as_deref())? {
            // The whole end day is included
            query = query.filter(reply::Column::ReceivedAt.lt((end + Duration::days(1)).fixed_offset()));
        }
        if let Some(job_id) = params.followup_job_id {
            query = query.filter(reply::Column::FollowupJobId.eq(job_id));
        }

        Ok(query
            .order_by_desc(reply::Column::ReceivedAt)
            .order_by_desc(reply::Column::Id)
            .offset(params.offset.unwrap_or(0))
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn find_reply(&self, user_id: Uuid, reply_id: Uuid) -> Result<reply::Model, StoreError> {
        reply::Entity::find_by_id(reply_id)
            .filter(reply::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound { resource: "Reply" })
    }

    /// Attaches generated copy to a job that has not gone out yet.
    pub async fn store_draft(
        &self,
        user_id: Uuid,
        job_id: Uuid,
        subject: &str,
        body: &str,
    ) -> Result<Model, StoreError> {
        let job = self.find_for_user(user_id, job_id).await?;
        if !parse_status(&job)?.is_dispatchable() {
            return Err(StoreError::invalid_state("draft", &job.status));
        }

        let mut model: followup_job::ActiveModel = job.into();
        model.draft_subject = Set(Some(subject.to_string()));
        model.draft_body = Set(Some(body.to_string()));
        model.updated_at = Set(Utc::now().fixed_offset());

        Ok(model.update(&self.db).await?)
    }

    /// Claims older than `older_than` that were never released. These are
    /// sends whose outcome was never written and must not be retried blindly.
    pub async fn stale_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Model>, StoreError> {
        Ok(FollowUpJob::find()
            .filter(Column::ClaimToken.is_not_null())
            .filter(Column::ClaimedAt.lt(older_than.fixed_offset()))
            .order_by_asc(Column::ClaimedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn record_attempt(
        &self,
        claim: &DispatchClaim,
        record: AttemptRecord<'_>,
    ) -> Result<send_attempt::Model, StoreError> {
        let (outcome, error_code, error_message, provider_message_id) = match record {
            AttemptRecord::Sent {
                provider_message_id,
            } => ("sent", None, None, Some(provider_message_id.to_string())),
            AttemptRecord::Failed(failure) => (
                "failed",
                Some(failure.code.to_string()),
                Some(failure.message.clone()),
                None,
            ),
        };

        Ok(send_attempt::ActiveModel {
            id: Set(Uuid::new_v4()),
            followup_job_id: Set(claim.job_id()),
            attempt_number: Set(claim.attempt()),
            outcome: Set(outcome.to_string()),
            error_code: Set(error_code),
            error_message: Set(error_message),
            provider_message_id: Set(provider_message_id),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.db)
        .await?)
    }

    /// Audit rows for one job, oldest first
    pub async fn attempts_for(&self, job_id: Uuid) -> Result<Vec<send_attempt::Model>, StoreError> {
        Ok(send_attempt::Entity::find()
            .filter(send_attempt::Column::FollowupJobId.eq(job_id))
            .order_by_asc(send_attempt::Column::CreatedAt)
            .order_by_asc(send_attempt::Column::AttemptNumber)
            .all(&self.db)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn ladder_is_one_five_fifteen_minutes() {
        assert_eq!(retry_delay(1), Some(Duration::minutes(1)));
        assert_eq!(retry_delay(2), Some(Duration::minutes(5)));
        assert_eq!(retry_delay(3), Some(Duration::minutes(15)));
        assert_eq!(retry_delay(4), None);
        assert_eq!(retry_delay(0), None);
        assert_eq!(retry_delay(-1), None);
    }

    #[test]
    fn email_shape() {
        assert!(is_valid_email("jane@example.com"));
        assert!(is_valid_email("a.b+c@sub.example.co"));
        assert!(!is_valid_email("jane@example"));
        assert!(!is_valid_email("jane example@x.com"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn reply_dates_parse_as_utc_midnight() {
        let day = parse_day("start_date", Some("2025-03-14")).unwrap().unwrap();
        assert_eq!(day.to_rfc3339(), "2025-03-14T00:00:00+00:00");
        assert!(parse_day("start_date", Some("  ")).unwrap().is_none());
        assert!(parse_day("start_date", None).unwrap().is_none());

        let err = parse_day("end_date", Some("14/03/2025")).unwrap_err();
        assert!(matches!(err, StoreError::Validation { field: "end_date", .. }));
    }

    #[test]
    fn store_errors_map_to_problem_codes() {
        let err: ApiError = StoreError::invalid_state("cancel", "sent").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(&*err.code, "INVALID_STATE");
        assert_eq!(&*err.message, "cannot cancel a follow-up that is sent");

        let err: ApiError = StoreError::NotFound {
            resource: "Follow-up",
        }
        .into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = StoreError::ConnectionInactive {
            status: "disabled".to_string(),
        }
        .into();
        assert_eq!(&*err.code, "CONNECTION_INACTIVE");

        let err: ApiError = StoreError::Conflict("claimed".to_string()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err: ApiError = StoreError::validation("tone", "bad tone").into();
        assert_eq!(&*err.code, "VALIDATION_FAILED");
        assert_eq!(err.details.as_deref(), Some(&json!({ "tone": "bad tone" })));
    }
}
