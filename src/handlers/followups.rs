//! # Follow-up API Handlers
//!
//! Scheduling, inspection and manual control of follow-up jobs. Every route is
//! scoped to the caller's `X-User-Id`; jobs owned by someone else read as 404.

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::dispatcher::DispatchOutcome;
use crate::drafts::{DraftError, DraftRequest};
use crate::error::{self, ApiError};
use crate::models::followup_job::{Model as FollowUpJob, Tone};
use crate::models::reply::Model as Reply;
use crate::models::send_attempt::Model as SendAttempt;
use crate::repositories::followup_job::{
    ListParams, NewFollowUp, ReplyDetails, ReplyListParams, ReplyOutcome, ReplyTarget, StoreError,
    parse_status,
};
use crate::server::AppState;

fn rfc3339(at: DateTimeWithTimeZone) -> String {
    at.with_timezone(&Utc).to_rfc3339()
}

/// Path parameters for follow-up operations
#[derive(Debug, Deserialize, IntoParams)]
pub struct FollowUpPath {
    /// Follow-up job ID
    pub id: Uuid,
}

/// Query parameters for listing follow-ups
#[derive(Debug, Default, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct ListFollowUpsQuery {
    /// Filter by status (`pending`, `scheduled`, `sent`, `replied`, `cancelled`, `failed`)
    pub status: Option<String>,
    /// Maximum number of jobs to return (default: 50, max: 100)
    pub limit: Option<u64>,
    /// Number of jobs to skip (default: 0)
    pub offset: Option<u64>,
}

/// Request body for scheduling a follow-up
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct CreateFollowUpRequest {
    /// Connection to send through; defaults to the caller's oldest active connection
    #[schema(value_type = Option<String>)]
    pub connection_id: Option<Uuid>,
    #[schema(example = "bob@example.com")]
    pub recipient: String,
    #[schema(example = "Proposal for Q3")]
    pub original_subject: String,
    pub original_body: Option<String>,
    /// Message-ID of the original email
    pub original_message_id: Option<String>,
    /// Hours to wait before sending (1..=168, default 24)
    #[schema(example = 24)]
    pub delay_hours: Option<i32>,
    /// `professional` (default), `friendly` or `urgent`
    pub tone: Option<String>,
    /// 1..=5, default 1
    pub max_followups: Option<i32>,
    /// Cancel sibling follow-ups when a reply arrives (default true)
    pub stop_on_reply: Option<bool>,
    pub draft_subject: Option<String>,
    pub draft_body: Option<String>,
}

impl From<CreateFollowUpRequest> for NewFollowUp {
    fn from(request: CreateFollowUpRequest) -> Self {
        Self {
            connection_id: request.connection_id,
            recipient: request.recipient,
            original_subject: request.original_subject,
            original_body: request.original_body,
            original_message_id: request.original_message_id,
            delay_hours: request.delay_hours,
            tone: request.tone,
            max_followups: request.max_followups,
            stop_on_reply: request.stop_on_reply,
            draft_subject: request.draft_subject,
            draft_body: request.draft_body,
        }
    }
}

/// Follow-up job as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FollowUpInfo {
    #[schema(value_type = String)]
    pub id: Uuid,
    #[schema(value_type = String)]
    pub connection_id: Uuid,
    pub recipient: String,
    pub original_subject: String,
    pub original_body: Option<String>,
    pub original_message_id: Option<String>,
    pub delay_hours: i32,
    pub tone: String,
    pub max_followups: i32,
    pub stop_on_reply: bool,
    pub draft_subject: Option<String>,
    pub draft_body: Option<String>,
    #[schema(example = "pending")]
    pub status: String,
    /// RFC3339 time the job becomes due
    pub scheduled_at: String,
    pub sent_at: Option<String>,
    pub provider_message_id: Option<String>,
    pub reply_received_at: Option<String>,
    pub failure_count: i32,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// A dispatch currently holds the job
    pub in_flight: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<FollowUpJob> for FollowUpInfo {
    fn from(job: FollowUpJob) -> Self {
        Self {
            id: job.id,
            connection_id: job.connection_id,
            recipient: job.recipient,
            original_subject: job.original_subject,
            original_body: job.original_body,
            original_message_id: job.original_message_id,
            delay_hours: job.delay_hours,
            tone: job.tone,
            max_followups: job.max_followups,
            stop_on_reply: job.stop_on_reply,
            draft_subject: job.draft_subject,
            draft_body: job.draft_body,
            status: job.status,
            scheduled_at: rfc3339(job.scheduled_at),
            sent_at: job.sent_at.map(rfc3339),
            provider_message_id: job.provider_message_id,
            reply_received_at: job.reply_received_at.map(rfc3339),
            failure_count: job.failure_count,
            attempts: job.attempts,
            last_error: job.last_error,
            in_flight: job.claim_token.is_some(),
            created_at: rfc3339(job.created_at),
            updated_at: rfc3339(job.updated_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FollowUpsResponse {
    pub followups: Vec<FollowUpInfo>,
}

/// Result of a manual send
#[derive(Debug, Serialize, ToSchema)]
pub struct SendNowResponse {
    pub job: FollowUpInfo,
    pub outcome: DispatchOutcome,
}

/// Inbound reply details
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct RecordReplyRequest {
    /// Sender of the reply; defaults to the job's recipient
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    /// RFC3339; defaults to now
    #[schema(value_type = Option<String>)]
    pub received_at: Option<DateTime<Utc>>,
}

impl From<RecordReplyRequest> for ReplyDetails {
    fn from(request: RecordReplyRequest) -> Self {
        Self {
            from_email: request.from_email,
            from_name: request.from_name,
            subject: request.subject,
            body: request.body,
            message_id: request.message_id,
            in_reply_to: request.in_reply_to,
            received_at: request.received_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReplyInfo {
    #[schema(value_type = String)]
    pub id: Uuid,
    #[schema(value_type = String)]
    pub followup_job_id: Uuid,
    pub from_email: String,
    pub from_name: Option<String>,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub received_at: String,
}

impl From<Reply> for ReplyInfo {
    fn from(reply: Reply) -> Self {
        Self {
            id: reply.id,
            followup_job_id: reply.followup_job_id,
            from_email: reply.from_email,
            from_name: reply.from_name,
            subject: reply.subject,
            body: reply.body,
            message_id: reply.message_id,
            in_reply_to: reply.in_reply_to,
            received_at: rfc3339(reply.received_at),
        }
    }
}

/// Path parameters for reply lookups
#[derive(Debug, Deserialize, IntoParams)]
pub struct ReplyPath {
    /// Reply ID
    pub id: Uuid,
}

/// Query parameters for listing replies
#[derive(Debug, Default, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct ListRepliesQuery {
    /// Only replies to this follow-up
    #[schema(value_type = Option<String>)]
    pub followup_job_id: Option<Uuid>,
    /// Matches the sender, subject or body
    pub search: Option<String>,
    /// Earliest day received, `YYYY-MM-DD`
    pub start_date: Option<String>,
    /// Latest day received, `YYYY-MM-DD` (inclusive)
    pub end_date: Option<String>,
    /// Maximum number of replies to return (default: 50, max: 100)
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RepliesResponse {
    pub replies: Vec<ReplyInfo>,
}

/// One audited dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttemptInfo {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub attempt_number: i32,
    /// `sent` or `failed`
    pub outcome: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: String,
}

impl From<SendAttempt> for AttemptInfo {
    fn from(attempt: SendAttempt) -> Self {
        Self {
            id: attempt.id,
            attempt_number: attempt.attempt_number,
            outcome: attempt.outcome,
            error_code: attempt.error_code,
            error_message: attempt.error_message,
            provider_message_id: attempt.provider_message_id,
            created_at: rfc3339(attempt.created_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AttemptsResponse {
    pub attempts: Vec<AttemptInfo>,
}

/// Recorded reply plus the cascade it triggered
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReplyResponse {
    pub reply: ReplyInfo,
    pub job: FollowUpInfo,
    #[schema(value_type = Vec<String>)]
    pub cancelled_job_ids: Vec<Uuid>,
}

impl From<ReplyOutcome> for ReplyResponse {
    fn from(outcome: ReplyOutcome) -> Self {
        Self {
            reply: outcome.reply.into(),
            job: outcome.job.into(),
            cancelled_job_ids: outcome.cancelled_job_ids,
        }
    }
}

/// Options for draft generation; every field is optional
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
#[serde(default)]
pub struct GenerateDraftRequest {
    /// Overrides the job's tone
    pub tone: Option<Tone>,
    pub recipient_name: Option<String>,
    /// Notes on the sender's writing style
    pub voice: Option<String>,
}

/// Schedules a follow-up
#[utoipa::path(
    post,
    path = "/followups",
    security(("bearer_auth" = [])),
    params(UserHeader),
    request_body = CreateFollowUpRequest,
    responses(
        (status = 201, description = "Follow-up scheduled", body = FollowUpInfo),
        (status = 400, description = "Validation failed or connection inactive", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn create_followup(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    payload: Result<Json<CreateFollowUpRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<FollowUpInfo>), ApiError> {
    let Json(request) = payload?;
    let job = state.followups.enqueue(user.0, request.into()).await?;
    Ok((StatusCode::CREATED, Json(job.into())))
}

/// Lists the caller's follow-ups, newest first
#[utoipa::path(
    get,
    path = "/followups",
    security(("bearer_auth" = [])),
    params(UserHeader, ListFollowUpsQuery),
    responses(
        (status = 200, description = "Follow-ups", body = FollowUpsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn list_followups(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Query(query): Query<ListFollowUpsQuery>,
) -> Result<Json<FollowUpsResponse>, ApiError> {
    debug!(
        "Listing follow-ups for user {}: status={:?}, limit={:?}, offset={:?}",
        user.0, query.status, query.limit, query.offset
    );

    let jobs = state
        .followups
        .list_for_user(
            user.0,
            ListParams {
                status: query.status,
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await?;

    Ok(Json(FollowUpsResponse {
        followups: jobs.into_iter().map(FollowUpInfo::from).collect(),
    }))
}

/// Gets one follow-up
#[utoipa::path(
    get,
    path = "/followups/{id}",
    security(("bearer_auth" = [])),
    params(UserHeader, FollowUpPath),
    responses(
        (status = 200, description = "Follow-up", body = FollowUpInfo),
        (status = 404, description = "Follow-up not found", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn get_followup(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<FollowUpPath>,
) -> Result<Json<FollowUpInfo>, ApiError> {
    let job = state.followups.find_for_user(user.0, path.id).await?;
    Ok(Json(job.into()))
}

/// Cancels a pending follow-up
#[utoipa::path(
    post,
    path = "/followups/{id}/cancel",
    security(("bearer_auth" = [])),
    params(UserHeader, FollowUpPath),
    responses(
        (status = 200, description = "Follow-up cancelled", body = FollowUpInfo),
        (status = 400, description = "Follow-up can no longer be cancelled", body = ApiError),
        (status = 404, description = "Follow-up not found", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn cancel_followup(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<FollowUpPath>,
) -> Result<Json<FollowUpInfo>, ApiError> {
    let job = state.followups.cancel(user.0, path.id).await?;
    Ok(Json(job.into()))
}

/// Sends a pending follow-up immediately
#[utoipa::path(
    post,
    path = "/followups/{id}/send-now",
    security(("bearer_auth" = [])),
    params(UserHeader, FollowUpPath),
    responses(
        (status = 200, description = "Dispatch attempted; see outcome", body = SendNowResponse),
        (status = 400, description = "Follow-up is not pending", body = ApiError),
        (status = 404, description = "Follow-up not found", body = ApiError),
        (status = 409, description = "Follow-up is already being sent", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn send_now(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<FollowUpPath>,
) -> Result<Json<SendNowResponse>, ApiError> {
    let result = state.dispatcher.send_now(user.0, path.id).await?;
    Ok(Json(SendNowResponse {
        job: result.job.into(),
        outcome: result.outcome,
    }))
}

/// Re-queues a failed follow-up with a fresh retry ladder
#[utoipa::path(
    post,
    path = "/followups/{id}/retry",
    security(("bearer_auth" = [])),
    params(UserHeader, FollowUpPath),
    responses(
        (status = 200, description = "Follow-up queued", body = FollowUpInfo),
        (status = 400, description = "Follow-up is not failed", body = ApiError),
        (status = 404, description = "Follow-up not found", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn retry_followup(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<FollowUpPath>,
) -> Result<Json<FollowUpInfo>, ApiError> {
    let job = state.followups.reset_for_retry(user.0, path.id).await?;
    Ok(Json(job.into()))
}

/// Records a reply to a follow-up
#[utoipa::path(
    post,
    path = "/followups/{id}/replies",
    security(("bearer_auth" = [])),
    params(UserHeader, FollowUpPath),
    request_body = RecordReplyRequest,
    responses(
        (status = 201, description = "Reply recorded", body = ReplyResponse),
        (status = 400, description = "Follow-up cannot take a reply", body = ApiError),
        (status = 404, description = "Follow-up not found", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn record_reply(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<FollowUpPath>,
    payload: Result<Json<RecordReplyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ReplyResponse>), ApiError> {
    let Json(request) = payload?;
    let job = state.followups.find_for_user(user.0, path.id).await?;

    let outcome = state
        .followups
        .record_reply(ReplyTarget::Job(job.id), request.into())
        .await?;

    Ok((StatusCode::CREATED, Json(outcome.into())))
}

/// Records an inbound reply matched by its sender address
#[utoipa::path(
    post,
    path = "/replies",
    security(("bearer_auth" = [])),
    params(UserHeader),
    request_body = RecordReplyRequest,
    responses(
        (status = 201, description = "Reply recorded", body = ReplyResponse),
        (status = 400, description = "Missing sender", body = ApiError),
        (status = 404, description = "No follow-up to this sender awaits a reply", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn record_inbound_reply(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    payload: Result<Json<RecordReplyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ReplyResponse>), ApiError> {
    let Json(request) = payload?;
    let Some(sender) = request
        .from_email
        .clone()
        .filter(|email| !email.trim().is_empty())
    else {
        return Err(error::validation_error(
            "Missing sender",
            serde_json::json!({ "from_email": "Required to match a follow-up" }),
        ));
    };

    let outcome = state
        .followups
        .record_reply(
            ReplyTarget::Recipient {
                user_id: user.0,
                recipient: sender,
            },
            request.into(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(outcome.into())))
}

/// Generates and stores a draft for a pending follow-up
#[utoipa::path(
    post,
    path = "/followups/{id}/draft",
    security(("bearer_auth" = [])),
    params(UserHeader, FollowUpPath),
    request_body(content = GenerateDraftRequest, description = "Optional; an empty body uses the job's tone"),
    responses(
        (status = 200, description = "Draft stored on the job", body = FollowUpInfo),
        (status = 400, description = "Follow-up is not pending", body = ApiError),
        (status = 404, description = "Follow-up not found", body = ApiError),
        (status = 502, description = "Draft generator failed", body = ApiError),
        (status = 503, description = "Drafting is not configured", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn generate_draft(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<FollowUpPath>,
    payload: Result<Option<Json<GenerateDraftRequest>>, JsonRejection>,
) -> Result<Json<FollowUpInfo>, ApiError> {
    let request = payload?.map(|Json(request)| request).unwrap_or_default();

    let Some(generator) = state.drafts.clone() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "DRAFTS_UNAVAILABLE",
            "Draft generation is not configured",
        ));
    };

    let job = state.followups.find_for_user(user.0, path.id).await?;
    if !parse_status(&job)?.is_dispatchable() {
        return Err(StoreError::invalid_state("draft", &job.status).into());
    }

    let tone = match request.tone {
        Some(tone) => tone,
        None => job.tone.parse::<Tone>().unwrap_or_default(),
    };

    let draft = generator
        .generate(&DraftRequest {
            subject: job.original_subject.clone(),
            body: job.original_body.clone().unwrap_or_default(),
            tone,
            recipient_name: request.recipient_name,
            voice: request.voice,
        })
        .await
        .map_err(|err| {
            warn!(job_id = %job.id, error = %err, "Draft generation failed");
            let code = match err {
                DraftError::Http(_) => "request_failed",
                DraftError::Upstream { .. } => "upstream_error",
                DraftError::Parse(_) => "unparseable_draft",
            };
            error::provider_error("drafts", code, Some(err.to_string()))
        })?;

    let job = state
        .followups
        .store_draft(user.0, job.id, &draft.subject, &draft.body)
        .await?;

    Ok(Json(job.into()))
}

/// Dispatch attempts for a follow-up, oldest first
#[utoipa::path(
    get,
    path = "/followups/{id}/attempts",
    security(("bearer_auth" = [])),
    params(UserHeader, FollowUpPath),
    responses(
        (status = 200, description = "Attempt history", body = AttemptsResponse),
        (status = 404, description = "Follow-up not found", body = ApiError)
    ),
    tag = "followups"
)]
pub async fn list_attempts(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<FollowUpPath>,
) -> Result<Json<AttemptsResponse>, ApiError> {
    let job = state.followups.find_for_user(user.0, path.id).await?;
    let attempts = state.followups.attempts_for(job.id).await?;
    Ok(Json(AttemptsResponse {
        attempts: attempts.into_iter().map(AttemptInfo::from).collect(),
    }))
}

/// Lists replies received by the caller, newest first
#[utoipa::path(
    get,
    path = "/replies",
    security(("bearer_auth" = [])),
    params(UserHeader, ListRepliesQuery),
    responses(
        (status = 200, description = "Replies", body = RepliesResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError)
    ),
    tag = "replies"
)]
pub async fn list_replies(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Query(query): Query<ListRepliesQuery>,
) -> Result<Json<RepliesResponse>, ApiError> {
    let replies = state
        .followups
        .list_replies(
            user.0,
            ReplyListParams {
                followup_job_id: query.followup_job_id,
                search: query.search,
                start_date: query.start_date,
                end_date: query.end_date,
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await?;

    Ok(Json(RepliesResponse {
        replies: replies.into_iter().map(ReplyInfo::from).collect(),
    }))
}

/// Gets one reply
#[utoipa::path(
    get,
    path = "/replies/{id}",
    security(("bearer_auth" = [])),
    params(UserHeader, ReplyPath),
    responses(
        (status = 200, description = "Reply", body = ReplyInfo),
        (status = 404, description = "Reply not found", body = ApiError)
    ),
    tag = "replies"
)]
pub async fn get_reply(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<ReplyPath>,
) -> Result<Json<ReplyInfo>, ApiError> {
    let reply = state.followups.find_reply(user.0, path.id).await?;
    Ok(Json(reply.into()))
}
