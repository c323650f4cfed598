//! # Dispatch Worker
//!
//! Turns due follow-up jobs into sends. A pass lists due jobs oldest first,
//! claims each one, gates it on its connection, renders it and calls the
//! provider under a timeout. Failures walk the retry ladder in the store.
//! Each job is isolated: an error on one is logged and counted and the pass
//! moves on.
//!
//! Manual send-now goes through the same claim and [`DispatchWorker::dispatch_claimed`]
//! path, so a job racing between the worker and the API is sent at most once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{self, ApiError};
use crate::models::connection::{ConnectionStatus, Model as Connection};
use crate::models::followup_job::Model as FollowUpJob;
use crate::providers::{ProviderMessageId, ProviderRegistry, SendError};
use crate::repositories::connection::ConnectionRepository;
use crate::repositories::followup_job::{
    AttemptRecord, ClaimMode, DispatchClaim, DispatchFailure, FailureOutcome, FollowUpStore,
    StoreError, parse_status,
};
use crate::template;

/// Counters for one dispatch pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub due: u64,
    pub sent: u64,
    pub failed: u64,
    pub rescheduled: u64,
    /// Claimed elsewhere between listing and claiming
    pub skipped: u64,
    pub errors: u64,
}

impl PassStats {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent { .. } => self.sent += 1,
            DispatchOutcome::Rescheduled { .. } => self.rescheduled += 1,
            DispatchOutcome::Failed { .. } | DispatchOutcome::Superseded { .. } => {
                self.failed += 1
            }
        }
    }

    /// Whether anything in the pass ended badly
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.errors > 0
    }
}

/// Result of dispatching one claimed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent {
        provider_message_id: String,
    },
    Rescheduled {
        error_code: String,
        message: String,
        /// RFC3339 time of the next automatic attempt
        next_attempt_at: String,
    },
    Failed {
        error_code: String,
        message: String,
    },
    /// The job was cancelled while the failed send was in flight
    Superseded {
        error_code: String,
        message: String,
    },
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Sent { .. } => "sent",
            DispatchOutcome::Rescheduled { .. } => "rescheduled",
            DispatchOutcome::Failed { .. } => "failed",
            DispatchOutcome::Superseded { .. } => "superseded",
        }
    }
}

/// A send-now result: the job after dispatch and what happened
#[derive(Debug, Clone)]
pub struct SendNowResult {
    pub job: FollowUpJob,
    pub outcome: DispatchOutcome,
}

/// Failure of a test email or a connection validation
#[derive(Debug, Error)]
pub enum ConnectionCheckError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{provider}: {error}")]
    Send { provider: String, error: SendError },
}

impl From<ConnectionCheckError> for ApiError {
    fn from(err: ConnectionCheckError) -> Self {
        match err {
            ConnectionCheckError::Store(store) => store.into(),
            ConnectionCheckError::Send { provider, error } => {
                let api = error::provider_error(&provider, error.code(), Some(error.to_string()));
                match error {
                    SendError::RateLimited {
                        retry_after_secs: Some(secs),
                    } => api.with_retry_after(secs),
                    _ => api,
                }
            }
        }
    }
}

/// Worker context, built once per process and shared with the API.
pub struct DispatchWorker {
    store: FollowUpStore,
    connections: Arc<ConnectionRepository>,
    providers: ProviderRegistry,
    config: WorkerConfig,
    from_name: String,
}

impl DispatchWorker {
    pub fn new(
        store: FollowUpStore,
        connections: Arc<ConnectionRepository>,
        providers: ProviderRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            connections,
            providers,
            config,
            from_name: crate::config::ProviderConfig::default().default_from_name,
        }
    }

    /// Sender name used when a connection has no display name
    pub fn with_from_name(mut self, from_name: impl Into<String>) -> Self {
        self.from_name = from_name.into();
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run passes every `tick_interval` until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_interval_seconds = self.config.tick_interval_seconds,
            batch_size = self.config.batch_size,
            "Starting dispatch worker"
        );

        loop {
            if let Err(err) = self.run_once().await {
                error!(error = ?err, "Dispatch pass failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Dispatch worker shutdown requested");
                    break;
                }
                _ = sleep(self.config.tick_interval()) => {}
            }
        }

        info!("Dispatch worker stopped");
    }

    /// One pass over the due jobs.
    pub async fn run_once(&self) -> Result<PassStats, StoreError> {
        let started = Instant::now();
        let now = Utc::now();
        let mut stats = PassStats::default();

        self.report_stale_claims().await;

        let due = self.store.list_due(now, self.config.batch_size).await?;
        stats.due = due.len() as u64;
        gauge!("followups_due_jobs").set(due.len() as f64);

        for job in due {
            match self.store.claim(job.id, now, ClaimMode::Due).await {
                Ok(Some(claim)) => match self.dispatch_claimed(claim).await {
                    Ok(outcome) => stats.record(&outcome),
                    Err(err) => {
                        stats.errors += 1;
                        error!(job_id = %job.id, error = ?err, "Failed to dispatch follow-up");
                    }
                },
                Ok(None) => {
                    stats.skipped += 1;
                    debug!(job_id = %job.id, "Follow-up claimed elsewhere; skipping");
                }
                Err(err) => {
                    stats.errors += 1;
                    error!(job_id = %job.id, error = ?err, "Failed to claim follow-up");
                }
            }
        }

        histogram!("followups_pass_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        info!(
            due = stats.due,
            sent = stats.sent,
            rescheduled = stats.rescheduled,
            failed = stats.failed,
            skipped = stats.skipped,
            errors = stats.errors,
            "Dispatch pass completed"
        );

        Ok(stats)
    }

    async fn report_stale_claims(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(
                i64::try_from(self.config.stale_claim_seconds).unwrap_or(i64::MAX / 1_000),
            );

        match self.store.stale_claims(cutoff).await {
            Ok(stale) => {
                gauge!("followups_stale_claims").set(stale.len() as f64);
                for job in stale {
                    warn!(
                        job_id = %job.id,
                        user_id = %job.user_id,
                        claimed_at = ?job.claimed_at,
                        "Dispatch claim was never released; delivery unknown, reconcile manually"
                    );
                }
            }
            Err(err) => error!(error = ?err, "Failed to look up stale dispatch claims"),
        }
    }

    /// Dispatches a job this process holds the claim for.
    #[instrument(skip(self, claim), fields(job_id = %claim.job.id, attempt = claim.job.attempts))]
    pub async fn dispatch_claimed(&self, claim: DispatchClaim) -> Result<DispatchOutcome, StoreError> {
        let connection = match self.connections.get_by_id(claim.job.connection_id).await? {
            None => {
                return self
                    .fail(&claim, DispatchFailure::connection_missing())
                    .await;
            }
            Some(connection) if !connection.is_active() => {
                let failure = DispatchFailure::connection_inactive(&connection.status);
                return self.fail(&claim, failure).await;
            }
            Some(connection) => connection,
        };

        let message = template::compose_followup(&claim.job);

        match self.send(&connection, &message).await {
            Ok(provider_message_id) => self.succeed(&claim, &provider_message_id).await,
            Err(send_error) => {
                if send_error.is_connection_level()
                    && let Err(err) = self
                        .connections
                        .mark_error(&connection, &send_error.to_string())
                        .await
                {
                    error!(
                        connection_id = %connection.id,
                        error = ?err,
                        "Failed to mark connection as error"
                    );
                }
                self.fail(&claim, DispatchFailure::from(&send_error)).await
            }
        }
    }

    /// Provider call bounded by the send timeout
    async fn send(
        &self,
        connection: &Connection,
        message: &crate::providers::OutboundMessage,
    ) -> Result<ProviderMessageId, SendError> {
        let provider = self.providers.for_connection(connection)?;
        let limit: Duration = self.config.send_timeout();

        match timeout(limit, provider.send(connection, message)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(limit.as_secs())),
        }
    }

    async fn succeed(
        &self,
        claim: &DispatchClaim,
        provider_message_id: &str,
    ) -> Result<DispatchOutcome, StoreError> {
        if let Err(err) = self
            .store
            .mark_sent(claim, provider_message_id, Utc::now())
            .await
        {
            // Delivered but unrecorded: leave the claim so the job is never re-sent
            error!(
                job_id = %claim.job_id(),
                provider_message_id = %provider_message_id,
                error = ?err,
                "Email was sent but the status update failed; manual reconciliation required"
            );
            counter!("followups_dispatch_total", "outcome" => "unrecorded").increment(1);
            return Err(err);
        }

        self.audit(
            claim,
            AttemptRecord::Sent {
                provider_message_id,
            },
        )
        .await;

        counter!("followups_dispatch_total", "outcome" => "sent").increment(1);
        info!(
            job_id = %claim.job_id(),
            provider_message_id = %provider_message_id,
            "Follow-up sent"
        );

        Ok(DispatchOutcome::Sent {
            provider_message_id: provider_message_id.to_string(),
        })
    }

    async fn fail(
        &self,
        claim: &DispatchClaim,
        failure: DispatchFailure,
    ) -> Result<DispatchOutcome, StoreError> {
        let result = self
            .store
            .mark_failed(claim, &failure, claim.attempt())
            .await?;

        self.audit(claim, AttemptRecord::Failed(&failure)).await;

        let error_code = failure.code.to_string();
        let outcome = match &result {
            FailureOutcome::Rescheduled(job) => DispatchOutcome::Rescheduled {
                error_code,
                message: failure.message.clone(),
                next_attempt_at: job.scheduled_at.to_rfc3339(),
            },
            FailureOutcome::Failed(_) => DispatchOutcome::Failed {
                error_code,
                message: failure.message.clone(),
            },
            FailureOutcome::Superseded(_) => DispatchOutcome::Superseded {
                error_code,
                message: failure.message.clone(),
            },
        };

        counter!("followups_dispatch_total", "outcome" => outcome.label()).increment(1);
        warn!(
            job_id = %claim.job_id(),
            attempt = claim.attempt(),
            failure_count = result.job().failure_count,
            error_code = failure.code,
            outcome = outcome.label(),
            "Follow-up dispatch failed: {}",
            failure.message
        );

        Ok(outcome)
    }

    async fn audit(&self, claim: &DispatchClaim, record: AttemptRecord<'_>) {
        if let Err(err) = self.store.record_attempt(claim, record).await {
            error!(job_id = %claim.job_id(), error = ?err, "Failed to write send attempt");
        }
    }

    /// Sends a job right away, outside the worker's schedule.
    pub async fn send_now(&self, user_id: Uuid, job_id: Uuid) -> Result<SendNowResult, StoreError> {
        let job = self.store.find_for_user(user_id, job_id).await?;
        if !parse_status(&job)?.is_dispatchable() {
            return Err(StoreError::invalid_state("send", &job.status));
        }

        let Some(claim) = self
            .store
            .claim(job_id, Utc::now(), ClaimMode::Immediate)
            .await?
        else {
            let current = self.store.find_for_user(user_id, job_id).await?;
            if parse_status(&current)?.is_dispatchable() {
                return Err(StoreError::Conflict(
                    "follow-up is already being sent".to_string(),
                ));
            }
            return Err(StoreError::invalid_state("send", &current.status));
        };

        info!(user_id = %user_id, job_id = %job_id, "Manual send requested");
        let outcome = self.dispatch_claimed(claim).await?;
        let job = self.store.find_for_user(user_id, job_id).await?;

        Ok(SendNowResult { job, outcome })
    }

    /// Sends the fixed test message through a user's connection.
    pub async fn send_test_email(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        to: &str,
    ) -> Result<ProviderMessageId, ConnectionCheckError> {
        let connection = self
            .connections
            .find_for_user(user_id, connection_id)
            .await
            .map_err(StoreError::from)?
            .ok_or(StoreError::NotFound {
                resource: "Connection",
            })?;

        if !connection.is_active() {
            return Err(StoreError::ConnectionInactive {
                status: connection.status.clone(),
            }
            .into());
        }

        let from_name = connection
            .display_name
            .clone()
            .unwrap_or_else(|| self.from_name.clone());
        let message = template::compose_test_email(to, &from_name);

        match self.send(&connection, &message).await {
            Ok(provider_message_id) => {
                info!(
                    connection_id = %connection.id,
                    provider_message_id = %provider_message_id,
                    "Test email sent"
                );
                Ok(provider_message_id)
            }
            Err(error) => {
                if error.is_connection_level()
                    && let Err(err) = self.connections.mark_error(&connection, &error.to_string()).await
                {
                    error!(connection_id = %connection.id, error = ?err, "Failed to mark connection as error");
                }
                Err(ConnectionCheckError::Send {
                    provider: connection.provider.clone(),
                    error,
                })
            }
        }
    }

    /// Checks a connection's credentials with its provider. Success
    /// re-activates the connection; an authentication failure moves it to
    /// `error`.
    pub async fn validate_connection(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Connection, ConnectionCheckError> {
        let connection = self
            .connections
            .find_for_user(user_id, connection_id)
            .await
            .map_err(StoreError::from)?
            .ok_or(StoreError::NotFound {
                resource: "Connection",
            })?;

        let limit: Duration = self.config.send_timeout();
        let result = match self.providers.for_connection(&connection) {
            Ok(provider) => match timeout(limit, provider.validate(&connection)).await {
                Ok(result) => result,
                Err(_) => Err(SendError::Timeout(limit.as_secs())),
            },
            Err(error) => Err(error),
        };

        match result {
            Ok(()) => {
                let updated = self
                    .connections
                    .set_status(user_id, connection_id, ConnectionStatus::Active)
                    .await
                    .map_err(StoreError::from)?
                    .ok_or(StoreError::NotFound {
                        resource: "Connection",
                    })?;
                info!(connection_id = %connection_id, "Connection validated");
                Ok(updated)
            }
            Err(error) => {
                if error.is_connection_level()
                    && let Err(err) = self.connections.mark_error(&connection, &error.to_string()).await
                {
                    error!(connection_id = %connection.id, error = ?err, "Failed to mark connection as error");
                }
                warn!(connection_id = %connection_id, error_code = error.code(), "Connection validation failed");
                Err(ConnectionCheckError::Send {
                    provider: connection.provider.clone(),
                    error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_stats_tally_outcomes() {
        let mut stats = PassStats::default();
        stats.record(&DispatchOutcome::Sent {
            provider_message_id: "m1".into(),
        });
        stats.record(&DispatchOutcome::Rescheduled {
            error_code: "transient".into(),
            message: "503".into(),
            next_attempt_at: Utc::now().to_rfc3339(),
        });
        assert!(!stats.has_failures());

        stats.record(&DispatchOutcome::Failed {
            error_code: "invalid_recipient".into(),
            message: "bad address".into(),
        });
        assert_eq!((stats.sent, stats.rescheduled, stats.failed), (1, 1, 1));
        assert!(stats.has_failures());
    }

    #[test]
    fn outcome_serializes_with_result_tag() {
        let value = serde_json::to_value(DispatchOutcome::Sent {
            provider_message_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "result": "sent", "provider_message_id": "abc" })
        );
    }

    #[test]
    fn rate_limited_test_email_sets_retry_after() {
        let err = ConnectionCheckError::Send {
            provider: "resend".into(),
            error: SendError::RateLimited {
                retry_after_secs: Some(7),
            },
        };
        let api: ApiError = err.into();
        assert_eq!(api.status, axum::http::StatusCode::BAD_GATEWAY);
        assert_eq!(api.retry_after, Some(7));
    }
}
