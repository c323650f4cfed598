//! Email provider adapters
//!
//! Every outbound email goes through an [`EmailProvider`]. The connection's
//! `provider` tag selects the adapter from a [`ProviderRegistry`]; the adapter
//! decrypts the connection's credentials itself and reports failures as a
//! classified [`SendError`] so the dispatcher can decide between retrying,
//! failing the job and disabling the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::models::connection::{Model as Connection, ProviderKind};
use crate::repositories::connection::ConnectionRepository;
use crate::repositories::followup_job::DispatchFailure;

pub mod gmail;
pub mod resend;

pub use gmail::GmailProvider;
pub use resend::ResendProvider;

/// Receipt returned by a provider for an accepted message
pub type ProviderMessageId = String;

/// A fully rendered email ready for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub reply_to: Option<String>,
}

/// Classified provider failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("provider rejected the credentials: {0}")]
    Unauthorized(String),
    #[error("re-authorization required: {0}")]
    ReauthRequired(String),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider call timed out after {0}s")]
    Timeout(u64),
    #[error("connection misconfigured: {0}")]
    Misconfigured(String),
}

impl SendError {
    /// Stable code stored on send attempts and surfaced in API errors
    pub fn code(&self) -> &'static str {
        match self {
            SendError::Unauthorized(_) => "unauthorized",
            SendError::ReauthRequired(_) => "reauth_required",
            SendError::InvalidRecipient(_) => "invalid_recipient",
            SendError::Rejected(_) => "rejected",
            SendError::RateLimited { .. } => "rate_limited",
            SendError::Transient(_) => "transient",
            SendError::Timeout(_) => "timeout",
            SendError::Misconfigured(_) => "misconfigured",
        }
    }

    /// Failures worth another attempt on the retry ladder
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendError::RateLimited { .. } | SendError::Transient(_) | SendError::Timeout(_)
        )
    }

    /// Failures that say the connection itself cannot send
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            SendError::Unauthorized(_) | SendError::ReauthRequired(_) | SendError::Misconfigured(_)
        )
    }
}

impl From<&SendError> for DispatchFailure {
    fn from(err: &SendError) -> Self {
        DispatchFailure {
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// One email service. Implementations are selected by [`ProviderKind`].
#[async_trait]
pub trait EmailProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn send(
        &self,
        connection: &Connection,
        message: &OutboundMessage,
    ) -> Result<ProviderMessageId, SendError>;

    /// Checks that the connection's credentials are usable without sending.
    async fn validate(&self, _connection: &Connection) -> Result<(), SendError> {
        Ok(())
    }
}

/// Adapters keyed by the connection's provider tag
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn EmailProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the production registry with both adapters sharing one HTTP client.
    pub fn from_config(
        config: &ProviderConfig,
        connections: Arc<ConnectionRepository>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut registry = Self::new();
        registry.register(Arc::new(ResendProvider::new(
            http.clone(),
            config,
            connections.clone(),
        )));
        registry.register(Arc::new(GmailProvider::new(http, config, connections)));
        Ok(registry)
    }

    /// Adds or replaces the adapter for its kind
    pub fn register(&mut self, provider: Arc<dyn EmailProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn EmailProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Adapter for a connection's provider tag
    pub fn for_connection(&self, connection: &Connection) -> Result<Arc<dyn EmailProvider>, SendError> {
        let kind = connection
            .kind()
            .map_err(|e| SendError::Misconfigured(e.to_string()))?;
        self.get(kind).ok_or_else(|| {
            SendError::Misconfigured(format!("no adapter registered for provider '{}'", kind))
        })
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.kinds())
            .finish()
    }
}

/// `From` header value: `Display Name <address>`
pub(crate) fn sender_header(connection: &Connection, default_from_name: &str) -> String {
    let name: String = connection
        .display_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(default_from_name)
        .chars()
        .filter(|c| !matches!(c, '"' | '<' | '>' | '\r' | '\n'))
        .collect();
    let name = name.trim();

    if name.is_empty() {
        connection.provider_email.clone()
    } else {
        format!("{} <{}>", name, connection.provider_email)
    }
}

pub(crate) fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

pub(crate) fn body_snippet(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    if trimmed.chars().count() > MAX {
        format!("{}...", trimmed.chars().take(MAX).collect::<String>())
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn network_error(provider: ProviderKind, err: &reqwest::Error) -> SendError {
    if err.is_timeout() {
        SendError::Transient(format!("{} request timed out", provider))
    } else {
        SendError::Transient(format!("{} request failed: {}", provider, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reqwest::header::HeaderValue;
    use uuid::Uuid;

    fn connection(display_name: Option<&str>) -> Connection {
        let now = Utc::now().fixed_offset();
        Connection {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: "resend".to_string(),
            provider_email: "sender@example.com".to_string(),
            display_name: display_name.map(str::to_string),
            status: "active".to_string(),
            api_key_ciphertext: None,
            access_token_ciphertext: None,
            refresh_token_ciphertext: None,
            expires_at: None,
            last_error: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn retryable_and_connection_level_are_disjoint() {
        let all = [
            SendError::Unauthorized(String::new()),
            SendError::ReauthRequired(String::new()),
            SendError::InvalidRecipient(String::new()),
            SendError::Rejected(String::new()),
            SendError::RateLimited {
                retry_after_secs: None,
            },
            SendError::Transient(String::new()),
            SendError::Timeout(30),
            SendError::Misconfigured(String::new()),
        ];
        for err in &all {
            assert!(!(err.is_retryable() && err.is_connection_level()), "{err:?}");
        }
        let retryable: Vec<_> = all.iter().filter(|e| e.is_retryable()).map(SendError::code).collect();
        assert_eq!(retryable, vec!["rate_limited", "transient", "timeout"]);
    }

    #[test]
    fn dispatch_failure_from_send_error() {
        let failure = DispatchFailure::from(&SendError::Timeout(30));
        assert_eq!(failure.code, "timeout");
        assert!(failure.retryable);
        assert_eq!(failure.message, "provider call timed out after 30s");

        let failure = DispatchFailure::from(&SendError::InvalidRecipient("bad".into()));
        assert!(!failure.retryable);
    }

    #[test]
    fn sender_header_uses_display_name_or_default() {
        assert_eq!(
            sender_header(&connection(Some("Jane \"JD\" Doe")), "Loom"),
            "Jane JD Doe <sender@example.com>"
        );
        assert_eq!(
            sender_header(&connection(None), "Project Loom"),
            "Project Loom <sender@example.com>"
        );
        assert_eq!(sender_header(&connection(Some("  ")), ""), "sender@example.com");
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_secs(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after_secs(&headers), Some(12));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after_secs(&headers), None);
    }

    #[test]
    fn registry_reports_unknown_provider_as_misconfigured() {
        let registry = ProviderRegistry::new();
        let err = registry.for_connection(&connection(None)).err().unwrap();
        assert_eq!(err.code(), "misconfigured");

        let mut bad = connection(None);
        bad.provider = "smtp".to_string();
        assert!(matches!(
            registry.for_connection(&bad),
            Err(SendError::Misconfigured(_))
        ));
    }
}
