//! Resend adapter
//!
//! Key-based provider: each send is a single `POST /emails` authenticated with
//! the connection's API key.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{
    EmailProvider, OutboundMessage, ProviderMessageId, SendError, body_snippet, network_error,
    retry_after_secs, sender_header,
};
use crate::config::ProviderConfig;
use crate::models::connection::{Model as Connection, ProviderKind};
use crate::repositories::connection::{ConnectionRepository, ProviderCredentials};

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: String,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    id: String,
}

pub struct ResendProvider {
    http: Client,
    api_base: String,
    default_from_name: String,
    connections: Arc<ConnectionRepository>,
}

impl ResendProvider {
    pub fn new(http: Client, config: &ProviderConfig, connections: Arc<ConnectionRepository>) -> Self {
        Self {
            http,
            api_base: config.resend_api_base.trim_end_matches('/').to_string(),
            default_from_name: config.default_from_name.clone(),
            connections,
        }
    }

    fn api_key(&self, connection: &Connection) -> Result<String, SendError> {
        match self.connections.decrypt_credentials(connection) {
            Ok(ProviderCredentials::ApiKey { api_key }) => Ok(api_key),
            Ok(ProviderCredentials::OAuth { .. }) => Err(SendError::Misconfigured(
                "resend connection holds OAuth tokens instead of an API key".to_string(),
            )),
            Err(e) => Err(SendError::Misconfigured(e.to_string())),
        }
    }
}

/// Maps a non-success Resend response onto the send error taxonomy.
fn classify_response(status: StatusCode, retry_after: Option<u64>, body: &str) -> SendError {
    let detail = format!("resend returned {}: {}", status.as_u16(), body_snippet(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SendError::Unauthorized(detail),
        StatusCode::UNPROCESSABLE_ENTITY => SendError::InvalidRecipient(detail),
        StatusCode::TOO_MANY_REQUESTS => SendError::RateLimited {
            retry_after_secs: retry_after,
        },
        s if s.is_client_error() => SendError::Rejected(detail),
        _ => SendError::Transient(detail),
    }
}

#[async_trait]
impl EmailProvider for ResendProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Resend
    }

    async fn send(
        &self,
        connection: &Connection,
        message: &OutboundMessage,
    ) -> Result<ProviderMessageId, SendError> {
        let api_key = self.api_key(connection)?;

        let request = SendEmailRequest {
            from: sender_header(connection, &self.default_from_name),
            to: [message.to.as_str()],
            subject: &message.subject,
            html: &message.html_body,
            reply_to: message.reply_to.as_deref(),
        };

        let response = self
            .http
            .post(format!("{}/emails", self.api_base))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| network_error(ProviderKind::Resend, &e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, retry_after, &body));
        }

        let body: SendEmailResponse = response.json().await.map_err(|e| {
            SendError::Transient(format!("resend returned an unreadable response: {}", e))
        })?;

        tracing::debug!(
            connection_id = %connection.id,
            provider_message_id = %body.id,
            "Resend accepted message"
        );

        Ok(body.id)
    }

    /// Resend has no key introspection endpoint; a stored, decryptable key
    /// is as far as validation goes.
    async fn validate(&self, connection: &Connection) -> Result<(), SendError> {
        let api_key = self.api_key(connection)?;
        if api_key.trim().is_empty() {
            return Err(SendError::Misconfigured("stored API key is empty".to_string()));
        }
        Ok(())
    }
}
