//! Gmail adapter
//!
//! Token-based provider. Access tokens are refreshed shortly before expiry and
//! the refreshed token is persisted before the message goes out, so a crash
//! mid-send never loses a rotated refresh token.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{
    EmailProvider, OutboundMessage, ProviderMessageId, SendError, body_snippet, network_error,
    retry_after_secs, sender_header,
};
use crate::config::ProviderConfig;
use crate::models::connection::{Model as Connection, ProviderKind};
use crate::repositories::connection::{ConnectionRepository, ProviderCredentials};

/// Tokens expiring within this window are refreshed before use
const EXPIRY_SKEW_SECS: i64 = 60;

/// Google OAuth token response
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct GoogleTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest {
    raw: String,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct SendMessageResponse {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
}

pub struct GmailProvider {
    http: Client,
    api_base: String,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    default_from_name: String,
    connections: Arc<ConnectionRepository>,
}

impl GmailProvider {
    pub fn new(http: Client, config: &ProviderConfig, connections: Arc<ConnectionRepository>) -> Self {
        Self {
            http,
            api_base: config.gmail_api_base.trim_end_matches('/').to_string(),
            token_url: config.google_token_url.clone(),
            client_id: config.google_client_id.clone(),
            client_secret: config.google_client_secret.clone(),
            default_from_name: config.default_from_name.clone(),
            connections,
        }
    }

    /// A usable access token, refreshing and persisting it when needed.
    async fn access_token(&self, connection: &Connection) -> Result<String, SendError> {
        let credentials = self
            .connections
            .decrypt_credentials(connection)
            .map_err(|e| SendError::Misconfigured(e.to_string()))?;

        let ProviderCredentials::OAuth {
            access_token,
            refresh_token,
            expires_at,
        } = credentials
        else {
            return Err(SendError::Misconfigured(
                "gmail connection holds an API key instead of OAuth tokens".to_string(),
            ));
        };

        if !needs_refresh(expires_at, Utc::now()) {
            return Ok(access_token);
        }

        let refresh_token = refresh_token.ok_or_else(|| {
            SendError::ReauthRequired("access token expired and no refresh token is stored".to_string())
        })?;

        let refreshed = self.refresh_access_token(&refresh_token).await?;
        let expires_at = refreshed
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        self.connections
            .persist_refreshed_tokens(
                connection,
                &refreshed.access_token,
                refreshed.refresh_token.as_deref(),
                expires_at,
            )
            .await
            .map_err(|e| SendError::Transient(format!("failed to store refreshed token: {}", e)))?;

        tracing::info!(
            connection_id = %connection.id,
            rotated_refresh_token = refreshed.refresh_token.is_some(),
            "Refreshed Gmail access token"
        );

        Ok(refreshed.access_token)
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<GoogleTokenResponse, SendError> {
        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Err(SendError::ReauthRequired(
                "Google OAuth client is not configured; cannot refresh".to_string(),
            ));
        };

        let params = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| network_error(ProviderKind::Gmail, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::ReauthRequired(format!(
                "token refresh failed with status {}: {}",
                status.as_u16(),
                body_snippet(&body)
            )));
        }

        response.json::<GoogleTokenResponse>().await.map_err(|e| {
            SendError::ReauthRequired(format!("failed to parse refresh response: {}", e))
        })
    }
}

fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_some_and(|at| at <= now + Duration::seconds(EXPIRY_SKEW_SECS))
}

/// RFC 2047 encoded-word for non-ASCII header values
fn encode_header(value: &str) -> String {
    let clean: String = value.chars().filter(|c| !matches!(c, '\r' | '\n')).collect();
    if clean.is_ascii() {
        clean
    } else {
        format!("=?UTF-8?B?{}?=", general_purpose::STANDARD.encode(clean.as_bytes()))
    }
}

/// Single-part HTML message in RFC 5322 form
fn build_mime(from: &str, message: &OutboundMessage) -> String {
    let mut mime = String::new();
    mime.push_str(&format!("From: {}\r\n", encode_header(from)));
    mime.push_str(&format!("To: {}\r\n", encode_header(&message.to)));
    if let Some(reply_to) = &message.reply_to {
        mime.push_str(&format!("Reply-To: {}\r\n", encode_header(reply_to)));
    }
    mime.push_str(&format!("Subject: {}\r\n", encode_header(&message.subject)));
    mime.push_str("MIME-Version: 1.0\r\n");
    mime.push_str("Content-Type: text/html; charset=\"UTF-8\"\r\n");
    mime.push_str("Content-Transfer-Encoding: base64\r\n\r\n");

    let encoded = general_purpose::STANDARD.encode(message.html_body.as_bytes());
    for line in encoded.as_bytes().chunks(76) {
        mime.push_str(&String::from_utf8_lossy(line));
        mime.push_str("\r\n");
    }
    mime
}

fn classify_send_response(status: StatusCode, retry_after: Option<u64>, body: &str) -> SendError {
    let detail = format!("gmail returned {}: {}", status.as_u16(), body_snippet(body));
    match status {
        StatusCode::UNAUTHORIZED => SendError::ReauthRequired(detail),
        StatusCode::FORBIDDEN => SendError::Unauthorized(detail),
        StatusCode::TOO_MANY_REQUESTS => SendError::RateLimited {
            retry_after_secs: retry_after,
        },
        StatusCode::BAD_REQUEST if body.to_ascii_lowercase().contains("invalid to header") => {
            SendError::InvalidRecipient(detail)
        }
        s if s.is_client_error() => SendError::Rejected(detail),
        _ => SendError::Transient(detail),
    }
}

#[async_trait]
impl EmailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn send(
        &self,
        connection: &Connection,
        message: &OutboundMessage,
    ) -> Result<ProviderMessageId, SendError> {
        let access_token = self.access_token(connection).await?;

        let mime = build_mime(&sender_header(connection, &self.default_from_name), message);
        let request = SendMessageRequest {
            raw: base64_url::encode(mime.as_bytes()),
        };

        let response = self
            .http
            .post(format!("{}/gmail/v1/users/me/messages/send", self.api_base))
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| network_error(ProviderKind::Gmail, &e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_send_response(status, retry_after, &body));
        }

        let body: SendMessageResponse = response.json().await.map_err(|e| {
            SendError::Transient(format!("gmail returned an unreadable response: {}", e))
        })?;

        tracing::debug!(
            connection_id = %connection.id,
            provider_message_id = %body.id,
            "Gmail accepted message"
        );

        Ok(body.id)
    }

    /// Makes sure a usable access token exists, refreshing it if it expired.
    async fn validate(&self, connection: &Connection) -> Result<(), SendError> {
        self.access_token(connection).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage {
            to: "bob@example.com".to_string(),
            subject: "Re: Café plans".to_string(),
            html_body: "<p>Hello</p>".to_string(),
            reply_to: Some("jane@example.com".to_string()),
        }
    }

    #[test]
    fn refresh_window_includes_skew() {
        let now = Utc::now();
        assert!(!needs_refresh(None, now));
        assert!(needs_refresh(Some(now - Duration::seconds(1)), now));
        assert!(needs_refresh(Some(now + Duration::seconds(30)), now));
        assert!(!needs_refresh(Some(now + Duration::minutes(10)), now));
    }

    #[test]
    fn mime_has_headers_and_base64_body() {
        let mime = build_mime("Jane <jane@example.com>", &message());
        assert!(mime.starts_with("From: Jane <jane@example.com>\r\n"));
        assert!(mime.contains("To: bob@example.com\r\n"));
        assert!(mime.contains("Reply-To: jane@example.com\r\n"));
        assert!(mime.contains("Subject: =?UTF-8?B?"));
        assert!(mime.contains("Content-Type: text/html; charset=\"UTF-8\""));

        let body = mime.split("\r\n\r\n").nth(1).unwrap().replace("\r\n", "");
        let decoded = general_purpose::STANDARD.decode(body).unwrap();
        assert_eq!(decoded, b"<p>Hello</p>");
    }

    #[test]
    fn header_injection_is_stripped() {
        assert_eq!(encode_header("Hi\r\nBcc: evil@example.com"), "HiBcc: evil@example.com");
    }

    #[test]
    fn send_status_classification() {
        assert!(matches!(
            classify_send_response(StatusCode::UNAUTHORIZED, None, ""),
            SendError::ReauthRequired(_)
        ));
        assert!(matches!(
            classify_send_response(StatusCode::BAD_REQUEST, None, "Invalid To header"),
            SendError::InvalidRecipient(_)
        ));
        assert!(matches!(
            classify_send_response(StatusCode::BAD_REQUEST, None, "Invalid argument"),
            SendError::Rejected(_)
        ));
        assert!(classify_send_response(StatusCode::SERVICE_UNAVAILABLE, None, "").is_retryable());
    }
}
