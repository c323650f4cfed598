//! # Connections API Handlers
//!
//! Per-user email provider connections. Credentials are accepted on create,
//! encrypted at rest, and never returned.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::error::{self, ApiError};
use crate::models::connection::{ConnectionStatus, Model as Connection, ProviderKind};
use crate::repositories::connection::{NewConnection, ProviderCredentials};
use crate::repositories::followup_job::is_valid_email;
use crate::server::AppState;

/// Path parameters for connection operations
#[derive(Debug, Deserialize, IntoParams)]
pub struct ConnectionPath {
    /// Connection ID
    pub id: Uuid,
}

/// Request body for creating a connection
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CreateConnectionRequest {
    pub provider: ProviderKind,
    /// Sender address
    #[schema(example = "jane@example.com")]
    pub provider_email: String,
    /// Sender display name
    pub display_name: Option<String>,
    /// API key (resend)
    pub api_key: Option<String>,
    /// OAuth access token (gmail)
    pub access_token: Option<String>,
    /// OAuth refresh token (gmail)
    pub refresh_token: Option<String>,
    /// Access token expiry, RFC3339 (gmail)
    #[schema(value_type = Option<String>)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreateConnectionRequest {
    fn into_new_connection(self) -> Result<NewConnection, ApiError> {
        let provider_email = self.provider_email.trim().to_ascii_lowercase();
        if !is_valid_email(&provider_email) {
            return Err(error::validation_error(
                "Invalid sender address",
                json!({ "provider_email": "Must be a valid email address" }),
            ));
        }

        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let credentials = match self.provider {
            ProviderKind::Resend => {
                let Some(api_key) = non_empty(self.api_key) else {
                    return Err(error::validation_error(
                        "Missing credentials",
                        json!({ "api_key": "Required for resend connections" }),
                    ));
                };
                ProviderCredentials::ApiKey { api_key }
            }
            ProviderKind::Gmail => {
                let Some(access_token) = non_empty(self.access_token) else {
                    return Err(error::validation_error(
                        "Missing credentials",
                        json!({ "access_token": "Required for gmail connections" }),
                    ));
                };
                ProviderCredentials::OAuth {
                    access_token,
                    refresh_token: non_empty(self.refresh_token),
                    expires_at: self.expires_at,
                }
            }
        };

        Ok(NewConnection {
            provider: self.provider,
            provider_email,
            display_name: non_empty(self.display_name),
            credentials,
        })
    }
}

/// Status change for a connection
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct UpdateConnectionRequest {
    /// `active` or `disabled`
    pub status: ConnectionStatus,
}

/// Request body for a test email
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
#[serde(default)]
pub struct TestEmailRequest {
    /// Recipient; defaults to the connection's own address
    pub to: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TestEmailResponse {
    pub provider_message_id: String,
    pub to: String,
}

/// Connection information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectionInfo {
    #[schema(value_type = String)]
    pub id: Uuid,
    #[schema(example = "resend")]
    pub provider: String,
    pub provider_email: String,
    pub display_name: Option<String>,
    #[schema(example = "active")]
    pub status: String,
    /// Why the connection was moved to `error`
    pub last_error: Option<String>,
    /// Indicates whether an encrypted refresh token is stored
    #[schema(default = false)]
    pub has_refresh_token: bool,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Connection> for ConnectionInfo {
    fn from(model: Connection) -> Self {
        Self {
            id: model.id,
            provider: model.provider,
            provider_email: model.provider_email,
            display_name: model.display_name,
            status: model.status,
            last_error: model.last_error,
            has_refresh_token: model.refresh_token_ciphertext.is_some(),
            expires_at: model.expires_at.map(|at| at.with_timezone(&Utc).to_rfc3339()),
            created_at: model.created_at.with_timezone(&Utc).to_rfc3339(),
            updated_at: model.updated_at.with_timezone(&Utc).to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionInfo>,
}

/// Creates a connection
#[utoipa::path(
    post,
    path = "/connections",
    security(("bearer_auth" = [])),
    params(UserHeader),
    request_body = CreateConnectionRequest,
    responses(
        (status = 201, description = "Connection created", body = ConnectionInfo),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn create_connection(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    payload: Result<Json<CreateConnectionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConnectionInfo>), ApiError> {
    let Json(request) = payload?;
    let connection = state
        .connections
        .create(user.0, request.into_new_connection()?)
        .await?;
    Ok((StatusCode::CREATED, Json(connection.into())))
}

/// Lists the caller's connections
#[utoipa::path(
    get,
    path = "/connections",
    security(("bearer_auth" = [])),
    params(UserHeader),
    responses(
        (status = 200, description = "Connections", body = ConnectionsResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
) -> Result<Json<ConnectionsResponse>, ApiError> {
    let connections = state.connections.list_for_user(user.0).await?;
    Ok(Json(ConnectionsResponse {
        connections: connections.into_iter().map(ConnectionInfo::from).collect(),
    }))
}

/// Gets one connection
#[utoipa::path(
    get,
    path = "/connections/{id}",
    security(("bearer_auth" = [])),
    params(UserHeader, ConnectionPath),
    responses(
        (status = 200, description = "Connection", body = ConnectionInfo),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<ConnectionPath>,
) -> Result<Json<ConnectionInfo>, ApiError> {
    state
        .connections
        .find_for_user(user.0, path.id)
        .await?
        .map(|connection| Json(connection.into()))
        .ok_or_else(|| error::not_found("Connection"))
}

/// Enables or disables a connection
#[utoipa::path(
    patch,
    path = "/connections/{id}",
    security(("bearer_auth" = [])),
    params(UserHeader, ConnectionPath),
    request_body = UpdateConnectionRequest,
    responses(
        (status = 200, description = "Connection updated", body = ConnectionInfo),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn update_connection(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<ConnectionPath>,
    payload: Result<Json<UpdateConnectionRequest>, JsonRejection>,
) -> Result<Json<ConnectionInfo>, ApiError> {
    let Json(request) = payload?;
    if request.status == ConnectionStatus::Error {
        return Err(error::validation_error(
            "Invalid status",
            json!({ "status": "Must be active or disabled" }),
        ));
    }

    let connection = state
        .connections
        .set_status(user.0, path.id, request.status)
        .await?
        .ok_or_else(|| error::not_found("Connection"))?;

    Ok(Json(connection.into()))
}

/// Sends a fixed test email through a connection
#[utoipa::path(
    post,
    path = "/connections/{id}/test-email",
    security(("bearer_auth" = [])),
    params(UserHeader, ConnectionPath),
    request_body = TestEmailRequest,
    responses(
        (status = 200, description = "Provider accepted the message", body = TestEmailResponse),
        (status = 400, description = "Connection inactive or bad recipient", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 502, description = "Provider rejected the message", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn send_test_email(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<ConnectionPath>,
    payload: Result<Json<TestEmailRequest>, JsonRejection>,
) -> Result<Json<TestEmailResponse>, ApiError> {
    let Json(request) = payload?;

    let to = match request.to {
        Some(to) => to.trim().to_ascii_lowercase(),
        None => {
            state
                .connections
                .find_for_user(user.0, path.id)
                .await?
                .ok_or_else(|| error::not_found("Connection"))?
                .provider_email
        }
    };
    if !is_valid_email(&to) {
        return Err(error::validation_error(
            "Invalid recipient",
            json!({ "to": "Must be a valid email address" }),
        ));
    }

    let provider_message_id = state
        .dispatcher
        .send_test_email(user.0, path.id, &to)
        .await?;

    Ok(Json(TestEmailResponse {
        provider_message_id,
        to,
    }))
}

/// Removes a connection
///
/// The connection is disabled and its credentials erased. Follow-ups that
/// still point at it fail as connection-inactive when they come due.
#[utoipa::path(
    delete,
    path = "/connections/{id}",
    security(("bearer_auth" = [])),
    params(UserHeader, ConnectionPath),
    responses(
        (status = 204, description = "Connection removed"),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn delete_connection(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<ConnectionPath>,
) -> Result<StatusCode, ApiError> {
    if state.connections.soft_delete(user.0, path.id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(error::not_found("Connection"))
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ValidateConnectionResponse {
    pub valid: bool,
    pub connection: ConnectionInfo,
}

/// Checks a connection's credentials with its provider
#[utoipa::path(
    post,
    path = "/connections/{id}/validate",
    security(("bearer_auth" = [])),
    params(UserHeader, ConnectionPath),
    responses(
        (status = 200, description = "Credentials accepted; connection is active", body = ValidateConnectionResponse),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 502, description = "Provider rejected the credentials", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn validate_connection(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(path): Path<ConnectionPath>,
) -> Result<Json<ValidateConnectionResponse>, ApiError> {
    let connection = state
        .dispatcher
        .validate_connection(user.0, path.id)
        .await?;

    Ok(Json(ValidateConnectionResponse {
        valid: true,
        connection: connection.into(),
    }))
}
