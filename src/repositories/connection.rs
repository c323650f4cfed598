//! Connection repository for database operations
//!
//! Encapsulates SeaORM operations on the connections table. Credentials are
//! encrypted on the way in and only decrypted on demand for a provider call.

use std::fmt;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::prelude::*;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use crate::crypto::{CryptoKey, connection_aad, credential_aad, decrypt_secret, encrypt_secret};
use crate::models::connection::{self, ConnectionStatus, Entity as Connection, ProviderKind};

/// Decrypted provider credentials, tagged by the authentication scheme.
#[derive(Clone, PartialEq, Eq)]
pub enum ProviderCredentials {
    /// Key-based providers
    ApiKey { api_key: String },
    /// Token-based providers
    OAuth {
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl ProviderCredentials {
    /// Whether this credential shape is the one `kind` authenticates with.
    pub fn fits(&self, kind: ProviderKind) -> bool {
        match self {
            ProviderCredentials::ApiKey { .. } => !kind.is_token_based(),
            ProviderCredentials::OAuth { .. } => kind.is_token_based(),
        }
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderCredentials::ApiKey { .. } => f
                .debug_struct("ApiKey")
                .field("api_key", &"[REDACTED]")
                .finish(),
            ProviderCredentials::OAuth {
                refresh_token,
                expires_at,
                ..
            } => f
                .debug_struct("OAuth")
                .field("access_token", &"[REDACTED]")
                .field("refresh_token", &refresh_token.as_ref().map(|_| "[REDACTED]"))
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

/// Input for [`ConnectionRepository::create`].
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub provider: ProviderKind,
    pub provider_email: String,
    pub display_name: Option<String>,
    pub credentials: ProviderCredentials,
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
    /// Crypto key for credential encryption
    pub crypto_key: CryptoKey,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    /// Creates an active connection with encrypted credentials
    pub async fn create(&self, user_id: Uuid, new: NewConnection) -> Result<connection::Model> {
        if !new.credentials.fits(new.provider) {
            bail!("credentials do not match provider '{}'", new.provider);
        }

        let provider_email = new.provider_email.trim().to_ascii_lowercase();
        let aad = credential_aad(user_id, new.provider.as_str(), &provider_email);
        let encrypt = |secret: &str| {
            encrypt_secret(&self.crypto_key, &aad, secret)
                .map_err(|e| anyhow!("Credential encryption failed: {}", e))
        };

        let now = Utc::now().fixed_offset();
        let mut model = connection::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            provider: Set(new.provider.as_str().to_string()),
            provider_email: Set(provider_email),
            display_name: Set(new.display_name),
            status: Set(ConnectionStatus::Active.as_str().to_string()),
            api_key_ciphertext: Set(None),
            access_token_ciphertext: Set(None),
            refresh_token_ciphertext: Set(None),
            expires_at: Set(None),
            last_error: Set(None),
            deleted_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match &new.credentials {
            ProviderCredentials::ApiKey { api_key } => {
                model.api_key_ciphertext = Set(Some(encrypt(api_key)?));
            }
            ProviderCredentials::OAuth {
                access_token,
                refresh_token,
                expires_at,
            } => {
                model.access_token_ciphertext = Set(Some(encrypt(access_token)?));
                model.refresh_token_ciphertext = Set(refresh_token
                    .as_deref()
                    .map(encrypt)
                    .transpose()?);
                model.expires_at = Set(expires_at.map(|at| at.fixed_offset()));
            }
        }

        let created = model.insert(&*self.db).await?;

        tracing::info!(
            user_id = %user_id,
            connection_id = %created.id,
            provider = %created.provider,
            "Connection created"
        );

        Ok(created)
    }

    /// Finds a connection owned by `user_id`
    pub async fn find_for_user(&self, user_id: Uuid, id: Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(id)
            .filter(connection::Column::UserId.eq(user_id))
            .filter(connection::Column::DeletedAt.is_null())
            .one(&*self.db)
            .await?)
    }

    /// Retrieves a connection by its ID without user scoping. Removed
    /// connections read as absent.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(id)
            .filter(connection::Column::DeletedAt.is_null())
            .one(&*self.db)
            .await?)
    }

    /// The user's oldest active connection, used when a follow-up names none
    pub async fn first_active_for_user(&self, user_id: Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(user_id))
            .filter(connection::Column::Status.eq(ConnectionStatus::Active.as_str()))
            .filter(connection::Column::DeletedAt.is_null())
            .order_by_asc(connection::Column::CreatedAt)
            .order_by_asc(connection::Column::Id)
            .one(&*self.db)
            .await?)
    }

    /// Lists a user's connections ordered by creation time then ID
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(user_id))
            .filter(connection::Column::DeletedAt.is_null())
            .order_by_asc(connection::Column::CreatedAt)
            .order_by_asc(connection::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Sets the status of a user's connection. Re-activating clears `last_error`.
    pub async fn set_status(
        &self,
        user_id: Uuid,
        id: Uuid,
        status: ConnectionStatus,
    ) -> Result<Option<connection::Model>> {
        let Some(existing) = self.find_for_user(user_id, id).await? else {
            return Ok(None);
        };

        let mut model: connection::ActiveModel = existing.into();
        model.status = Set(status.as_str().to_string());
        if status == ConnectionStatus::Active {
            model.last_error = Set(None);
        }
        model.updated_at = Set(Utc::now().fixed_offset());

        Ok(Some(model.update(&*self.db).await?))
    }

    /// Removes a user's connection. The row stays so follow-ups keep their
    /// reference, but it is disabled, its secrets are wiped and it no longer
    /// appears in any lookup. Returns `false` if there was nothing to remove.
    pub async fn soft_delete(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let now = Utc::now().fixed_offset();
        let result = Connection::update_many()
            .col_expr(
                connection::Column::Status,
                Expr::value(ConnectionStatus::Disabled.as_str()),
            )
            .col_expr(connection::Column::ApiKeyCiphertext, Expr::value(Option::<Vec<u8>>::None))
            .col_expr(
                connection::Column::AccessTokenCiphertext,
                Expr::value(Option::<Vec<u8>>::None),
            )
            .col_expr(
                connection::Column::RefreshTokenCiphertext,
                Expr::value(Option::<Vec<u8>>::None),
            )
            .col_expr(connection::Column::DeletedAt, Expr::value(Some(now)))
            .col_expr(connection::Column::UpdatedAt, Expr::value(now))
            .filter(connection::Column::Id.eq(id))
            .filter(connection::Column::UserId.eq(user_id))
            .filter(connection::Column::DeletedAt.is_null())
            .exec(&*self.db)
            .await?;

        if result.rows_affected > 0 {
            tracing::info!(user_id = %user_id, connection_id = %id, "Connection removed");
        }
        Ok(result.rows_affected > 0)
    }

    /// Moves a connection to `error` after an authentication failure.
    ///
    /// Every later dispatch through it is gated until the user re-activates it.
    pub async fn mark_error(&self, connection: &connection::Model, reason: &str) -> Result<()> {
        let result = Connection::update_many()
            .col_expr(
                connection::Column::Status,
                Expr::value(ConnectionStatus::Error.as_str()),
            )
            .col_expr(connection::Column::LastError, Expr::value(Some(reason.to_string())))
            .col_expr(
                connection::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(connection::Column::Id.eq(connection.id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected > 0 {
            counter!(
                "followups_connection_errors_total",
                "provider" => connection.provider.clone()
            )
            .increment(1);
            tracing::warn!(
                connection_id = %connection.id,
                user_id = %connection.user_id,
                provider = %connection.provider,
                reason = %reason,
                "Connection marked as error"
            );
        }

        Ok(())
    }

    /// Decrypts the stored credentials of a connection
    pub fn decrypt_credentials(&self, connection: &connection::Model) -> Result<ProviderCredentials> {
        let kind = connection.kind()?;
        let aad = connection_aad(connection);
        let decrypt = |ciphertext: &[u8]| {
            decrypt_secret(&self.crypto_key, &aad, ciphertext).map_err(|e| {
                tracing::error!(
                    connection_id = %connection.id,
                    provider = %connection.provider,
                    "Credential decryption failed"
                );
                anyhow!("Credential decryption failed: {}", e)
            })
        };

        if kind.is_token_based() {
            let access = connection
                .access_token_ciphertext
                .as_deref()
                .ok_or_else(|| anyhow!("connection has no access token"))?;
            Ok(ProviderCredentials::OAuth {
                access_token: decrypt(access)?,
                refresh_token: connection
                    .refresh_token_ciphertext
                    .as_deref()
                    .map(decrypt)
                    .transpose()?,
                expires_at: connection.expires_at.map(|at| at.with_timezone(&Utc)),
            })
        } else {
            let key = connection
                .api_key_ciphertext
                .as_deref()
                .ok_or_else(|| anyhow!("connection has no API key"))?;
            Ok(ProviderCredentials::ApiKey {
                api_key: decrypt(key)?,
            })
        }
    }

    /// Stores a refreshed access token (and rotated refresh token, if any)
    pub async fn persist_refreshed_tokens(
        &self,
        connection: &connection::Model,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<connection::Model> {
        let aad = connection_aad(connection);
        let encrypt = |secret: &str| {
            encrypt_secret(&self.crypto_key, &aad, secret)
                .map_err(|e| anyhow!("Token encryption failed: {}", e))
        };

        let mut model: connection::ActiveModel = connection.clone().into();
        model.access_token_ciphertext = Set(Some(encrypt(access_token)?));
        if let Some(refresh_token) = refresh_token {
            model.refresh_token_ciphertext = Set(Some(encrypt(refresh_token)?));
        }
        model.expires_at = Set(expires_at.map(|at| at.fixed_offset()));
        model.updated_at = Set(Utc::now().fixed_offset());

        Ok(model.update(&*self.db).await?)
    }
}
