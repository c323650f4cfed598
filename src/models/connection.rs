//! Connection entity model
//!
//! A connection binds one user to one email provider credential set. The
//! `provider` column is the tag that selects the provider adapter.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Connection entity storing encrypted provider credentials
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Provider tag (`resend` or `gmail`)
    pub provider: String,

    /// Sender address used in the From header
    pub provider_email: String,

    /// Sender display name (optional)
    pub display_name: Option<String>,

    /// Eligibility gate (`active`, `disabled`, `error`)
    pub status: String,

    /// Encrypted API key for key-based providers
    pub api_key_ciphertext: Option<Vec<u8>>,

    /// Encrypted OAuth access token for token-based providers
    pub access_token_ciphertext: Option<Vec<u8>>,

    /// Encrypted OAuth refresh token for token-based providers
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Reason the connection was moved to `error`
    pub last_error: Option<String>,

    /// Set when the user removes the connection; its secrets are wiped
    pub deleted_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::followup_job::Entity")]
    FollowUpJob,
}

impl Related<super::followup_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FollowUpJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn kind(&self) -> Result<ProviderKind, UnknownVariant> {
        self.provider.parse()
    }

    pub fn connection_status(&self) -> Result<ConnectionStatus, UnknownVariant> {
        self.status.parse()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.connection_status(), Ok(ConnectionStatus::Active))
    }
}

/// Error returned when a stored tag does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Email provider variants. Resend authenticates with an API key, Gmail with
/// OAuth access and refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Resend,
    Gmail,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Resend, ProviderKind::Gmail];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Resend => "resend",
            ProviderKind::Gmail => "gmail",
        }
    }

    pub fn is_token_based(&self) -> bool {
        matches!(self, ProviderKind::Gmail)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownVariant {
                kind: "provider",
                value: value.to_string(),
            })
    }
}

/// Connection eligibility. Only `active` connections may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Disabled,
    Error,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 3] = [
        ConnectionStatus::Active,
        ConnectionStatus::Disabled,
        ConnectionStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Disabled => "disabled",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownVariant {
                kind: "connection status",
                value: value.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_round_trips_tag() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        let err = "smtp".parse::<ProviderKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown provider 'smtp'");
    }

    #[test]
    fn only_gmail_is_token_based() {
        assert!(ProviderKind::Gmail.is_token_based());
        assert!(!ProviderKind::Resend.is_token_based());
    }

    #[test]
    fn unknown_status_is_not_active() {
        let now = chrono::Utc::now().fixed_offset();
        let model = Model {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: "resend".to_string(),
            provider_email: "me@example.com".to_string(),
            display_name: None,
            status: "paused".to_string(),
            api_key_ciphertext: None,
            access_token_ciphertext: None,
            refresh_token_ciphertext: None,
            expires_at: None,
            last_error: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!model.is_active());
        assert!(model.connection_status().is_err());
    }
}
