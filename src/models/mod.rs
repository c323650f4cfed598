//! # Data Models
//!
//! SeaORM entities and the closed enumerations stored in their tag columns.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod followup_job;
pub mod reply;
pub mod send_attempt;

pub use connection::{ConnectionStatus, Entity as Connection, ProviderKind};
pub use followup_job::{Entity as FollowUpJob, FollowUpStatus, Tone};
pub use reply::Entity as Reply;
pub use send_attempt::Entity as SendAttempt;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
