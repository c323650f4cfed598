//! # Repository Layer
//!
//! SeaORM data access for connections and follow-up jobs, with every
//! user-facing lookup scoped to the owning user.

pub mod connection;
pub mod followup_job;

pub use connection::ConnectionRepository;
pub use followup_job::FollowUpStore;
