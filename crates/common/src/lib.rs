//! Common types for the atomic-transaction coordinator
//!
//! This crate defines:
//! - Global transaction identifiers (opaque strings, UUIDv7 when generated)
//! - Per-node recovery identities
//! - Physical timestamps (microseconds since Unix epoch) used for expiry
//! - The prepare vote returned by a local transaction manager

mod global_id;
mod recovery;
mod timestamp;
mod vote;

pub use global_id::GlobalId;
pub use recovery::RecoveryIdentity;
pub use timestamp::Timestamp;
pub use vote::Vote;
