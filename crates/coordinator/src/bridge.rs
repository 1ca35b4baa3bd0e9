//! Contract toward the local transaction manager
//!
//! The local manager owns the node's resource managers and its transaction
//! log. The coordinator never commits anything itself: it asks the manager
//! through this trait and turns the answers into protocol messages.

use crate::coordinator::RemoteParticipant;
use crate::error::BridgeError;
use async_trait::async_trait;
use std::sync::Arc;
use wsat_common::{GlobalId, Vote};
use wsat_protocol::EndpointReference;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Local transaction manager as seen by the coordinator
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Whether a local transaction is associated with the current call
    fn is_active(&self) -> bool;

    /// Remaining timeout of the current local transaction in milliseconds,
    /// negative once it has expired
    fn get_timeout(&self) -> i64;

    /// Make the current local transaction globally addressable
    fn export_id(&self) -> BridgeResult<GlobalId>;

    /// Attach to (or create) the local transaction for `global_id`.
    /// Returns true when the local transaction was newly created.
    fn import_id(&self, global_id: &GlobalId, timeout_seconds: u64) -> BridgeResult<bool>;

    async fn prepare(&self, global_id: &GlobalId) -> BridgeResult<Vote>;

    async fn commit(&self, global_id: &GlobalId) -> BridgeResult<()>;

    async fn rollback(&self, global_id: &GlobalId) -> BridgeResult<()>;

    /// Enlist a remote participant in the local transaction's 2PC
    fn register_participant(
        &self,
        global_id: &GlobalId,
        participant: Arc<RemoteParticipant>,
    ) -> BridgeResult<()>;

    /// Record the remote coordinator of an imported transaction
    fn register_coordinator(
        &self,
        global_id: &GlobalId,
        coordinator: &EndpointReference,
    ) -> BridgeResult<()>;

    /// Resend the final outcome of a completed transaction to its participants
    async fn replay_completion(&self, global_id: &GlobalId) -> BridgeResult<()>;

    /// Live registration address of the node now owning `recovery_id`
    fn get_recovery_address(&self, recovery_id: &str) -> Option<String>;

    /// Detach the local transaction for the duration of a remote call
    fn suspend(&self, _global_id: &GlobalId) {}

    fn resume(&self, _global_id: &GlobalId) {}

    fn set_rollback_only(&self, _global_id: &GlobalId) {}

    /// Return the exported transaction to local-only control
    fn unexport(&self, _global_id: &GlobalId) {}

    fn unimport(&self, _global_id: &GlobalId) {}
}
