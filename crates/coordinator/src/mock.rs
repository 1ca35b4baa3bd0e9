//! Recording in-memory transaction manager
//!
//! Stands in for a node's local transaction manager in tests and demos.
//! Every call is recorded; votes and failures can be scripted per
//! transaction.

use crate::bridge::{BridgeResult, TransactionManager};
use crate::coordinator::RemoteParticipant;
use crate::error::BridgeError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use wsat_common::{GlobalId, Vote};
use wsat_protocol::EndpointReference;

/// One call made through the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    Export(GlobalId),
    Import { global_id: GlobalId, created: bool },
    Prepare(GlobalId),
    Commit(GlobalId),
    Rollback(GlobalId),
    RegisterParticipant { global_id: GlobalId, participant: String },
    RegisterCoordinator { global_id: GlobalId, coordinator: EndpointReference },
    ReplayCompletion(GlobalId),
    Suspend(GlobalId),
    Resume(GlobalId),
    SetRollbackOnly(GlobalId),
    Unexport(GlobalId),
    Unimport(GlobalId),
}

#[derive(Default)]
struct MockState {
    /// Transaction associated with the current call and its timeout
    current: Option<(GlobalId, i64)>,
    imported: HashSet<GlobalId>,
    votes: HashMap<GlobalId, Vote>,
    fail_prepare: HashSet<GlobalId>,
    fail_commit: HashSet<GlobalId>,
    fail_rollback: HashSet<GlobalId>,
    fail_replay: bool,
    outcomes: HashMap<GlobalId, bool>,
    recovery_addresses: HashMap<String, String>,
    participants: HashMap<GlobalId, Vec<Arc<RemoteParticipant>>>,
    coordinators: HashMap<GlobalId, EndpointReference>,
    calls: Vec<BridgeCall>,
}

/// Scriptable fake of a local transaction manager
#[derive(Default)]
pub struct MockTransactionManager {
    state: Mutex<MockState>,
}

impl MockTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a local transaction with the current call
    pub fn begin(&self, global_id: impl Into<GlobalId>, timeout_millis: i64) {
        self.state.lock().current = Some((global_id.into(), timeout_millis));
    }

    pub fn end(&self) {
        self.state.lock().current = None;
    }

    pub fn set_vote(&self, global_id: &GlobalId, vote: Vote) {
        self.state.lock().votes.insert(global_id.clone(), vote);
    }

    pub fn fail_prepare(&self, global_id: &GlobalId) {
        self.state.lock().fail_prepare.insert(global_id.clone());
    }

    pub fn fail_commit(&self, global_id: &GlobalId) {
        self.state.lock().fail_commit.insert(global_id.clone());
    }

    pub fn fail_rollback(&self, global_id: &GlobalId) {
        self.state.lock().fail_rollback.insert(global_id.clone());
    }

    pub fn fail_replay(&self, fail: bool) {
        self.state.lock().fail_replay = fail;
    }

    /// Remember a recorded outcome, as a transaction log would
    pub fn record_outcome(&self, global_id: &GlobalId, committed: bool) {
        self.state.lock().outcomes.insert(global_id.clone(), committed);
    }

    pub fn set_recovery_address(&self, recovery_id: impl Into<String>, address: impl Into<String>) {
        self.state
            .lock()
            .recovery_addresses
            .insert(recovery_id.into(), address.into());
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.state.lock().calls.clone()
    }

    pub fn participants(&self, global_id: &GlobalId) -> Vec<Arc<RemoteParticipant>> {
        self.state
            .lock()
            .participants
            .get(global_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn coordinator(&self, global_id: &GlobalId) -> Option<EndpointReference> {
        self.state.lock().coordinators.get(global_id).cloned()
    }

    pub fn is_imported(&self, global_id: &GlobalId) -> bool {
        self.state.lock().imported.contains(global_id)
    }

    fn record(&self, call: BridgeCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl TransactionManager for MockTransactionManager {
    fn is_active(&self) -> bool {
        self.state.lock().current.is_some()
    }

    fn get_timeout(&self) -> i64 {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|(_, timeout)| *timeout)
            .unwrap_or(0)
    }

    fn export_id(&self) -> BridgeResult<GlobalId> {
        let global_id = self
            .state
            .lock()
            .current
            .as_ref()
            .map(|(id, _)| id.clone())
            .ok_or_else(|| BridgeError::new("no active transaction"))?;
        self.record(BridgeCall::Export(global_id.clone()));
        Ok(global_id)
    }

    fn import_id(&self, global_id: &GlobalId, _timeout_seconds: u64) -> BridgeResult<bool> {
        let created = self.state.lock().imported.insert(global_id.clone());
        self.record(BridgeCall::Import {
            global_id: global_id.clone(),
            created,
        });
        Ok(created)
    }

    async fn prepare(&self, global_id: &GlobalId) -> BridgeResult<Vote> {
        self.record(BridgeCall::Prepare(global_id.clone()));
        let state = self.state.lock();
        if state.fail_prepare.contains(global_id) {
            return Err(BridgeError::new(format!("prepare of {} failed", global_id)));
        }
        Ok(state.votes.get(global_id).copied().unwrap_or(Vote::Commit))
    }

    async fn commit(&self, global_id: &GlobalId) -> BridgeResult<()> {
        self.record(BridgeCall::Commit(global_id.clone()));
        let mut state = self.state.lock();
        if state.fail_commit.contains(global_id) {
            return Err(BridgeError::new(format!("commit of {} failed", global_id)));
        }
        state.outcomes.insert(global_id.clone(), true);
        state.imported.remove(global_id);
        Ok(())
    }

    async fn rollback(&self, global_id: &GlobalId) -> BridgeResult<()> {
        self.record(BridgeCall::Rollback(global_id.clone()));
        let mut state = self.state.lock();
        if state.fail_rollback.contains(global_id) {
            return Err(BridgeError::new(format!("rollback of {} failed", global_id)));
        }
        state.outcomes.insert(global_id.clone(), false);
        state.imported.remove(global_id);
        Ok(())
    }

    fn register_participant(
        &self,
        global_id: &GlobalId,
        participant: Arc<RemoteParticipant>,
    ) -> BridgeResult<()> {
        self.record(BridgeCall::RegisterParticipant {
            global_id: global_id.clone(),
            participant: participant.id().to_string(),
        });
        self.state
            .lock()
            .participants
            .entry(global_id.clone())
            .or_default()
            .push(participant);
        Ok(())
    }

    fn register_coordinator(
        &self,
        global_id: &GlobalId,
        coordinator: &EndpointReference,
    ) -> BridgeResult<()> {
        self.record(BridgeCall::RegisterCoordinator {
            global_id: global_id.clone(),
            coordinator: coordinator.clone(),
        });
        self.state
            .lock()
            .coordinators
            .insert(global_id.clone(), coordinator.clone());
        Ok(())
    }

    async fn replay_completion(&self, global_id: &GlobalId) -> BridgeResult<()> {
        self.record(BridgeCall::ReplayCompletion(global_id.clone()));

        let (outcome, participants) = {
            let state = self.state.lock();
            if state.fail_replay {
                return Err(BridgeError::new(format!("no log record for {}", global_id)));
            }
            (
                state.outcomes.get(global_id).copied(),
                state.participants.get(global_id).cloned().unwrap_or_default(),
            )
        };

        let Some(committed) = outcome else {
            return Ok(());
        };

        for participant in participants {
            let result = if committed {
                participant.commit().await
            } else {
                participant.rollback().await
            };
            result.map_err(|e| BridgeError::new(e.to_string()))?;
        }
        Ok(())
    }

    fn get_recovery_address(&self, recovery_id: &str) -> Option<String> {
        self.state.lock().recovery_addresses.get(recovery_id).cloned()
    }

    fn suspend(&self, global_id: &GlobalId) {
        self.record(BridgeCall::Suspend(global_id.clone()));
    }

    fn resume(&self, global_id: &GlobalId) {
        self.record(BridgeCall::Resume(global_id.clone()));
    }

    fn set_rollback_only(&self, global_id: &GlobalId) {
        self.record(BridgeCall::SetRollbackOnly(global_id.clone()));
    }

    fn unexport(&self, global_id: &GlobalId) {
        self.record(BridgeCall::Unexport(global_id.clone()));
    }

    fn unimport(&self, global_id: &GlobalId) {
        self.record(BridgeCall::Unimport(global_id.clone()));
    }
}
