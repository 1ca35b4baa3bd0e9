//! Control records for global transactions
//!
//! A `GlobalTransaction` is created when a local transaction is first
//! exported (coordinator role) or imported (participant role) and lives in
//! the registry until the transaction completes.

use crate::state::{Participant, ParticipantState};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wsat_common::{GlobalId, Timestamp};
use wsat_protocol::{CoordinationContext, EndpointReference, PARTICIPANT_ID_PARAM};

/// Final decision of a coordinated transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// A transaction known to this node
#[derive(Debug)]
pub struct GlobalTransaction {
    pub global_id: GlobalId,

    /// Advisory expiry taken from the activation timeout
    pub deadline: Timestamp,

    /// Rebuilt from durable state after a restart
    pub recovery_replay: bool,

    pub role: Role,
}

/// What this node does for the transaction
#[derive(Debug)]
pub enum Role {
    Coordinator(CoordinatorRecord),
    Participant(ParticipantSideRecord),
}

impl GlobalTransaction {
    pub fn coordinator(global_id: GlobalId, deadline: Timestamp, record: CoordinatorRecord) -> Self {
        Self {
            global_id,
            deadline,
            recovery_replay: false,
            role: Role::Coordinator(record),
        }
    }

    pub fn participant(
        global_id: GlobalId,
        deadline: Timestamp,
        record: ParticipantSideRecord,
    ) -> Self {
        Self {
            global_id,
            deadline,
            recovery_replay: false,
            role: Role::Participant(record),
        }
    }

    pub fn with_recovery_replay(mut self, replay: bool) -> Self {
        self.recovery_replay = replay;
        self
    }

    pub fn as_coordinator(&self) -> Option<&CoordinatorRecord> {
        match &self.role {
            Role::Coordinator(record) => Some(record),
            Role::Participant(_) => None,
        }
    }

    pub fn as_participant(&self) -> Option<&ParticipantSideRecord> {
        match &self.role {
            Role::Participant(record) => Some(record),
            Role::Coordinator(_) => None,
        }
    }

    /// Context handed to remote services called under this transaction.
    ///
    /// A node that is itself a participant propagates its coordinator's
    /// registration endpoint, so every participant registers with the same
    /// coordinator.
    pub fn context(&self) -> CoordinationContext {
        let registration = match &self.role {
            Role::Coordinator(record) => record.registration_endpoint.clone(),
            Role::Participant(record) => record.registration_endpoint.clone(),
        };
        CoordinationContext::new(self.global_id.clone(), self.deadline, registration)
    }
}

/// Coordinator-side state of a transaction
#[derive(Debug)]
pub struct CoordinatorRecord {
    /// Where participants register
    pub registration_endpoint: EndpointReference,

    /// Where participants send their responses
    pub coordinator_endpoint: EndpointReference,

    participants: RwLock<Vec<Arc<Participant>>>,

    /// Set when completion snapshots the participants; no new ones after that
    closed: AtomicBool,

    completing: AtomicBool,
    decision: Mutex<Option<Outcome>>,
}

impl CoordinatorRecord {
    pub fn new(
        registration_endpoint: EndpointReference,
        coordinator_endpoint: EndpointReference,
    ) -> Self {
        Self {
            registration_endpoint,
            coordinator_endpoint,
            participants: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            completing: AtomicBool::new(false),
            decision: Mutex::new(None),
        }
    }

    /// Add a participant unless the same endpoint is already registered.
    ///
    /// Returns the participant and whether it was newly added, or `None` once
    /// completion has closed the transaction to new participants.
    pub fn add_participant(
        &self,
        global_id: &GlobalId,
        endpoint: EndpointReference,
    ) -> Option<(Arc<Participant>, bool)> {
        let mut participants = self.participants.write();

        if let Some(existing) = participants.iter().find(|p| *p.endpoint() == endpoint) {
            return Some((existing.clone(), false));
        }
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let participant = Arc::new(Participant::new(
            uuid::Uuid::new_v4().to_string(),
            global_id.clone(),
            endpoint,
        ));
        participants.push(participant.clone());
        Some((participant, true))
    }

    /// Close the transaction to new participants and snapshot the ones
    /// completion has to drive
    pub fn begin_completion(&self) -> Vec<Arc<Participant>> {
        let participants = self.participants.write();
        self.closed.store(true, Ordering::SeqCst);
        participants.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Re-create a participant under its logged id, used during recovery
    pub fn restore_participant(
        &self,
        global_id: &GlobalId,
        id: impl Into<String>,
        endpoint: EndpointReference,
        state: ParticipantState,
    ) -> Arc<Participant> {
        let id = id.into();
        let mut participants = self.participants.write();

        if let Some(existing) = participants.iter().find(|p| p.id() == id) {
            return existing.clone();
        }

        let participant = Arc::new(Participant::with_state(id, global_id.clone(), endpoint, state));
        participants.push(participant.clone());
        participant
    }

    pub fn remove_participant(&self, id: &str) -> Option<Arc<Participant>> {
        let mut participants = self.participants.write();
        let index = participants.iter().position(|p| p.id() == id)?;
        Some(participants.remove(index))
    }

    pub fn participant(&self, id: &str) -> Option<Arc<Participant>> {
        self.participants.read().iter().find(|p| p.id() == id).cloned()
    }

    /// Snapshot of the participants in registration order
    pub fn participants(&self) -> Vec<Arc<Participant>> {
        self.participants.read().clone()
    }

    pub fn all_terminal(&self) -> bool {
        self.participants
            .read()
            .iter()
            .all(|p| p.state().is_terminal())
    }

    /// Coordinator endpoint correlated to one participant
    pub fn endpoint_for(&self, participant: &Participant) -> EndpointReference {
        self.coordinator_endpoint
            .clone()
            .with_parameter(PARTICIPANT_ID_PARAM, participant.id())
    }

    /// Record that phase 2 has started
    pub fn mark_completing(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.completing.store(true, Ordering::SeqCst);
    }

    pub fn is_completing(&self) -> bool {
        self.completing.load(Ordering::SeqCst)
    }

    pub fn decide(&self, outcome: Outcome) {
        *self.decision.lock() = Some(outcome);
    }

    pub fn decision(&self) -> Option<Outcome> {
        *self.decision.lock()
    }
}

/// Participant-side state of a transaction
#[derive(Debug)]
pub struct ParticipantSideRecord {
    /// The remote coordinator's registration endpoint
    pub registration_endpoint: EndpointReference,

    coordinator_endpoint: RwLock<Option<EndpointReference>>,
}

impl ParticipantSideRecord {
    pub fn new(registration_endpoint: EndpointReference) -> Self {
        Self {
            registration_endpoint,
            coordinator_endpoint: RwLock::new(None),
        }
    }

    /// Where protocol responses go, once registration has completed
    pub fn coordinator_endpoint(&self) -> Option<EndpointReference> {
        self.coordinator_endpoint.read().clone()
    }

    pub fn set_coordinator_endpoint(&self, endpoint: EndpointReference) {
        *self.coordinator_endpoint.write() = Some(endpoint);
    }
}
