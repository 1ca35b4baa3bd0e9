//! Per-participant protocol state held by the coordinator
//!
//! Each participant owns a single-slot watch channel holding its current
//! state. Transitions are applied under the channel's lock and wake every
//! waiter; waiters recheck on a fixed interval so late failures surface
//! without a dedicated wakeup.

use crate::error::{Result, WsatError};
use std::time::Duration;
use tokio::sync::watch;
use wsat_common::GlobalId;
use wsat_protocol::EndpointReference;

/// Participant state in the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantState {
    /// Registered, no vote yet
    Active,
    /// Voted to commit and awaits the outcome
    Prepared,
    /// Voted read-only; no second phase
    ReadOnly,
    /// Rollback has been sent
    RollingBack,
    /// Acknowledged commit
    Committed,
    /// Voted or acknowledged rollback
    Aborted,
}

impl ParticipantState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::ReadOnly)
    }

    /// Whether the protocol allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ParticipantState) -> bool {
        use ParticipantState::*;

        matches!(
            (self, next),
            (Active, Prepared)
                | (Active, ReadOnly)
                | (Active, Aborted)
                | (Active, RollingBack)
                | (Prepared, Committed)
                | (Prepared, Aborted)
                | (Prepared, RollingBack)
                | (RollingBack, Aborted)
        )
    }
}

/// A participant registered with a transaction this node coordinates
#[derive(Debug)]
pub struct Participant {
    id: String,
    global_id: GlobalId,
    endpoint: EndpointReference,
    state: watch::Sender<ParticipantState>,
}

impl Participant {
    pub fn new(id: impl Into<String>, global_id: GlobalId, endpoint: EndpointReference) -> Self {
        Self::with_state(id, global_id, endpoint, ParticipantState::Active)
    }

    /// Participant rebuilt with a known state, used during recovery
    pub fn with_state(
        id: impl Into<String>,
        global_id: GlobalId,
        endpoint: EndpointReference,
        state: ParticipantState,
    ) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            id: id.into(),
            global_id,
            endpoint,
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn global_id(&self) -> &GlobalId {
        &self.global_id
    }

    /// Where prepare/commit/rollback are sent
    pub fn endpoint(&self) -> &EndpointReference {
        &self.endpoint
    }

    pub fn state(&self) -> ParticipantState {
        *self.state.borrow()
    }

    /// Apply a transition.
    ///
    /// Returns `Ok(true)` when the state changed, `Ok(false)` when the
    /// participant was already in `next` (a duplicate response), and
    /// `InvalidTransition` for anything that would regress the state.
    pub fn transition(&self, next: ParticipantState) -> Result<bool> {
        let mut outcome = Ok(false);

        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                outcome = Err(WsatError::InvalidTransition {
                    participant: self.id.clone(),
                    from: *current,
                    to: next,
                });
                return false;
            }

            tracing::debug!(
                "Participant {} of {}: {:?} -> {:?}",
                self.id,
                self.global_id,
                *current,
                next
            );
            *current = next;
            outcome = Ok(true);
            true
        });

        outcome
    }

    /// Wait until the state satisfies `done`, rechecking every
    /// `poll_interval`, for at most `timeout`.
    pub async fn wait_until<F>(
        &self,
        done: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<ParticipantState>
    where
        F: Fn(ParticipantState) -> bool,
    {
        let mut receiver = self.state.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = *receiver.borrow_and_update();
            if done(current) {
                return Ok(current);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(WsatError::ResponseTimeout {
                    global_id: self.global_id.clone(),
                    participant: self.id.clone(),
                });
            }

            let slice = remaining.min(poll_interval);
            match tokio::time::timeout(slice, receiver.changed()).await {
                Ok(Ok(())) => continue,
                // Sender lives in self, so the channel cannot close while we wait
                Ok(Err(_)) => continue,
                Err(_) => {
                    tracing::debug!(
                        "Still waiting for participant {} of {} in {:?}",
                        self.id,
                        self.global_id,
                        current
                    );
                }
            }
        }
    }

    /// Wait for the first response after `Active`
    pub async fn wait_for_vote(&self, timeout: Duration, poll_interval: Duration) -> Result<ParticipantState> {
        self.wait_until(|s| s != ParticipantState::Active, timeout, poll_interval)
            .await
    }

    /// Wait for a terminal state
    pub async fn wait_for_outcome(&self, timeout: Duration, poll_interval: Duration) -> Result<ParticipantState> {
        self.wait_until(|s| s.is_terminal(), timeout, poll_interval)
            .await
    }
}
