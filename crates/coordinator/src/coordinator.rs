//! Coordinator side of two-phase commit
//!
//! Responses from participants arrive on the coordinator endpoint and are
//! applied to the participant's state slot, which releases the task driving
//! completion. `Coordinator::complete` runs both phases for a transaction
//! this node coordinates.

use crate::bridge::TransactionManager;
use crate::config::WsatConfig;
use crate::error::{Result, WsatError};
use crate::registry::TransactionRegistry;
use crate::rpc::ProtocolClient;
use crate::state::{Participant, ParticipantState};
use crate::transaction::{CoordinatorRecord, Outcome};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use wsat_common::{GlobalId, Vote};
use wsat_protocol::{Action, EndpointReference};

/// Handle on one registered participant, used to drive it through 2PC
pub struct RemoteParticipant {
    participant: Arc<Participant>,
    client: Arc<ProtocolClient>,

    /// Coordinator endpoint correlated to this participant
    reply_to: EndpointReference,

    response_timeout: Duration,
    poll_interval: Duration,
}

impl RemoteParticipant {
    pub fn new(
        participant: Arc<Participant>,
        client: Arc<ProtocolClient>,
        reply_to: EndpointReference,
        config: &WsatConfig,
    ) -> Self {
        Self {
            participant,
            client,
            reply_to,
            response_timeout: config.response_timeout,
            poll_interval: config.poll_interval,
        }
    }

    pub fn id(&self) -> &str {
        self.participant.id()
    }

    pub fn participant(&self) -> &Arc<Participant> {
        &self.participant
    }

    /// Send prepare and wait for the vote
    pub async fn prepare(&self) -> Result<Vote> {
        if self.participant.state() == ParticipantState::Active {
            self.client
                .prepare(self.participant.endpoint(), &self.reply_to)
                .await?;
        }

        let state = self
            .participant
            .wait_for_vote(self.response_timeout, self.poll_interval)
            .await?;

        Ok(match state {
            ParticipantState::Prepared | ParticipantState::Committed => Vote::Commit,
            ParticipantState::ReadOnly => Vote::ReadOnly,
            ParticipantState::Active | ParticipantState::RollingBack | ParticipantState::Aborted => {
                Vote::Rollback
            }
        })
    }

    /// Send commit and wait for the acknowledgment
    pub async fn commit(&self) -> Result<()> {
        match self.participant.state() {
            ParticipantState::Committed | ParticipantState::ReadOnly => return Ok(()),
            ParticipantState::Prepared => {}
            other => {
                return Err(WsatError::UnexpectedResponse(format!(
                    "cannot commit participant {} in {:?}",
                    self.id(),
                    other
                )));
            }
        }

        self.client
            .commit(self.participant.endpoint(), &self.reply_to)
            .await?;

        match self
            .participant
            .wait_for_outcome(self.response_timeout, self.poll_interval)
            .await?
        {
            ParticipantState::Committed => Ok(()),
            other => Err(WsatError::UnexpectedResponse(format!(
                "participant {} ended in {:?} after commit",
                self.id(),
                other
            ))),
        }
    }

    /// Send rollback and wait for the acknowledgment
    pub async fn rollback(&self) -> Result<()> {
        match self.participant.state() {
            ParticipantState::Aborted | ParticipantState::ReadOnly => return Ok(()),
            ParticipantState::Committed => {
                return Err(WsatError::UnexpectedResponse(format!(
                    "participant {} already committed",
                    self.id()
                )));
            }
            _ => {}
        }

        self.participant.transition(ParticipantState::RollingBack)?;
        self.client
            .rollback(self.participant.endpoint(), &self.reply_to)
            .await?;

        self.participant
            .wait_for_outcome(self.response_timeout, self.poll_interval)
            .await?;
        Ok(())
    }
}

/// Coordinator service for every transaction this node coordinates
pub struct Coordinator {
    config: WsatConfig,
    registry: Arc<TransactionRegistry>,
    bridge: Arc<dyn TransactionManager>,
    client: Arc<ProtocolClient>,
}

impl Coordinator {
    pub fn new(
        config: WsatConfig,
        registry: Arc<TransactionRegistry>,
        bridge: Arc<dyn TransactionManager>,
        client: Arc<ProtocolClient>,
    ) -> Self {
        Self {
            config,
            registry,
            bridge,
            client,
        }
    }

    /// Handle for driving one participant of `record`
    pub fn remote(&self, record: &CoordinatorRecord, participant: Arc<Participant>) -> RemoteParticipant {
        let reply_to = record.endpoint_for(&participant);
        RemoteParticipant::new(participant, self.client.clone(), reply_to, &self.config)
    }

    /// Apply a participant response received on the coordinator endpoint.
    ///
    /// `to` is the coordinator endpoint the participant was given at
    /// registration, so it carries the global id and participant id.
    pub async fn on_response(
        &self,
        action: Action,
        to: &EndpointReference,
        from: Option<&EndpointReference>,
    ) -> Result<()> {
        let next = match action {
            Action::Prepared => ParticipantState::Prepared,
            Action::ReadOnly => ParticipantState::ReadOnly,
            Action::Aborted => ParticipantState::Aborted,
            Action::Committed => ParticipantState::Committed,
            other => {
                return Err(WsatError::UnexpectedResponse(format!(
                    "{} on the coordinator endpoint",
                    other.as_str()
                )));
            }
        };

        let global_id = to
            .global_id()
            .ok_or_else(|| WsatError::UnexpectedResponse(format!("{} without global id", action.as_str())))?;

        let tracked = self.registry.get(&global_id).and_then(|tx| {
            let participant = to
                .participant_id()
                .and_then(|id| tx.as_coordinator()?.participant(id))?;
            Some((tx, participant))
        });

        let Some((tx, participant)) = tracked else {
            if action == Action::Prepared {
                return self.replay(&global_id, from).await;
            }
            tracing::debug!(
                "Ignoring {} for untracked participant of {}",
                action.as_str(),
                global_id
            );
            return Ok(());
        };

        let Some(record) = tx.as_coordinator() else {
            return Ok(());
        };

        // A second prepared means the participant lost our outcome
        if action == Action::Prepared && participant.state() != ParticipantState::Active {
            if record.decision().is_none() && tx.recovery_replay {
                return self.replay(&global_id, from).await;
            }
            self.resend_outcome(record, &participant).await;
            return Ok(());
        }

        if let Err(e) = participant.transition(next) {
            tracing::warn!("Rejected {} for {}: {}", action.as_str(), global_id, e);
            return Ok(());
        }

        if record.is_completing() && record.all_terminal() {
            tracing::debug!("All participants of {} finished", global_id);
            self.registry.remove(&global_id);
        }

        Ok(())
    }

    /// Run both phases for a transaction this node coordinates
    pub async fn complete(&self, global_id: &GlobalId) -> Result<Outcome> {
        let tx = self
            .registry
            .get(global_id)
            .ok_or_else(|| WsatError::TransactionNotFound(global_id.clone()))?;
        let record = tx.as_coordinator().ok_or_else(|| WsatError::WrongRole {
            global_id: global_id.clone(),
            expected: "coordinator",
        })?;

        let remotes: Vec<RemoteParticipant> = record
            .begin_completion()
            .into_iter()
            .map(|p| self.remote(record, p))
            .collect();

        // Phase 1: prepare local resources and every participant
        let local_vote = self.bridge.prepare(global_id).await;
        if let Err(e) = &local_vote {
            tracing::warn!("Local prepare of {} failed: {}", global_id, e);
        }

        let votes = join_all(remotes.iter().map(|remote| async move {
            match remote.prepare().await {
                Ok(vote) => vote,
                Err(e) => {
                    tracing::warn!("No vote from participant {}: {}", remote.id(), e);
                    Vote::Rollback
                }
            }
        }))
        .await;

        let local_commit = matches!(&local_vote, Ok(vote) if vote.allows_commit());
        let outcome = if local_commit && votes.iter().all(Vote::allows_commit) {
            Outcome::Committed
        } else {
            Outcome::RolledBack
        };
        tracing::debug!("Decided {:?} for {}", outcome, global_id);

        record.decide(outcome);
        record.mark_completing();

        // Phase 2: deliver the outcome
        match outcome {
            Outcome::Committed => {
                if let Err(e) = self.bridge.commit(global_id).await {
                    tracing::error!("Local commit of {} failed: {}", global_id, e);
                }
                let results = join_all(remotes.iter().map(|remote| remote.commit())).await;
                self.log_unacknowledged(global_id, &remotes, results);
            }
            Outcome::RolledBack => {
                // A Rollback vote has already released the local resources,
                // a failed prepare may have left some of them prepared
                if !matches!(local_vote, Ok(Vote::Rollback))
                    && let Err(e) = self.bridge.rollback(global_id).await
                {
                    tracing::error!("Local rollback of {} failed: {}", global_id, e);
                }
                let results = join_all(remotes.iter().map(|remote| remote.rollback())).await;
                self.log_unacknowledged(global_id, &remotes, results);
            }
        }

        self.registry.remove(global_id);
        Ok(outcome)
    }

    async fn replay(&self, global_id: &GlobalId, from: Option<&EndpointReference>) -> Result<()> {
        // The sender is not authenticated against the original coordinator
        tracing::warn!(
            "Prepared for unknown participant of {} from {}, replaying completion",
            global_id,
            from.map(|f| f.to_string()).unwrap_or_else(|| "unknown sender".to_string())
        );

        if let Err(e) = self.bridge.replay_completion(global_id).await {
            tracing::warn!("Replay of {} failed: {}", global_id, e);
        }
        Ok(())
    }

    async fn resend_outcome(&self, record: &CoordinatorRecord, participant: &Arc<Participant>) {
        let commit = match (participant.state(), record.decision()) {
            (ParticipantState::Committed, _) => true,
            (ParticipantState::Aborted, _) => false,
            (_, Some(Outcome::Committed)) => true,
            (_, Some(Outcome::RolledBack)) => false,
            (_, None) => {
                tracing::debug!("Duplicate prepared from {} before decision", participant.id());
                return;
            }
        };

        let reply_to = record.endpoint_for(participant);
        let result = if commit {
            self.client.commit(participant.endpoint(), &reply_to).await
        } else {
            self.client.rollback(participant.endpoint(), &reply_to).await
        };

        if let Err(e) = result {
            tracing::warn!("Could not resend outcome to {}: {}", participant.id(), e);
        }
    }

    fn log_unacknowledged(&self, global_id: &GlobalId, remotes: &[RemoteParticipant], results: Vec<Result<()>>) {
        for (remote, result) in remotes.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    "Participant {} of {} did not acknowledge: {}",
                    remote.id(),
                    global_id,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BridgeCall, MockTransactionManager};
    use crate::rpc::Transport;
    use crate::transaction::GlobalTransaction;
    use wsat_common::Timestamp;
    use wsat_engine::{MockClient, MockEngine};
    use wsat_protocol::{PARTICIPANT_ID_PARAM, ProtocolBody, ProtocolMessage};

    const COORDINATOR: &str = "https://node-a/wsat/coordinator";
    const PARTICIPANT: &str = "https://node-b/wsat/participant";

    struct Fixture {
        engine: Arc<MockEngine>,
        registry: Arc<TransactionRegistry>,
        bridge: Arc<MockTransactionManager>,
        coordinator: Coordinator,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(MockEngine::new());
        let transport: Arc<dyn Transport> = Arc::new(MockClient::new("node-a", engine.clone()));
        let config = WsatConfig::new("https://node-a/wsat")
            .with_response_timeout(Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(50));
        let client = Arc::new(ProtocolClient::new(transport, false, config.request_timeout));
        let registry = Arc::new(TransactionRegistry::new());
        let bridge = Arc::new(MockTransactionManager::new());

        let coordinator = Coordinator::new(config, registry.clone(), bridge.clone(), client);
        Fixture {
            engine,
            registry,
            bridge,
            coordinator,
        }
    }

    fn coordinate(registry: &TransactionRegistry, id: &str) -> (GlobalId, Arc<Participant>) {
        let gid = GlobalId::new(id);
        let record = CoordinatorRecord::new(
            EndpointReference::new("https://node-a/wsat/registration").for_transaction(&gid),
            EndpointReference::new(COORDINATOR).for_transaction(&gid),
        );
        let (participant, _) = record
            .add_participant(&gid, EndpointReference::new(PARTICIPANT).for_transaction(&gid))
            .unwrap();
        registry.put(GlobalTransaction::coordinator(gid.clone(), Timestamp::now(), record));
        (gid, participant)
    }

    fn response_to(gid: &GlobalId, participant: &Participant) -> EndpointReference {
        EndpointReference::new(COORDINATOR)
            .for_transaction(gid)
            .with_parameter(PARTICIPANT_ID_PARAM, participant.id())
    }

    /// Answer every verb sent to the participant address with `vote`, then
    /// acknowledge the outcome
    fn answering_participant(engine: &Arc<MockEngine>, coordinator: Arc<Coordinator>, vote: Action) {
        let mut receiver = engine.register_handler(PARTICIPANT);
        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let message = ProtocolMessage::from_message(delivery.message).unwrap();
                let reply_to = message.reply_to.unwrap();
                let answer = match message.body {
                    ProtocolBody::Prepare => vote,
                    ProtocolBody::Commit => Action::Committed,
                    ProtocolBody::Rollback => Action::Aborted,
                    _ => continue,
                };
                coordinator.on_response(answer, &reply_to, None).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_prepared_releases_waiting_participant() {
        let f = fixture();
        let (gid, participant) = coordinate(&f.registry, "tx-1");

        f.coordinator
            .on_response(Action::Prepared, &response_to(&gid, &participant), None)
            .await
            .unwrap();
        assert_eq!(participant.state(), ParticipantState::Prepared);
    }

    #[tokio::test]
    async fn test_unsolicited_prepared_triggers_replay() {
        let f = fixture();
        let to = EndpointReference::new(COORDINATOR)
            .with_parameter("global_id", "tx-gone")
            .with_parameter(PARTICIPANT_ID_PARAM, "p-unknown");

        f.coordinator
            .on_response(Action::Prepared, &to, Some(&EndpointReference::new(PARTICIPANT)))
            .await
            .unwrap();

        assert!(
            f.bridge
                .calls()
                .contains(&BridgeCall::ReplayCompletion(GlobalId::new("tx-gone")))
        );
    }

    #[tokio::test]
    async fn test_unsolicited_prepared_succeeds_when_replay_fails() {
        let f = fixture();
        f.bridge.fail_replay(true);
        let to = EndpointReference::new(COORDINATOR).with_parameter("global_id", "tx-gone");

        assert!(f.coordinator.on_response(Action::Prepared, &to, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_late_committed_for_unknown_transaction_is_ignored() {
        let f = fixture();
        let to = EndpointReference::new(COORDINATOR).with_parameter("global_id", "tx-gone");

        f.coordinator.on_response(Action::Committed, &to, None).await.unwrap();
        assert!(f.bridge.calls().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_state_is_not_overwritten() {
        let f = fixture();
        let (gid, participant) = coordinate(&f.registry, "tx-1");
        let to = response_to(&gid, &participant);

        f.coordinator.on_response(Action::ReadOnly, &to, None).await.unwrap();
        f.coordinator.on_response(Action::Aborted, &to, None).await.unwrap();

        assert_eq!(participant.state(), ParticipantState::ReadOnly);
    }

    #[tokio::test]
    async fn test_duplicate_prepared_after_commit_resends_commit() {
        let f = fixture();
        let (gid, participant) = coordinate(&f.registry, "tx-1");
        participant.transition(ParticipantState::Prepared).unwrap();
        participant.transition(ParticipantState::Committed).unwrap();

        let mut receiver = f.engine.register_handler(PARTICIPANT);
        f.coordinator
            .on_response(Action::Prepared, &response_to(&gid, &participant), None)
            .await
            .unwrap();

        let delivery = receiver.recv().await.unwrap();
        let message = ProtocolMessage::from_message(delivery.message).unwrap();
        assert_eq!(message.action(), Action::Commit);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_complete_commits_when_all_prepared() {
        let f = fixture();
        let coordinator = Arc::new(f.coordinator);
        let (gid, participant) = coordinate(&f.registry, "tx-1");
        answering_participant(&f.engine, coordinator.clone(), Action::Prepared);

        let outcome = coordinator.complete(&gid).await.unwrap();

        assert_eq!(outcome, Outcome::Committed);
        assert_eq!(participant.state(), ParticipantState::Committed);
        assert!(f.registry.get(&gid).is_none());
        assert!(f.bridge.calls().contains(&BridgeCall::Commit(gid.clone())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_complete_rolls_back_on_aborted_vote() {
        let f = fixture();
        let coordinator = Arc::new(f.coordinator);
        let (gid, participant) = coordinate(&f.registry, "tx-1");
        answering_participant(&f.engine, coordinator.clone(), Action::Aborted);

        let outcome = coordinator.complete(&gid).await.unwrap();

        assert_eq!(outcome, Outcome::RolledBack);
        assert_eq!(participant.state(), ParticipantState::Aborted);
        assert!(f.bridge.calls().contains(&BridgeCall::Rollback(gid.clone())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_complete_rolls_back_on_local_rollback_vote() {
        let f = fixture();
        let coordinator = Arc::new(f.coordinator);
        let (gid, participant) = coordinate(&f.registry, "tx-1");
        f.bridge.set_vote(&gid, Vote::Rollback);
        answering_participant(&f.engine, coordinator.clone(), Action::Prepared);

        let outcome = coordinator.complete(&gid).await.unwrap();

        assert_eq!(outcome, Outcome::RolledBack);
        assert_eq!(participant.state(), ParticipantState::Aborted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_local_prepare_rolls_back_local_resources() {
        let f = fixture();
        let coordinator = Arc::new(f.coordinator);
        let (gid, participant) = coordinate(&f.registry, "tx-lp");
        f.bridge.fail_prepare(&gid);
        answering_participant(&f.engine, coordinator.clone(), Action::Prepared);

        let outcome = coordinator.complete(&gid).await.unwrap();

        assert_eq!(outcome, Outcome::RolledBack);
        assert_eq!(participant.state(), ParticipantState::Aborted);
        let calls = f.bridge.calls();
        assert!(calls.contains(&BridgeCall::Prepare(gid.clone())));
        assert!(calls.contains(&BridgeCall::Rollback(gid.clone())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_local_rollback_vote_skips_local_rollback() {
        let f = fixture();
        let coordinator = Arc::new(f.coordinator);
        let (gid, _) = coordinate(&f.registry, "tx-1");
        f.bridge.set_vote(&gid, Vote::Rollback);
        answering_participant(&f.engine, coordinator.clone(), Action::Prepared);

        coordinator.complete(&gid).await.unwrap();

        assert!(!f.bridge.calls().contains(&BridgeCall::Rollback(gid.clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_participant_counts_as_rollback() {
        let f = fixture();
        let (gid, participant) = coordinate(&f.registry, "tx-1");
        // Listener exists but never answers
        let _receiver = f.engine.register_handler(PARTICIPANT);

        let outcome = f.coordinator.complete(&gid).await.unwrap();

        assert_eq!(outcome, Outcome::RolledBack);
        assert_eq!(participant.state(), ParticipantState::RollingBack);
        assert!(f.registry.get(&gid).is_none());
    }

    #[tokio::test]
    async fn test_complete_unknown_transaction() {
        let f = fixture();
        let result = f.coordinator.complete(&GlobalId::new("tx-none")).await;
        assert!(matches!(result, Err(WsatError::TransactionNotFound(_))));
    }
}
