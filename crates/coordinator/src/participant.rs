//! Participant side of two-phase commit
//!
//! Handles prepare/commit/rollback arriving on this node's participant
//! endpoint. None of these operations fail towards the caller: phase-1
//! failures become an aborted vote, phase-2 failures suppress the
//! acknowledgment and are left to the coordinator's redelivery.

use crate::bridge::TransactionManager;
use crate::registry::TransactionRegistry;
use crate::rpc::ProtocolClient;
use std::sync::Arc;
use wsat_common::{GlobalId, Vote};
use wsat_protocol::EndpointReference;

pub struct ParticipantService {
    registry: Arc<TransactionRegistry>,
    bridge: Arc<dyn TransactionManager>,
    client: Arc<ProtocolClient>,
}

impl ParticipantService {
    pub fn new(
        registry: Arc<TransactionRegistry>,
        bridge: Arc<dyn TransactionManager>,
        client: Arc<ProtocolClient>,
    ) -> Self {
        Self {
            registry,
            bridge,
            client,
        }
    }

    /// Prepare local resources and report the vote to the coordinator
    pub async fn on_prepare(&self, global_id: &GlobalId, from: Option<&EndpointReference>) {
        let vote = match self.bridge.prepare(global_id).await {
            Ok(vote) => vote,
            Err(e) => {
                tracing::warn!("Prepare of {} failed, voting aborted: {}", global_id, e);
                Vote::Rollback
            }
        };

        let Some(coordinator) = self.coordinator_for(global_id, from) else {
            tracing::warn!("No coordinator endpoint to report the vote for {}", global_id);
            return;
        };

        // No second phase follows these votes
        if vote != Vote::Commit {
            self.registry.remove(global_id);
        }

        let sent = match vote {
            Vote::Commit => self.client.prepared(&coordinator, None).await,
            Vote::ReadOnly => self.client.read_only(&coordinator).await,
            Vote::Rollback => self.client.aborted(&coordinator).await,
        };
        if let Err(e) = sent {
            tracing::warn!("Could not report vote for {}: {}", global_id, e);
        }
    }

    /// Commit local resources, then acknowledge
    pub async fn on_commit(&self, global_id: &GlobalId, from: Option<&EndpointReference>) {
        if let Err(e) = self.bridge.commit(global_id).await {
            tracing::error!("Commit of {} failed, not acknowledging: {}", global_id, e);
            return;
        }
        self.acknowledge(global_id, from, true).await;
    }

    /// Roll back local resources, then acknowledge
    pub async fn on_rollback(&self, global_id: &GlobalId, from: Option<&EndpointReference>) {
        if let Err(e) = self.bridge.rollback(global_id).await {
            tracing::error!("Rollback of {} failed, not acknowledging: {}", global_id, e);
            return;
        }
        self.acknowledge(global_id, from, false).await;
    }

    async fn acknowledge(
        &self,
        global_id: &GlobalId,
        from: Option<&EndpointReference>,
        committed: bool,
    ) {
        let coordinator = self.coordinator_for(global_id, from);
        self.registry.remove(global_id);

        let Some(coordinator) = coordinator else {
            tracing::warn!("No coordinator endpoint to acknowledge {}", global_id);
            return;
        };

        let sent = if committed {
            self.client.committed(&coordinator).await
        } else {
            self.client.aborted(&coordinator).await
        };
        if let Err(e) = sent {
            tracing::warn!("Acknowledgment for {} not delivered: {}", global_id, e);
        }
    }

    /// The coordinator endpoint learned at registration, falling back to
    /// the sender of the current message
    fn coordinator_for(
        &self,
        global_id: &GlobalId,
        from: Option<&EndpointReference>,
    ) -> Option<EndpointReference> {
        self.registry
            .get(global_id)
            .and_then(|tx| tx.as_participant()?.coordinator_endpoint())
            .or_else(|| from.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BridgeCall, MockTransactionManager};
    use crate::rpc::Transport;
    use crate::transaction::{GlobalTransaction, ParticipantSideRecord};
    use std::time::Duration;
    use wsat_common::Timestamp;
    use wsat_engine::{Delivery, MockClient, MockEngine};
    use wsat_protocol::{Action, ProtocolMessage};
    use tokio::sync::mpsc::UnboundedReceiver;

    const COORDINATOR: &str = "https://node-a/wsat/coordinator";
    const FALLBACK: &str = "https://node-c/wsat/coordinator";

    struct Fixture {
        registry: Arc<TransactionRegistry>,
        bridge: Arc<MockTransactionManager>,
        service: ParticipantService,
        coordinator: UnboundedReceiver<Delivery>,
        fallback: UnboundedReceiver<Delivery>,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(MockEngine::new());
        let transport: Arc<dyn Transport> = Arc::new(MockClient::new("node-b", engine.clone()));
        let client = Arc::new(ProtocolClient::new(transport, false, Duration::from_secs(1)));
        let registry = Arc::new(TransactionRegistry::new());
        let bridge = Arc::new(MockTransactionManager::new());

        Fixture {
            service: ParticipantService::new(registry.clone(), bridge.clone(), client),
            coordinator: engine.register_handler(COORDINATOR),
            fallback: engine.register_handler(FALLBACK),
            registry,
            bridge,
        }
    }

    fn enlisted(registry: &TransactionRegistry, id: &str) -> GlobalId {
        let gid = GlobalId::new(id);
        let record = ParticipantSideRecord::new(EndpointReference::new("https://node-a/wsat/registration"));
        record.set_coordinator_endpoint(
            EndpointReference::new(COORDINATOR)
                .for_transaction(&gid)
                .with_parameter("participant_id", "p-1"),
        );
        registry.put(GlobalTransaction::participant(gid.clone(), Timestamp::now(), record));
        gid
    }

    fn action(delivery: Delivery) -> Action {
        ProtocolMessage::from_message(delivery.message).unwrap().action()
    }

    #[tokio::test]
    async fn test_commit_vote_reports_prepared() {
        let mut f = fixture();
        let gid = enlisted(&f.registry, "tx-1");

        f.service.on_prepare(&gid, None).await;

        assert_eq!(action(f.coordinator.recv().await.unwrap()), Action::Prepared);
        assert!(f.registry.get(&gid).is_some());
    }

    #[tokio::test]
    async fn test_read_only_vote_forgets_transaction() {
        let mut f = fixture();
        let gid = enlisted(&f.registry, "tx-1");
        f.bridge.set_vote(&gid, Vote::ReadOnly);

        f.service.on_prepare(&gid, None).await;

        assert_eq!(action(f.coordinator.recv().await.unwrap()), Action::ReadOnly);
        assert!(f.registry.get(&gid).is_none());
    }

    #[tokio::test]
    async fn test_failing_prepare_reports_aborted() {
        let mut f = fixture();
        let gid = GlobalId::new("tx-unknown");
        f.bridge.fail_prepare(&gid);

        f.service
            .on_prepare(&gid, Some(&EndpointReference::new(FALLBACK)))
            .await;

        assert_eq!(action(f.fallback.recv().await.unwrap()), Action::Aborted);
    }

    #[tokio::test]
    async fn test_commit_without_record_uses_sender() {
        let mut f = fixture();
        let gid = GlobalId::new("tx-recovered");

        f.service
            .on_commit(&gid, Some(&EndpointReference::new(FALLBACK)))
            .await;

        assert!(f.bridge.calls().contains(&BridgeCall::Commit(gid)));
        assert_eq!(action(f.fallback.recv().await.unwrap()), Action::Committed);
    }

    #[tokio::test]
    async fn test_commit_acknowledges_and_forgets() {
        let mut f = fixture();
        let gid = enlisted(&f.registry, "tx-1");

        f.service.on_commit(&gid, None).await;

        assert_eq!(action(f.coordinator.recv().await.unwrap()), Action::Committed);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_is_not_acknowledged() {
        let mut f = fixture();
        let gid = enlisted(&f.registry, "tx-1");
        f.bridge.fail_commit(&gid);

        f.service.on_commit(&gid, None).await;

        assert!(f.coordinator.try_recv().is_err());
        assert!(f.registry.get(&gid).is_some());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_not_acknowledged() {
        let mut f = fixture();
        let gid = enlisted(&f.registry, "tx-1");
        f.bridge.fail_rollback(&gid);

        f.service.on_rollback(&gid, None).await;

        assert!(f.coordinator.try_recv().is_err());
        assert!(f.registry.get(&gid).is_some());
        assert!(f.bridge.calls().contains(&BridgeCall::Rollback(gid)));
    }

    #[tokio::test]
    async fn test_rollback_acknowledges_aborted() {
        let mut f = fixture();
        let gid = enlisted(&f.registry, "tx-1");

        f.service.on_rollback(&gid, None).await;

        assert_eq!(action(f.coordinator.recv().await.unwrap()), Action::Aborted);
        assert!(f.bridge.calls().contains(&BridgeCall::Rollback(gid)));
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_does_not_raise() {
        let f = fixture();
        let gid = GlobalId::new("tx-1");

        f.service
            .on_rollback(&gid, Some(&EndpointReference::new("https://gone/wsat/coordinator")))
            .await;
        f.service.on_prepare(&gid, None).await;
    }
}
