//! Recovery and registration reroute
//!
//! After a restart a node rebuilds protocol state from identifiers kept in
//! the local transaction log. Registrations carrying another node's recovery
//! identity are forwarded to wherever that identity lives now.

use crate::bridge::TransactionManager;
use crate::config::WsatConfig;
use crate::coordinator::RemoteParticipant;
use crate::directory::EndpointDirectory;
use crate::error::Result;
use crate::registry::TransactionRegistry;
use crate::rpc::ProtocolClient;
use crate::state::ParticipantState;
use crate::transaction::{CoordinatorRecord, GlobalTransaction, ParticipantSideRecord};
use std::sync::Arc;
use wsat_common::{GlobalId, Timestamp};
use wsat_protocol::{EndpointReference, RECOVERY_ID_PARAM, RegisterRequest};

/// A participant as recorded in the coordinator's log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedParticipant {
    pub id: String,
    pub endpoint: EndpointReference,
}

pub struct RecoveryService {
    config: WsatConfig,
    registry: Arc<TransactionRegistry>,
    directory: Arc<EndpointDirectory>,
    bridge: Arc<dyn TransactionManager>,
    client: Arc<ProtocolClient>,
}

impl RecoveryService {
    pub fn new(
        config: WsatConfig,
        registry: Arc<TransactionRegistry>,
        directory: Arc<EndpointDirectory>,
        bridge: Arc<dyn TransactionManager>,
        client: Arc<ProtocolClient>,
    ) -> Self {
        Self {
            config,
            registry,
            directory,
            bridge,
            client,
        }
    }

    /// Forward a registration that belongs to another node instance.
    ///
    /// Returns `None` when the registration should be handled locally: the
    /// recovery id is ours or absent, no live address is known for it, or
    /// the known address is this node's own registration endpoint.
    pub async fn reroute(&self, request: &RegisterRequest) -> Option<Result<EndpointReference>> {
        let recovery_id = request.recovery_id.as_deref()?;
        if self.config.recovery_id.matches(recovery_id) {
            return None;
        }

        let Some(address) = self.bridge.get_recovery_address(recovery_id) else {
            tracing::debug!("No live address for recovery id {}", recovery_id);
            return None;
        };

        if address == self.config.registration_address() {
            tracing::debug!("Recovery id {} now lives on this node", recovery_id);
            return None;
        }

        tracing::info!(
            "Rerouting registration for {} (recovery id {}) to {}",
            request.global_id,
            recovery_id,
            address
        );

        let target = EndpointReference::new(address)
            .for_transaction(&request.global_id)
            .with_parameter(RECOVERY_ID_PARAM, recovery_id);

        Some(self.client.register(&target, request.clone()).await)
    }

    /// Rebuild a coordinated transaction whose participants were all
    /// prepared when the node went down
    pub fn recover_coordinator(
        &self,
        global_id: &GlobalId,
        registration: EndpointReference,
        coordinator: EndpointReference,
        participants: Vec<LoggedParticipant>,
    ) -> Result<Arc<GlobalTransaction>> {
        let record = CoordinatorRecord::new(registration, coordinator);
        let mut remotes = Vec::with_capacity(participants.len());

        for logged in participants {
            let participant = record.restore_participant(
                global_id,
                logged.id,
                logged.endpoint,
                ParticipantState::Prepared,
            );
            let reply_to = record.endpoint_for(&participant);
            remotes.push(Arc::new(RemoteParticipant::new(
                participant,
                self.client.clone(),
                reply_to,
                &self.config,
            )));
        }

        // Only the second phase is left
        record.mark_completing();

        let tx = self.registry.put(
            GlobalTransaction::coordinator(global_id.clone(), self.deadline(), record)
                .with_recovery_replay(true),
        );

        for remote in remotes {
            self.bridge.register_participant(global_id, remote)?;
        }

        tracing::info!("Recovered coordinator state for {}", global_id);
        Ok(tx)
    }

    /// Rebuild an in-doubt participant and ask its coordinator for the
    /// outcome by resending `prepared`
    pub async fn recover_participant(
        &self,
        global_id: &GlobalId,
        registration: EndpointReference,
        coordinator: EndpointReference,
    ) -> Result<Arc<GlobalTransaction>> {
        let record = ParticipantSideRecord::new(registration);
        record.set_coordinator_endpoint(coordinator.clone());

        let tx = self.registry.put(
            GlobalTransaction::participant(global_id.clone(), self.deadline(), record)
                .with_recovery_replay(true),
        );
        self.bridge.register_coordinator(global_id, &coordinator)?;

        let reply_to = self.directory.participant_endpoint(global_id).await?;
        self.client.prepared(&coordinator, Some(&reply_to)).await?;

        tracing::info!("Recovered participant state for {}", global_id);
        Ok(tx)
    }

    fn deadline(&self) -> Timestamp {
        Timestamp::now().add(self.config.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::BaseAddresses;
    use crate::mock::{BridgeCall, MockTransactionManager};
    use crate::rpc::{Transport, durable_2pc_properties};
    use std::time::Duration;
    use wsat_engine::{MockClient, MockEngine};
    use wsat_protocol::{Action, ProtocolBody, ProtocolMessage};

    const NEW_HOME: &str = "https://node-c/wsat/registration";

    struct Fixture {
        engine: Arc<MockEngine>,
        registry: Arc<TransactionRegistry>,
        bridge: Arc<MockTransactionManager>,
        recovery: RecoveryService,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(MockEngine::new());
        let config = WsatConfig::new("https://node-a/wsat").with_recovery_id("node-a");
        let transport: Arc<dyn Transport> = Arc::new(MockClient::new("node-a", engine.clone()));
        let client = Arc::new(ProtocolClient::new(transport, false, Duration::from_secs(1)));
        let registry = Arc::new(TransactionRegistry::new());
        let directory = Arc::new(EndpointDirectory::from_config(&config));
        directory.publish(BaseAddresses::from_config(&config));
        let bridge = Arc::new(MockTransactionManager::new());

        Fixture {
            recovery: RecoveryService::new(config, registry.clone(), directory, bridge.clone(), client),
            engine,
            registry,
            bridge,
        }
    }

    fn request(recovery_id: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            properties: durable_2pc_properties(),
            global_id: GlobalId::new("tx-moved"),
            participant: EndpointReference::new("https://node-b/wsat/participant"),
            recovery_id: recovery_id.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_own_recovery_id_is_handled_locally() {
        let f = fixture();
        assert!(f.recovery.reroute(&request(Some("node-a"))).await.is_none());
        assert!(f.recovery.reroute(&request(None)).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_recovery_id_falls_through() {
        let f = fixture();
        assert!(f.recovery.reroute(&request(Some("node-x"))).await.is_none());
    }

    #[tokio::test]
    async fn test_reroute_to_own_address_falls_through() {
        let f = fixture();
        f.bridge
            .set_recovery_address("node-x", "https://node-a/wsat/registration");
        assert!(f.recovery.reroute(&request(Some("node-x"))).await.is_none());
    }

    #[tokio::test]
    async fn test_reroute_forwards_to_new_home() {
        let f = fixture();
        f.bridge.set_recovery_address("node-x", NEW_HOME);

        let mut receiver = f.engine.register_handler(NEW_HOME);
        let forwarded = tokio::spawn(async move {
            let delivery = receiver.recv().await.unwrap();
            let message = ProtocolMessage::from_message(delivery.message.clone()).unwrap();
            let coordinator = EndpointReference::new("https://node-c/wsat/coordinator")
                .with_parameter("global_id", "tx-moved");
            delivery.respond(
                ProtocolMessage::reply(ProtocolBody::RegisterResponse { coordinator })
                    .into_message()
                    .unwrap(),
            );
            message
        });

        let result = f
            .recovery
            .reroute(&request(Some("node-x")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.address, "https://node-c/wsat/coordinator");

        let message = forwarded.await.unwrap();
        assert_eq!(message.action(), Action::Register);
        assert_eq!(message.to.global_id(), Some(GlobalId::new("tx-moved")));
        assert_eq!(message.to.recovery_id(), Some("node-x"));
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_recover_coordinator_restores_prepared_participants() {
        let f = fixture();
        let gid = GlobalId::new("tx-logged");

        let tx = f
            .recovery
            .recover_coordinator(
                &gid,
                EndpointReference::new("https://node-a/wsat/registration").for_transaction(&gid),
                EndpointReference::new("https://node-a/wsat/coordinator").for_transaction(&gid),
                vec![LoggedParticipant {
                    id: "p-1".to_string(),
                    endpoint: EndpointReference::new("https://node-b/wsat/participant"),
                }],
            )
            .unwrap();

        assert!(tx.recovery_replay);
        let record = tx.as_coordinator().unwrap();
        assert!(record.is_completing());
        assert_eq!(record.participant("p-1").unwrap().state(), ParticipantState::Prepared);
        assert_eq!(f.bridge.participants(&gid).len(), 1);
        assert!(f.registry.get(&gid).is_some());
    }

    #[tokio::test]
    async fn test_recover_participant_asks_for_outcome() {
        let f = fixture();
        let gid = GlobalId::new("tx-in-doubt");
        let coordinator = EndpointReference::new("https://node-c/wsat/coordinator")
            .for_transaction(&gid)
            .with_parameter("participant_id", "p-1");
        let mut receiver = f.engine.register_handler("https://node-c/wsat/coordinator");

        let tx = f
            .recovery
            .recover_participant(
                &gid,
                EndpointReference::new(NEW_HOME).for_transaction(&gid),
                coordinator.clone(),
            )
            .await
            .unwrap();

        assert!(tx.recovery_replay);
        assert_eq!(tx.as_participant().unwrap().coordinator_endpoint(), Some(coordinator.clone()));
        assert!(f.bridge.calls().contains(&BridgeCall::RegisterCoordinator {
            global_id: gid.clone(),
            coordinator,
        }));

        let message = ProtocolMessage::from_message(receiver.recv().await.unwrap().message).unwrap();
        assert_eq!(message.action(), Action::Prepared);
        assert_eq!(message.to.participant_id(), Some("p-1"));
    }
}
