//! One coordinator node: every service, wired once
//!
//! `WsatNode` builds the services explicitly and hands each one the shared
//! pieces it needs. `start` listens on the three protocol endpoints and then
//! publishes them in the directory.

use crate::bridge::TransactionManager;
use crate::config::WsatConfig;
use crate::coordinator::Coordinator;
use crate::directory::{BaseAddresses, EndpointDirectory};
use crate::error::{Result, WsatError};
use crate::handler::TransactionHandler;
use crate::participant::ParticipantService;
use crate::recovery::RecoveryService;
use crate::registration::RegistrationService;
use crate::registry::TransactionRegistry;
use crate::rpc::{ProtocolClient, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use wsat_engine::{Delivery, EndpointListener, MockClient};
use wsat_protocol::{Fault, FaultCode, ProtocolBody, ProtocolMessage};

pub struct WsatNode {
    config: WsatConfig,
    client: MockClient,
    registry: Arc<TransactionRegistry>,
    directory: Arc<EndpointDirectory>,
    registration: Arc<RegistrationService>,
    coordinator: Arc<Coordinator>,
    participant: Arc<ParticipantService>,
    recovery: Arc<RecoveryService>,
    handler: Arc<TransactionHandler>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsatNode {
    pub fn new(config: WsatConfig, client: MockClient, bridge: Arc<dyn TransactionManager>) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(client.clone());
        let protocol = Arc::new(ProtocolClient::new(
            transport.clone(),
            config.secure_transport,
            config.request_timeout,
        ));
        let registry = Arc::new(TransactionRegistry::new());
        let directory = Arc::new(EndpointDirectory::from_config(&config));

        let recovery = Arc::new(RecoveryService::new(
            config.clone(),
            registry.clone(),
            directory.clone(),
            bridge.clone(),
            protocol.clone(),
        ));
        let registration = Arc::new(RegistrationService::new(
            config.clone(),
            registry.clone(),
            directory.clone(),
            bridge.clone(),
            protocol.clone(),
            recovery.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            config.clone(),
            registry.clone(),
            bridge.clone(),
            protocol.clone(),
        ));
        let participant = Arc::new(ParticipantService::new(
            registry.clone(),
            bridge.clone(),
            protocol,
        ));
        let handler = Arc::new(TransactionHandler::new(
            registry.clone(),
            bridge,
            registration.clone(),
            transport,
        ));

        Self {
            config,
            client,
            registry,
            directory,
            registration,
            coordinator,
            participant,
            recovery,
            handler,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Listen on the protocol endpoints, then publish them
    pub fn start(&self) {
        let addresses = BaseAddresses::from_config(&self.config);

        let registration = self.client.listen(&addresses.registration);
        let coordinator = self.client.listen(&addresses.coordinator);
        let participant = self.client.listen(&addresses.participant);

        let mut tasks = self.tasks.lock();

        let service = self.registration.clone();
        tasks.push(spawn_dispatch(registration, move |delivery| {
            let service = service.clone();
            async move { dispatch_registration(&service, delivery).await }
        }));

        let service = self.coordinator.clone();
        tasks.push(spawn_dispatch(coordinator, move |delivery| {
            let service = service.clone();
            async move { dispatch_coordinator(&service, delivery).await }
        }));

        let service = self.participant.clone();
        tasks.push(spawn_dispatch(participant, move |delivery| {
            let service = service.clone();
            async move { dispatch_participant(&service, delivery).await }
        }));

        drop(tasks);
        self.directory.publish(addresses);
        tracing::info!("Node {} started", self.client.node_id());
    }

    /// Withdraw the endpoints and stop the dispatch tasks
    pub fn shutdown(&self) {
        self.directory.withdraw();

        let addresses = BaseAddresses::from_config(&self.config);
        let engine = self.client.engine();
        engine.unregister_handler(&addresses.registration);
        engine.unregister_handler(&addresses.coordinator);
        engine.unregister_handler(&addresses.participant);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Node {} stopped", self.client.node_id());
    }

    pub fn config(&self) -> &WsatConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<EndpointDirectory> {
        &self.directory
    }

    pub fn registration(&self) -> &Arc<RegistrationService> {
        &self.registration
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn participant(&self) -> &Arc<ParticipantService> {
        &self.participant
    }

    pub fn recovery(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }

    pub fn handler(&self) -> &Arc<TransactionHandler> {
        &self.handler
    }
}

impl Drop for WsatNode {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Spawn one task per delivery so a slow verb never blocks the endpoint
fn spawn_dispatch<F, Fut>(mut listener: EndpointListener, handle: F) -> JoinHandle<()>
where
    F: Fn(Delivery) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(delivery) = listener.recv().await {
            let address = listener.address().to_string();
            let work = handle(delivery);
            tokio::spawn(async move {
                if let Err(e) = work.await {
                    tracing::error!("Failed to handle message on {}: {}", address, e);
                }
            });
        }
    })
}

async fn dispatch_registration(service: &RegistrationService, delivery: Delivery) -> Result<()> {
    let Delivery { message, reply } = delivery;
    let message = ProtocolMessage::from_message(message)?;

    let mut request = match message.body {
        ProtocolBody::Register(request) => request,
        other => {
            return Err(WsatError::UnexpectedResponse(format!(
                "{} on the registration endpoint",
                other.action().as_str()
            )));
        }
    };
    if request.recovery_id.is_none() {
        request.recovery_id = message.to.recovery_id().map(String::from);
    }

    let body = match service.register(request).await {
        Ok(coordinator) => ProtocolBody::RegisterResponse { coordinator },
        Err(WsatError::CannotRegisterParticipant(reason)) => {
            ProtocolBody::Fault(Fault::cannot_register(reason))
        }
        Err(e) => ProtocolBody::Fault(Fault::new(FaultCode::ProcessingFailure, e.to_string())),
    };

    let Some(reply) = reply else {
        tracing::warn!("Register sent without a reply channel");
        return Ok(());
    };
    let response = ProtocolMessage::reply(body).into_message()?;
    if reply.send(response).is_err() {
        tracing::warn!("Registering party went away before the response");
    }
    Ok(())
}

async fn dispatch_coordinator(service: &Coordinator, delivery: Delivery) -> Result<()> {
    let message = ProtocolMessage::from_message(delivery.message)?;
    service
        .on_response(message.action(), &message.to, message.reply_to.as_ref())
        .await
}

async fn dispatch_participant(service: &ParticipantService, delivery: Delivery) -> Result<()> {
    let message = ProtocolMessage::from_message(delivery.message)?;
    let global_id = message.global_id().ok_or_else(|| {
        WsatError::UnexpectedResponse(format!("{} without global id", message.action().as_str()))
    })?;
    let from = message.reply_to.as_ref();

    match message.body {
        ProtocolBody::Prepare => service.on_prepare(&global_id, from).await,
        ProtocolBody::Commit => service.on_commit(&global_id, from).await,
        ProtocolBody::Rollback => service.on_rollback(&global_id, from).await,
        other => {
            return Err(WsatError::UnexpectedResponse(format!(
                "{} on the participant endpoint",
                other.action().as_str()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransactionManager;
    use std::time::Duration;
    use wsat_common::GlobalId;
    use wsat_engine::MockEngine;
    use wsat_protocol::{EndpointReference, RegisterRequest};

    fn node(engine: &Arc<MockEngine>) -> WsatNode {
        let config = WsatConfig::new("https://node-a/wsat").with_recovery_id("node-a");
        WsatNode::new(
            config,
            MockClient::new("node-a", engine.clone()),
            Arc::new(MockTransactionManager::new()),
        )
    }

    fn register(id: &str) -> RegisterRequest {
        RegisterRequest {
            properties: Default::default(),
            global_id: GlobalId::new(id),
            participant: EndpointReference::new("https://node-b/wsat/participant"),
            recovery_id: None,
        }
    }

    #[tokio::test]
    async fn test_start_publishes_endpoints() {
        let engine = Arc::new(MockEngine::new());
        let node = node(&engine);
        assert!(!node.directory().is_published());

        node.start();

        assert!(node.directory().is_published());
        assert!(engine.has_handler("https://node-a/wsat/registration"));
        assert!(engine.has_handler("https://node-a/wsat/coordinator"));
        assert!(engine.has_handler("https://node-a/wsat/participant"));
    }

    #[tokio::test]
    async fn test_register_for_unknown_transaction_faults() {
        let engine = Arc::new(MockEngine::new());
        let node = node(&engine);
        node.start();

        let client = MockClient::new("node-b", engine.clone());
        let message = ProtocolMessage::new(
            EndpointReference::new("https://node-a/wsat/registration"),
            ProtocolBody::Register(register("tx-none")),
        )
        .into_message()
        .unwrap();

        let reply = client
            .request("https://node-a/wsat/registration", message, Duration::from_secs(1))
            .await
            .unwrap();

        match ProtocolMessage::from_message(reply).unwrap().body {
            ProtocolBody::Fault(fault) => assert_eq!(fault.code, FaultCode::CannotRegisterParticipant),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_over_the_wire() {
        let engine = Arc::new(MockEngine::new());
        let node = node(&engine);
        node.start();
        let gid = GlobalId::new("tx-1");
        node.registration()
            .activate_as_coordinator(&gid, 10_000)
            .await
            .unwrap();

        let message = ProtocolMessage::new(
            EndpointReference::new("https://node-a/wsat/registration"),
            ProtocolBody::Register(register("tx-1")),
        )
        .into_message()
        .unwrap();
        let reply = MockClient::new("node-b", engine.clone())
            .request("https://node-a/wsat/registration", message, Duration::from_secs(1))
            .await
            .unwrap();

        let ProtocolBody::RegisterResponse { coordinator } = ProtocolMessage::from_message(reply).unwrap().body
        else {
            panic!("expected register response");
        };
        assert_eq!(coordinator.global_id(), Some(gid));
    }

    #[tokio::test]
    async fn test_shutdown_withdraws_endpoints() {
        let engine = Arc::new(MockEngine::new());
        let node = node(&engine);
        node.start();
        node.shutdown();

        assert!(!node.directory().is_published());
        assert!(!engine.has_handler("https://node-a/wsat/coordinator"));
    }
}
