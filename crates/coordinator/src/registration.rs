//! Registration and activation
//!
//! Activation creates the control record the first time this node acts as
//! coordinator or participant for a global id. Registration enlists a remote
//! participant with a transaction this node coordinates.

use crate::bridge::TransactionManager;
use crate::config::WsatConfig;
use crate::coordinator::RemoteParticipant;
use crate::directory::EndpointDirectory;
use crate::error::{Result, WsatError};
use crate::recovery::RecoveryService;
use crate::registry::TransactionRegistry;
use crate::rpc::{ProtocolClient, durable_2pc_properties};
use crate::transaction::{CoordinatorRecord, GlobalTransaction, ParticipantSideRecord};
use std::sync::Arc;
use std::time::Duration;
use wsat_common::{GlobalId, Timestamp};
use wsat_protocol::{CoordinationContext, EndpointReference, RegisterRequest};

pub struct RegistrationService {
    config: WsatConfig,
    registry: Arc<TransactionRegistry>,
    directory: Arc<EndpointDirectory>,
    bridge: Arc<dyn TransactionManager>,
    client: Arc<ProtocolClient>,
    recovery: Arc<RecoveryService>,
}

impl RegistrationService {
    pub fn new(
        config: WsatConfig,
        registry: Arc<TransactionRegistry>,
        directory: Arc<EndpointDirectory>,
        bridge: Arc<dyn TransactionManager>,
        client: Arc<ProtocolClient>,
        recovery: Arc<RecoveryService>,
    ) -> Self {
        Self {
            config,
            registry,
            directory,
            bridge,
            client,
            recovery,
        }
    }

    /// Start coordinating `global_id`.
    ///
    /// Returns the context callers attach to outbound calls. Activating an
    /// id this node already coordinates returns the existing context.
    pub async fn activate_as_coordinator(
        &self,
        global_id: &GlobalId,
        timeout_millis: i64,
    ) -> Result<CoordinationContext> {
        let deadline = self.deadline(global_id, timeout_millis)?;

        if let Some(existing) = self.registry.get(global_id)
            && existing.as_coordinator().is_some()
        {
            return Ok(existing.context());
        }

        let registration = self.directory.registration_endpoint(global_id).await?;
        let coordinator = self.directory.coordinator_endpoint(global_id).await?;

        let tx = self.registry.put(GlobalTransaction::coordinator(
            global_id.clone(),
            deadline,
            CoordinatorRecord::new(registration, coordinator),
        ));

        tracing::debug!("Activated {} as coordinator", global_id);
        Ok(tx.context())
    }

    /// Start participating in `global_id`, coordinated by the owner of
    /// `registration`
    pub fn activate_as_participant(
        &self,
        global_id: &GlobalId,
        registration: EndpointReference,
        timeout_millis: i64,
    ) -> Result<Arc<GlobalTransaction>> {
        let deadline = self.deadline(global_id, timeout_millis)?;

        let tx = self.registry.put(GlobalTransaction::participant(
            global_id.clone(),
            deadline,
            ParticipantSideRecord::new(registration),
        ));

        tracing::debug!("Activated {} as participant", global_id);
        Ok(tx)
    }

    /// Enlist a remote participant, returning the coordinator endpoint it
    /// must send its responses to
    pub async fn register(&self, request: RegisterRequest) -> Result<EndpointReference> {
        if let Some(rerouted) = self.recovery.reroute(&request).await {
            return rerouted;
        }

        let global_id = &request.global_id;
        let tx = self.registry.get(global_id).ok_or_else(|| {
            WsatError::CannotRegisterParticipant(format!("unknown transaction {}", global_id))
        })?;
        let record = tx.as_coordinator().ok_or_else(|| {
            WsatError::CannotRegisterParticipant(format!("{} is not coordinated here", global_id))
        })?;

        let Some((participant, added)) = record.add_participant(global_id, request.participant) else {
            return Err(WsatError::CannotRegisterParticipant(format!(
                "{} is already completing",
                global_id
            )));
        };
        let coordinator = record.endpoint_for(&participant);

        if !added {
            tracing::debug!(
                "Participant {} already registered with {}",
                participant.id(),
                global_id
            );
            return Ok(coordinator);
        }

        let remote = Arc::new(RemoteParticipant::new(
            participant.clone(),
            self.client.clone(),
            coordinator.clone(),
            &self.config,
        ));

        if let Err(e) = self.bridge.register_participant(global_id, remote) {
            record.remove_participant(participant.id());
            return Err(WsatError::CannotRegisterParticipant(e.to_string()));
        }

        tracing::debug!(
            "Registered participant {} at {} with {}",
            participant.id(),
            participant.endpoint(),
            global_id
        );
        Ok(coordinator)
    }

    /// Register this node as participant with the remote coordinator of
    /// `tx`, remembering where to send protocol responses
    pub async fn register_participant_with_coordinator(
        &self,
        global_id: &GlobalId,
        tx: &GlobalTransaction,
    ) -> Result<EndpointReference> {
        let record = tx.as_participant().ok_or_else(|| WsatError::WrongRole {
            global_id: global_id.clone(),
            expected: "participant",
        })?;

        let participant = self.directory.participant_endpoint(global_id).await?;
        let request = RegisterRequest {
            properties: durable_2pc_properties(),
            global_id: global_id.clone(),
            participant,
            recovery_id: record.registration_endpoint.recovery_id().map(String::from),
        };

        let coordinator = self
            .client
            .register(&record.registration_endpoint, request)
            .await?;

        record.set_coordinator_endpoint(coordinator.clone());
        self.bridge.register_coordinator(global_id, &coordinator)?;

        Ok(coordinator)
    }

    fn deadline(&self, global_id: &GlobalId, timeout_millis: i64) -> Result<Timestamp> {
        if timeout_millis < 0 {
            return Err(WsatError::ExpiredTransaction {
                global_id: global_id.clone(),
                timeout_millis,
            });
        }

        let timeout = match timeout_millis {
            0 => self.config.default_timeout,
            millis => Duration::from_millis(millis as u64),
        };
        Ok(Timestamp::now().add(timeout))
    }
}
