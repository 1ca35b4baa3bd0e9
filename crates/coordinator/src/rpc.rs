//! Outbound protocol client
//!
//! Turns a protocol verb into a network call to an endpoint reference. Every
//! call runs inside its own `wsat.call` span so log lines emitted while the
//! call is in flight are attributed to it.

use crate::error::{Result, WsatError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use wsat_engine::{Message, MockClient};
use wsat_protocol::{
    Action, EndpointReference, FaultCode, ProtocolBody, ProtocolMessage, RegisterRequest,
};

/// Carries raw messages between nodes
#[async_trait]
pub trait Transport: Send + Sync {
    /// One-way delivery
    async fn send(&self, address: &str, message: Message) -> Result<()>;

    /// Request with a reply on the same channel
    async fn request(&self, address: &str, message: Message, timeout: Duration) -> Result<Message>;
}

#[async_trait]
impl Transport for MockClient {
    async fn send(&self, address: &str, message: Message) -> Result<()> {
        MockClient::send(self, address, message)
            .await
            .map_err(|e| WsatError::Transport(e.to_string()))
    }

    async fn request(&self, address: &str, message: Message, timeout: Duration) -> Result<Message> {
        MockClient::request(self, address, message, timeout)
            .await
            .map_err(|e| WsatError::Transport(e.to_string()))
    }
}

/// Stateless client for the registration and completion verbs
pub struct ProtocolClient {
    transport: Arc<dyn Transport>,
    secure_transport: bool,
    request_timeout: Duration,
}

impl ProtocolClient {
    pub fn new(transport: Arc<dyn Transport>, secure_transport: bool, request_timeout: Duration) -> Self {
        Self {
            transport,
            secure_transport,
            request_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Ask the coordinator at `registration` to enlist a participant.
    /// Returns the coordinator endpoint the participant must answer to.
    pub async fn register(
        &self,
        registration: &EndpointReference,
        request: RegisterRequest,
    ) -> Result<EndpointReference> {
        self.check_secure(registration)?;
        let span = tracing::debug_span!(
            "wsat.call",
            action = Action::Register.as_str(),
            to = %registration
        );

        async move {
            let message =
                ProtocolMessage::new(registration.clone(), ProtocolBody::Register(request)).into_message()?;
            let reply = self
                .transport
                .request(&registration.address, message, self.request_timeout)
                .await?;

            match ProtocolMessage::from_message(reply)?.body {
                ProtocolBody::RegisterResponse { coordinator } => {
                    tracing::debug!("Registered, coordinator endpoint {}", coordinator);
                    Ok(coordinator)
                }
                ProtocolBody::Fault(fault) if fault.code == FaultCode::CannotRegisterParticipant => {
                    Err(WsatError::CannotRegisterParticipant(fault.reason))
                }
                ProtocolBody::Fault(fault) => Err(WsatError::Fault(fault)),
                other => Err(WsatError::UnexpectedResponse(format!(
                    "{} in reply to register",
                    other.action().as_str()
                ))),
            }
        }
        .instrument(span)
        .await
    }

    /// Send a one-way protocol notification
    pub async fn notify(
        &self,
        to: &EndpointReference,
        body: ProtocolBody,
        reply_to: Option<&EndpointReference>,
    ) -> Result<()> {
        self.check_secure(to)?;
        let span = tracing::debug_span!("wsat.call", action = body.action().as_str(), to = %to);

        async move {
            let mut message = ProtocolMessage::new(to.clone(), body);
            if let Some(reply_to) = reply_to {
                message = message.with_reply_to(reply_to.clone());
            }
            self.transport
                .send(&to.address, message.into_message()?)
                .await?;
            tracing::debug!("Sent");
            Ok(())
        }
        .instrument(span)
        .await
    }

    pub async fn prepare(&self, to: &EndpointReference, reply_to: &EndpointReference) -> Result<()> {
        self.notify(to, ProtocolBody::Prepare, Some(reply_to)).await
    }

    pub async fn commit(&self, to: &EndpointReference, reply_to: &EndpointReference) -> Result<()> {
        self.notify(to, ProtocolBody::Commit, Some(reply_to)).await
    }

    pub async fn rollback(&self, to: &EndpointReference, reply_to: &EndpointReference) -> Result<()> {
        self.notify(to, ProtocolBody::Rollback, Some(reply_to)).await
    }

    pub async fn prepared(&self, to: &EndpointReference, reply_to: Option<&EndpointReference>) -> Result<()> {
        self.notify(to, ProtocolBody::Prepared, reply_to).await
    }

    pub async fn read_only(&self, to: &EndpointReference) -> Result<()> {
        self.notify(to, ProtocolBody::ReadOnly, None).await
    }

    pub async fn aborted(&self, to: &EndpointReference) -> Result<()> {
        self.notify(to, ProtocolBody::Aborted, None).await
    }

    pub async fn committed(&self, to: &EndpointReference) -> Result<()> {
        self.notify(to, ProtocolBody::Committed, None).await
    }

    fn check_secure(&self, to: &EndpointReference) -> Result<()> {
        if self.secure_transport && !to.is_secure() {
            return Err(WsatError::InsecureEndpoint(to.address.clone()));
        }
        Ok(())
    }
}

/// Properties sent with every durable two-phase-commit registration
pub fn durable_2pc_properties() -> BTreeMap<String, String> {
    BTreeMap::from([("protocol".to_string(), "durable-2pc".to_string())])
}
