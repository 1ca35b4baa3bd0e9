//! This node's externally reachable protocol endpoints
//!
//! Addresses are published once the node's listeners are up. Until then every
//! lookup waits, bounded by `endpoint_wait` and rechecking every
//! `poll_interval`, and fails with `NoServiceEndpoint` past the bound.

use crate::config::WsatConfig;
use crate::error::{Result, WsatError};
use std::time::Duration;
use tokio::sync::watch;
use wsat_common::{GlobalId, RecoveryIdentity};
use wsat_protocol::{EndpointReference, RECOVERY_ID_PARAM};

/// The three base addresses a node exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseAddresses {
    pub registration: String,
    pub coordinator: String,
    pub participant: String,
}

impl BaseAddresses {
    pub fn from_config(config: &WsatConfig) -> Self {
        Self {
            registration: config.registration_address(),
            coordinator: config.coordinator_address(),
            participant: config.participant_address(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EndpointKind {
    Registration,
    Coordinator,
    Participant,
}

impl EndpointKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Coordinator => "coordinator",
            Self::Participant => "participant",
        }
    }

    fn select<'a>(&self, addresses: &'a BaseAddresses) -> &'a str {
        match self {
            Self::Registration => &addresses.registration,
            Self::Coordinator => &addresses.coordinator,
            Self::Participant => &addresses.participant,
        }
    }
}

/// Lazily resolved endpoint addresses
#[derive(Debug)]
pub struct EndpointDirectory {
    addresses: watch::Sender<Option<BaseAddresses>>,
    recovery_id: RecoveryIdentity,
    wait: Duration,
    poll_interval: Duration,
}

impl EndpointDirectory {
    pub fn new(recovery_id: RecoveryIdentity, wait: Duration, poll_interval: Duration) -> Self {
        let (addresses, _) = watch::channel(None);
        Self {
            addresses,
            recovery_id,
            wait,
            poll_interval,
        }
    }

    pub fn from_config(config: &WsatConfig) -> Self {
        Self::new(
            config.recovery_id.clone(),
            config.endpoint_wait,
            config.poll_interval,
        )
    }

    /// Make the addresses available and release every waiting lookup
    pub fn publish(&self, addresses: BaseAddresses) {
        tracing::info!(
            "Publishing endpoints: registration={} coordinator={} participant={}",
            addresses.registration,
            addresses.coordinator,
            addresses.participant
        );
        self.addresses.send_replace(Some(addresses));
    }

    pub fn withdraw(&self) {
        self.addresses.send_replace(None);
    }

    pub fn is_published(&self) -> bool {
        self.addresses.borrow().is_some()
    }

    pub fn recovery_id(&self) -> &RecoveryIdentity {
        &self.recovery_id
    }

    /// Registration base address if already published, without waiting
    pub fn registration_address(&self) -> Option<String> {
        self.addresses
            .borrow()
            .as_ref()
            .map(|addresses| addresses.registration.clone())
    }

    /// Registration endpoint for `global_id`, tagged with this node's
    /// recovery identity
    pub async fn registration_endpoint(&self, global_id: &GlobalId) -> Result<EndpointReference> {
        let address = self.resolve(EndpointKind::Registration).await?;
        Ok(EndpointReference::new(address)
            .for_transaction(global_id)
            .with_parameter(RECOVERY_ID_PARAM, self.recovery_id.as_str()))
    }

    pub async fn coordinator_endpoint(&self, global_id: &GlobalId) -> Result<EndpointReference> {
        let address = self.resolve(EndpointKind::Coordinator).await?;
        Ok(EndpointReference::new(address).for_transaction(global_id))
    }

    pub async fn participant_endpoint(&self, global_id: &GlobalId) -> Result<EndpointReference> {
        let address = self.resolve(EndpointKind::Participant).await?;
        Ok(EndpointReference::new(address).for_transaction(global_id))
    }

    async fn resolve(&self, kind: EndpointKind) -> Result<String> {
        let mut receiver = self.addresses.subscribe();
        let deadline = tokio::time::Instant::now() + self.wait;

        loop {
            if let Some(addresses) = receiver.borrow_and_update().as_ref() {
                return Ok(kind.select(addresses).to_string());
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!("No {} endpoint published after {:?}", kind.name(), self.wait);
                return Err(WsatError::NoServiceEndpoint(kind.name()));
            }

            if tokio::time::timeout(remaining.min(self.poll_interval), receiver.changed())
                .await
                .is_err()
            {
                tracing::debug!("Waiting for the {} endpoint to be published", kind.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addresses() -> BaseAddresses {
        BaseAddresses {
            registration: "https://node-a/wsat/registration".to_string(),
            coordinator: "https://node-a/wsat/coordinator".to_string(),
            participant: "https://node-a/wsat/participant".to_string(),
        }
    }

    fn directory() -> EndpointDirectory {
        EndpointDirectory::new(
            RecoveryIdentity::new("node-a"),
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_published_endpoints_carry_correlation() {
        let directory = directory();
        directory.publish(addresses());
        let gid = GlobalId::new("tx-42");

        let registration = directory.registration_endpoint(&gid).await.unwrap();
        assert_eq!(registration.address, "https://node-a/wsat/registration");
        assert_eq!(registration.global_id(), Some(gid.clone()));
        assert_eq!(registration.recovery_id(), Some("node-a"));

        let coordinator = directory.coordinator_endpoint(&gid).await.unwrap();
        assert_eq!(coordinator.global_id(), Some(gid.clone()));
        assert_eq!(coordinator.recovery_id(), None);

        let participant = directory.participant_endpoint(&gid).await.unwrap();
        assert_eq!(participant.address, "https://node-a/wsat/participant");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_waits_for_publish() {
        let directory = Arc::new(directory());

        let lookup = {
            let directory = directory.clone();
            tokio::spawn(async move {
                directory
                    .coordinator_endpoint(&GlobalId::new("tx-1"))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(45)).await;
        directory.publish(addresses());

        let endpoint = lookup.await.unwrap().unwrap();
        assert_eq!(endpoint.address, "https://node-a/wsat/coordinator");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_fails_past_bound() {
        let directory = directory();
        let result = directory.participant_endpoint(&GlobalId::new("tx-1")).await;
        assert!(matches!(result, Err(WsatError::NoServiceEndpoint("participant"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdraw_blocks_again() {
        let directory = directory();
        directory.publish(addresses());
        assert!(directory.is_published());

        directory.withdraw();
        assert!(directory.registration_address().is_none());
        assert!(
            directory
                .registration_endpoint(&GlobalId::new("tx-1"))
                .await
                .is_err()
        );
    }
}
