//! Node configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use wsat_common::RecoveryIdentity;

/// Configuration for one coordinator node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsatConfig {
    /// Identity of this node instance, attached to registration endpoints
    pub recovery_id: RecoveryIdentity,

    /// Prefix of the three endpoint addresses this node publishes
    pub base_address: String,

    /// Recheck interval for every bounded wait
    pub poll_interval: Duration,

    /// Longest wait for the endpoint directory to be published
    pub endpoint_wait: Duration,

    /// Longest wait for a participant's response in either phase
    pub response_timeout: Duration,

    /// Round-trip bound for register requests
    pub request_timeout: Duration,

    /// Transaction timeout used when the caller passes zero
    pub default_timeout: Duration,

    /// Only talk to `https://` endpoints
    pub secure_transport: bool,
}

impl Default for WsatConfig {
    fn default() -> Self {
        Self {
            recovery_id: RecoveryIdentity::random(),
            base_address: "http://localhost/wsat".to_string(),
            poll_interval: Duration::from_secs(30),
            endpoint_wait: Duration::from_secs(30),
            response_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            default_timeout: Duration::from_secs(120),
            secure_transport: false,
        }
    }
}

impl WsatConfig {
    /// Create a new config publishing endpoints under `base_address`
    pub fn new(base_address: impl Into<String>) -> Self {
        Self {
            base_address: base_address.into(),
            ..Default::default()
        }
    }

    pub fn with_recovery_id(mut self, recovery_id: impl Into<String>) -> Self {
        self.recovery_id = RecoveryIdentity::new(recovery_id);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_endpoint_wait(mut self, wait: Duration) -> Self {
        self.endpoint_wait = wait;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_secure_transport(mut self, secure: bool) -> Self {
        self.secure_transport = secure;
        self
    }

    pub fn registration_address(&self) -> String {
        format!("{}/registration", self.base_address)
    }

    pub fn coordinator_address(&self) -> String {
        format!("{}/coordinator", self.base_address)
    }

    pub fn participant_address(&self) -> String {
        format!("{}/participant", self.base_address)
    }
}
