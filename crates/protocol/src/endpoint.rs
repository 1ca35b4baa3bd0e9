//! Endpoint references: an address plus correlation parameters

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use wsat_common::GlobalId;

/// Reference parameter naming the global transaction
pub const GLOBAL_ID_PARAM: &str = "global_id";

/// Reference parameter naming the recovery identity of the issuing node
pub const RECOVERY_ID_PARAM: &str = "recovery_id";

/// Reference parameter naming a participant within a transaction
pub const PARTICIPANT_ID_PARAM: &str = "participant_id";

/// Address used for replies that travel back on the request channel
pub const ANONYMOUS_ADDRESS: &str = "anonymous";

/// Where to send a specific protocol message
///
/// Parameters are echoed back by the receiver on every message it sends to
/// this reference, which is how a node correlates an inbound notification
/// with the transaction (and participant) it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointReference {
    pub address: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl EndpointReference {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Reference for replies on the request channel
    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_ADDRESS)
    }

    pub fn is_anonymous(&self) -> bool {
        self.address == ANONYMOUS_ADDRESS
    }

    /// Copy of this reference with a parameter set
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Copy of this reference correlated to a transaction
    pub fn for_transaction(&self, global_id: &GlobalId) -> Self {
        self.clone()
            .with_parameter(GLOBAL_ID_PARAM, global_id.as_str())
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|s| s.as_str())
    }

    pub fn global_id(&self) -> Option<GlobalId> {
        self.parameter(GLOBAL_ID_PARAM).map(GlobalId::from)
    }

    pub fn recovery_id(&self) -> Option<&str> {
        self.parameter(RECOVERY_ID_PARAM)
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.parameter(PARTICIPANT_ID_PARAM)
    }

    /// Whether the address uses a secure scheme
    pub fn is_secure(&self) -> bool {
        self.address.starts_with("https://")
    }

    /// Same destination, ignoring correlation parameters
    pub fn same_address(&self, other: &EndpointReference) -> bool {
        self.address == other.address
    }
}

impl fmt::Display for EndpointReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if !self.parameters.is_empty() {
            let params: Vec<String> = self
                .parameters
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "[{}]", params.join(","))?;
        }
        Ok(())
    }
}
