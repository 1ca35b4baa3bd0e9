//! Per-node recovery identity

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a node instance, independent of any transaction
///
/// Registration endpoints published by a node carry its recovery identity.
/// After a crash, a peer that inherited the node's log answers to the same
/// identity, which lets registrations be rerouted to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveryIdentity(String);

impl RecoveryIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identity for nodes that do not configure one
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `other` names this node instance
    pub fn matches(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl fmt::Display for RecoveryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for RecoveryIdentity {
    fn default() -> Self {
        Self::random()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        let id = RecoveryIdentity::new("node-a");
        assert!(id.matches("node-a"));
        assert!(!id.matches("node-b"));
    }

    #[test]
    fn test_random_identities_differ() {
        assert_ne!(RecoveryIdentity::random(), RecoveryIdentity::random());
    }
}
