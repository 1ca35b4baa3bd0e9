//! Prepare votes

use serde::{Deserialize, Serialize};

/// Outcome of asking a local transaction manager to prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// Resources are prepared and wait for the outcome
    Commit,
    /// Nothing was written; no second phase is needed
    ReadOnly,
    /// Resources cannot commit
    Rollback,
}

impl Vote {
    /// Whether this vote allows the transaction to commit
    pub fn allows_commit(&self) -> bool {
        !matches!(self, Vote::Rollback)
    }
}
