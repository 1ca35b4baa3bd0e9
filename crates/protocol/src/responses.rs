//! Structured faults returned to remote callers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fault classification understood by both sides of the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    /// The named transaction is unknown and could not be rerouted
    CannotRegisterParticipant,
    /// The receiver failed for a reason unrelated to the request itself
    ProcessingFailure,
}

impl FaultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CannotRegisterParticipant => "cannot_register_participant",
            Self::ProcessingFailure => "processing_failure",
        }
    }
}

/// Protocol fault sent in place of a regular response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: FaultCode,
    pub reason: String,
}

impl Fault {
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn cannot_register(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::CannotRegisterParticipant, reason)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.reason)
    }
}
