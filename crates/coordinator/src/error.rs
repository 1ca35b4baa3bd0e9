//! Error types for the coordinator

use crate::state::ParticipantState;
use thiserror::Error;
use wsat_common::GlobalId;
use wsat_protocol::{Fault, ParseError};

/// Coordinator error types
#[derive(Error, Debug)]
pub enum WsatError {
    #[error("Transaction {global_id} has expired (timeout {timeout_millis}ms)")]
    ExpiredTransaction {
        global_id: GlobalId,
        timeout_millis: i64,
    },

    #[error("No {0} endpoint has been published")]
    NoServiceEndpoint(&'static str),

    #[error("Cannot register participant: {0}")]
    CannotRegisterParticipant(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(GlobalId),

    #[error("Transaction {global_id} is not in the {expected} role")]
    WrongRole {
        global_id: GlobalId,
        expected: &'static str,
    },

    #[error("Participant {participant} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        participant: String,
        from: ParticipantState,
        to: ParticipantState,
    },

    #[error("Timed out waiting for participant {participant} of {global_id}")]
    ResponseTimeout {
        global_id: GlobalId,
        participant: String,
    },

    #[error("Refusing insecure endpoint address: {0}")]
    InsecureEndpoint(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote fault: {0}")]
    Fault(Fault),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("Transaction manager error: {0}")]
    Bridge(#[from] BridgeError),
}

/// Failure reported by the local transaction manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BridgeError(pub String);

impl BridgeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, WsatError>;
