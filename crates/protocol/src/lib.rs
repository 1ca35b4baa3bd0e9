//! Protocol definitions for coordinator/participant communication
//!
//! This crate defines typed message wrappers around the generic `Message`
//! type from wsat-engine: endpoint references with correlation parameters,
//! the coordination context attached to application calls, and the
//! registration and two-phase-commit verbs.

pub mod context;
pub mod endpoint;
pub mod messages;
pub mod responses;

pub use context::{COORDINATION_CONTEXT_HEADER, CoordinationContext};
pub use endpoint::{
    EndpointReference, GLOBAL_ID_PARAM, PARTICIPANT_ID_PARAM, RECOVERY_ID_PARAM,
};
pub use messages::{Action, ParseError, ProtocolBody, ProtocolMessage, RegisterRequest};
pub use responses::{Fault, FaultCode};
