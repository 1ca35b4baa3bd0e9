//! Typed wrappers around `Message` for registration and 2PC traffic
//!
//! Wire layout:
//! - `action` header names the protocol verb
//! - `to` header carries the destination address
//! - `ref.<name>` headers carry the destination's reference parameters
//! - `reply_to` header (JSON) names where responses should go
//! - the body is JSON for verbs that have a payload, empty otherwise

use crate::endpoint::EndpointReference;
use crate::responses::Fault;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use wsat_common::GlobalId;
use wsat_engine::Message;

const ACTION_HEADER: &str = "action";
const TO_HEADER: &str = "to";
const REPLY_TO_HEADER: &str = "reply_to";
const REFERENCE_PREFIX: &str = "ref.";

/// Protocol verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Register,
    RegisterResponse,
    Fault,
    /// Phase 1 vote request
    Prepare,
    /// Phase 2 outcome
    Commit,
    /// Phase 2 outcome
    Rollback,
    Prepared,
    ReadOnly,
    Aborted,
    Committed,
}

impl Action {
    /// Parse from string header value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "register" => Some(Self::Register),
            "register_response" => Some(Self::RegisterResponse),
            "fault" => Some(Self::Fault),
            "prepare" => Some(Self::Prepare),
            "commit" => Some(Self::Commit),
            "rollback" => Some(Self::Rollback),
            "prepared" => Some(Self::Prepared),
            "read_only" => Some(Self::ReadOnly),
            "aborted" => Some(Self::Aborted),
            "committed" => Some(Self::Committed),
            _ => None,
        }
    }

    /// Convert to string header value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::RegisterResponse => "register_response",
            Self::Fault => "fault",
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Prepared => "prepared",
            Self::ReadOnly => "read_only",
            Self::Aborted => "aborted",
            Self::Committed => "committed",
        }
    }
}

/// Request to join a transaction as participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Free-form registration properties (protocol identifier and the like)
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    pub global_id: GlobalId,

    /// Where the coordinator sends prepare/commit/rollback
    pub participant: EndpointReference,

    /// Recovery identity the registering party was given, if any
    #[serde(default)]
    pub recovery_id: Option<String>,
}

/// Payload of a protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolBody {
    Register(RegisterRequest),
    RegisterResponse { coordinator: EndpointReference },
    Fault(Fault),
    Prepare,
    Commit,
    Rollback,
    Prepared,
    ReadOnly,
    Aborted,
    Committed,
}

impl ProtocolBody {
    pub fn action(&self) -> Action {
        match self {
            Self::Register(_) => Action::Register,
            Self::RegisterResponse { .. } => Action::RegisterResponse,
            Self::Fault(_) => Action::Fault,
            Self::Prepare => Action::Prepare,
            Self::Commit => Action::Commit,
            Self::Rollback => Action::Rollback,
            Self::Prepared => Action::Prepared,
            Self::ReadOnly => Action::ReadOnly,
            Self::Aborted => Action::Aborted,
            Self::Committed => Action::Committed,
        }
    }

    /// Body for a payload-free notification verb
    pub fn notification(action: Action) -> Option<Self> {
        match action {
            Action::Prepare => Some(Self::Prepare),
            Action::Commit => Some(Self::Commit),
            Action::Rollback => Some(Self::Rollback),
            Action::Prepared => Some(Self::Prepared),
            Action::ReadOnly => Some(Self::ReadOnly),
            Action::Aborted => Some(Self::Aborted),
            Action::Committed => Some(Self::Committed),
            Action::Register | Action::RegisterResponse | Action::Fault => None,
        }
    }
}

/// A protocol message addressed to an endpoint reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    /// Destination, including the correlation parameters it asked for
    pub to: EndpointReference,

    /// Where the receiver should direct its response
    pub reply_to: Option<EndpointReference>,

    pub body: ProtocolBody,
}

impl ProtocolMessage {
    pub fn new(to: EndpointReference, body: ProtocolBody) -> Self {
        Self {
            to,
            reply_to: None,
            body,
        }
    }

    /// Reply travelling back on the request channel
    pub fn reply(body: ProtocolBody) -> Self {
        Self::new(EndpointReference::anonymous(), body)
    }

    pub fn with_reply_to(mut self, reply_to: EndpointReference) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn action(&self) -> Action {
        self.body.action()
    }

    /// Global transaction the destination reference is correlated with
    pub fn global_id(&self) -> Option<GlobalId> {
        match &self.body {
            ProtocolBody::Register(request) => Some(request.global_id.clone()),
            _ => self.to.global_id(),
        }
    }

    /// Parse a raw Message into a typed ProtocolMessage
    pub fn from_message(msg: Message) -> Result<Self, ParseError> {
        let action_str = msg
            .get_header(ACTION_HEADER)
            .ok_or(ParseError::MissingHeader(ACTION_HEADER))?;
        let action = Action::parse(action_str)
            .ok_or_else(|| ParseError::UnknownAction(action_str.to_string()))?;

        let address = msg
            .get_header(TO_HEADER)
            .ok_or(ParseError::MissingHeader(TO_HEADER))?
            .to_string();

        let parameters = msg
            .headers
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(REFERENCE_PREFIX)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect();

        let reply_to = msg
            .get_header(REPLY_TO_HEADER)
            .map(|raw| serde_json::from_str(raw).map_err(ParseError::InvalidBody))
            .transpose()?;

        let body = match action {
            Action::Register => {
                ProtocolBody::Register(serde_json::from_slice(&msg.body).map_err(ParseError::InvalidBody)?)
            }
            Action::RegisterResponse => ProtocolBody::RegisterResponse {
                coordinator: serde_json::from_slice(&msg.body).map_err(ParseError::InvalidBody)?,
            },
            Action::Fault => {
                ProtocolBody::Fault(serde_json::from_slice(&msg.body).map_err(ParseError::InvalidBody)?)
            }
            other => ProtocolBody::notification(other)
                .ok_or_else(|| ParseError::UnknownAction(other.as_str().to_string()))?,
        };

        Ok(ProtocolMessage {
            to: EndpointReference {
                address,
                parameters,
            },
            reply_to,
            body,
        })
    }

    /// Convert to a raw Message for sending
    pub fn into_message(self) -> Result<Message, ParseError> {
        let mut headers = HashMap::new();
        headers.insert(ACTION_HEADER.to_string(), self.action().as_str().to_string());
        headers.insert(TO_HEADER.to_string(), self.to.address.clone());

        for (name, value) in &self.to.parameters {
            headers.insert(format!("{}{}", REFERENCE_PREFIX, name), value.clone());
        }

        if let Some(reply_to) = &self.reply_to {
            headers.insert(
                REPLY_TO_HEADER.to_string(),
                serde_json::to_string(reply_to).map_err(ParseError::InvalidBody)?,
            );
        }

        let body = match &self.body {
            ProtocolBody::Register(request) => serde_json::to_vec(request),
            ProtocolBody::RegisterResponse { coordinator } => serde_json::to_vec(coordinator),
            ProtocolBody::Fault(fault) => serde_json::to_vec(fault),
            _ => Ok(Vec::new()),
        }
        .map_err(ParseError::InvalidBody)?;

        Ok(Message::new(body, headers))
    }
}

/// Errors that can occur when parsing messages
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("Unknown protocol action: {0}")]
    UnknownAction(String),

    #[error("Invalid message body: {0}")]
    InvalidBody(#[source] serde_json::Error),
}
