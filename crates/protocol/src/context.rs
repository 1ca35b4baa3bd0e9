//! Coordination context carried on application calls

use crate::endpoint::EndpointReference;
use crate::messages::ParseError;
use serde::{Deserialize, Serialize};
use wsat_common::{GlobalId, Timestamp};
use wsat_engine::Message;

/// Header holding the serialized coordination context
pub const COORDINATION_CONTEXT_HEADER: &str = "coordination_context";

/// Everything a remote service needs to join a global transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationContext {
    /// Transaction the call runs under
    pub global_id: GlobalId,

    /// Absolute expiry of the transaction
    pub expires: Timestamp,

    /// Where the receiving node registers as a participant
    pub registration: EndpointReference,
}

impl CoordinationContext {
    pub fn new(global_id: GlobalId, expires: Timestamp, registration: EndpointReference) -> Self {
        Self {
            global_id,
            expires,
            registration,
        }
    }

    /// Milliseconds left before expiry, negative once expired
    pub fn remaining_millis(&self) -> i64 {
        let now = Timestamp::now().as_millis() as i64;
        self.expires.as_millis() as i64 - now
    }

    /// Attach this context to an outbound application message
    pub fn attach(&self, message: &mut Message) -> Result<(), ParseError> {
        let encoded = serde_json::to_string(self).map_err(ParseError::InvalidBody)?;
        message.set_header(COORDINATION_CONTEXT_HEADER, encoded);
        Ok(())
    }

    /// Extract the context from an inbound application message, if any
    pub fn from_message(message: &Message) -> Result<Option<Self>, ParseError> {
        message
            .get_header(COORDINATION_CONTEXT_HEADER)
            .map(|raw| serde_json::from_str(raw).map_err(ParseError::InvalidBody))
            .transpose()
    }

    /// Strip the context from a message
    pub fn detach(message: &mut Message) {
        message.take_header(COORDINATION_CONTEXT_HEADER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_message_without_context() {
        let message = Message::with_body(b"business".to_vec());
        assert!(CoordinationContext::from_message(&message).unwrap().is_none());
    }

    #[test]
    fn test_attach_and_extract() {
        let registration = EndpointReference::new("https://node-a/wsat/registration")
            .for_transaction(&GlobalId::new("tx-42"));
        let context = CoordinationContext::new(
            GlobalId::new("tx-42"),
            Timestamp::now().add(Duration::from_secs(60)),
            registration,
        );

        let mut message = Message::with_body(b"business".to_vec());
        context.attach(&mut message).unwrap();

        let extracted = CoordinationContext::from_message(&message).unwrap().unwrap();
        assert_eq!(extracted, context);
        assert!(extracted.remaining_millis() > 0);

        CoordinationContext::detach(&mut message);
        assert!(CoordinationContext::from_message(&message).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_context_is_an_error() {
        let message = Message::default().with_header(COORDINATION_CONTEXT_HEADER, "{not json");
        assert!(CoordinationContext::from_message(&message).is_err());
    }
}
