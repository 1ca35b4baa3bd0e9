//! Message types for the mock engine
//!
//! A message is an opaque body plus string headers. Protocol crates layer
//! typed wrappers on top; the engine never looks inside.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message that flows through the mock engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message body (serialized data)
    pub body: Vec<u8>,

    /// Headers for metadata
    pub headers: HashMap<String, String>,
}

impl Message {
    /// Create a new message with body and headers
    pub fn new(body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { body, headers }
    }

    /// Create a message with just body
    pub fn with_body(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: HashMap::new(),
        }
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set a header in place, replacing any previous value
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Get header value
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    /// Remove a header, returning its value
    pub fn take_header(&mut self, key: &str) -> Option<String> {
        self.headers.remove(key)
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Self {
        Message::with_body(body)
    }
}

impl From<(Vec<u8>, HashMap<String, String>)> for Message {
    fn from((body, headers): (Vec<u8>, HashMap<String, String>)) -> Self {
        Message::new(body, headers)
    }
}
