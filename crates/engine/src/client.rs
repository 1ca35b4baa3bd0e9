//! Mock client bound to one node
//!
//! Each node talks to the engine through its own client so traffic can be
//! attributed to a sender in logs.

use crate::{Delivery, Message, Result, engine::MockEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Mock client for interacting with the mock engine
#[derive(Clone)]
pub struct MockClient {
    /// Node ID
    node_id: String,

    /// Reference to the mock engine
    engine: Arc<MockEngine>,
}

impl MockClient {
    /// Create a new mock client
    pub fn new(node_id: impl Into<String>, engine: Arc<MockEngine>) -> Self {
        Self {
            node_id: node_id.into(),
            engine,
        }
    }

    /// Get the node ID of this client
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Access the underlying engine
    pub fn engine(&self) -> &Arc<MockEngine> {
        &self.engine
    }

    /// Start receiving messages addressed to `address`
    pub fn listen(&self, address: &str) -> EndpointListener {
        tracing::debug!("{} listening on {}", self.node_id, address);
        EndpointListener {
            address: address.to_string(),
            receiver: self.engine.register_handler(address),
        }
    }

    /// Deliver a one-way message
    pub async fn send(&self, address: &str, message: impl Into<Message>) -> Result<()> {
        self.engine.send(address, message.into())
    }

    /// Send a request and wait for a reply
    pub async fn request(
        &self,
        address: &str,
        message: impl Into<Message>,
        timeout: Duration,
    ) -> Result<Message> {
        self.engine.request(address, message.into(), timeout).await
    }
}

/// Stream of deliveries for one endpoint address
pub struct EndpointListener {
    address: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl EndpointListener {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Receive the next delivery
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Try to receive without blocking
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

impl futures::Stream for EndpointListener {
    type Item = Delivery;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
