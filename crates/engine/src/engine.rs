//! Core mock engine implementation
//!
//! The engine routes messages to handlers registered per endpoint address.
//! Two delivery modes exist: request/reply (the caller waits for exactly one
//! reply) and one-way (the handler receives no reply channel). Every delivery
//! is also copied to any active taps so tests can observe protocol traffic.

use crate::{Message, MockEngineError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A message delivered to an endpoint handler
#[derive(Debug)]
pub struct Delivery {
    /// The message as sent
    pub message: Message,

    /// Reply channel, present only for request/reply delivery
    pub reply: Option<oneshot::Sender<Message>>,
}

impl Delivery {
    /// Answer a request. One-way deliveries silently ignore the reply.
    pub fn respond(self, message: Message) -> bool {
        match self.reply {
            Some(reply) => reply.send(message).is_ok(),
            None => false,
        }
    }

    /// Whether the sender is waiting for a reply
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }
}

/// Type alias for endpoint handler channels
type EndpointHandler = mpsc::UnboundedSender<Delivery>;

/// Copy of a delivered message together with its destination
#[derive(Debug, Clone)]
pub struct TappedMessage {
    pub address: String,
    pub message: Message,
}

/// Mock engine that simulates the network between nodes
pub struct MockEngine {
    /// Handlers indexed by endpoint address
    handlers: Arc<Mutex<HashMap<String, EndpointHandler>>>,

    /// Addresses that currently drop all traffic
    partitioned: Arc<Mutex<HashSet<String>>>,

    /// Observers receiving a copy of every delivery
    taps: Arc<Mutex<Vec<mpsc::UnboundedSender<TappedMessage>>>>,
}

impl MockEngine {
    /// Create a new mock engine
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            partitioned: Arc::new(Mutex::new(HashSet::new())),
            taps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a handler for an endpoint address, replacing any previous one
    pub fn register_handler(&self, address: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut handlers = self.handlers.lock();
        if handlers.insert(address.to_string(), tx).is_some() {
            tracing::debug!("Replaced handler for {}", address);
        }

        rx
    }

    /// Remove the handler for an address, simulating the endpoint going away
    pub fn unregister_handler(&self, address: &str) -> bool {
        self.handlers.lock().remove(address).is_some()
    }

    /// Whether a live handler is registered for an address
    pub fn has_handler(&self, address: &str) -> bool {
        self.handlers
            .lock()
            .get(address)
            .is_some_and(|h| !h.is_closed())
    }

    /// Drop (or stop dropping) all traffic addressed to `address`
    pub fn set_partitioned(&self, address: &str, partitioned: bool) {
        let mut set = self.partitioned.lock();
        if partitioned {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    /// Observe every delivery made through this engine
    pub fn tap(&self) -> mpsc::UnboundedReceiver<TappedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.taps.lock().push(tx);
        rx
    }

    /// Deliver a message without waiting for a reply
    pub fn send(&self, address: &str, message: Message) -> Result<()> {
        let handler = self.resolve(address)?;
        self.record(address, &message);

        handler
            .send(Delivery {
                message,
                reply: None,
            })
            .map_err(|_| MockEngineError::ChannelClosed)
    }

    /// Send a request and wait for reply
    pub async fn request(&self, address: &str, message: Message, timeout: Duration) -> Result<Message> {
        let reply_rx = {
            let handler = self.resolve(address)?;
            self.record(address, &message);

            let (reply_tx, reply_rx) = oneshot::channel();
            if handler
                .send(Delivery {
                    message,
                    reply: Some(reply_tx),
                })
                .is_err()
            {
                return Err(MockEngineError::ChannelClosed);
            }
            reply_rx
        };

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MockEngineError::ChannelClosed),
            Err(_) => Err(MockEngineError::Timeout),
        }
    }

    fn resolve(&self, address: &str) -> Result<EndpointHandler> {
        if self.partitioned.lock().contains(address) {
            return Err(MockEngineError::Unreachable(address.to_string()));
        }

        self.handlers
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| MockEngineError::NoHandler(address.to_string()))
    }

    fn record(&self, address: &str, message: &Message) {
        let taps = self.taps.lock();
        for tap in taps.iter() {
            let _ = tap.send(TappedMessage {
                address: address.to_string(),
                message: message.clone(),
            });
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}
