//! In-memory mock engine standing in for the protocol wire
//!
//! This crate provides an address-routed message transport so coordinator
//! and participant nodes can exchange protocol messages inside one process.
//! Real deployments replace it with SOAP/HTTP; the coordinator only depends
//! on its request/reply and one-way delivery semantics.

use thiserror::Error;

pub mod client;
pub mod engine;
pub mod message;

pub use client::{EndpointListener, MockClient};
pub use engine::{Delivery, MockEngine, TappedMessage};
pub use message::Message;

/// Mock engine errors
#[derive(Debug, Error)]
pub enum MockEngineError {
    #[error("No handler registered for address: {0}")]
    NoHandler(String),

    #[error("Address unreachable: {0}")]
    Unreachable(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, MockEngineError>;
