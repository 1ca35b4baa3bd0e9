//! Two-phase-commit coordinator for transactions that span remote services
//!
//! A business transaction started on one node travels with its outbound
//! calls. Remote nodes import it, register back as participants, and are
//! driven to a common outcome when the originating node completes it.
//!
//! Services, leaf first:
//! - `EndpointDirectory`: this node's published protocol addresses
//! - `TransactionRegistry`: live transactions by global id
//! - `RegistrationService`: activation and participant registration
//! - `Coordinator`: participant responses and the 2PC driver
//! - `ParticipantService`: prepare/commit/rollback on a remote node
//! - `TransactionHandler`: attaches transactions to application calls
//! - `ProtocolClient`: outbound protocol verbs
//! - `RecoveryService`: reroute and post-restart re-activation
//!
//! `WsatNode` wires one instance of each.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod handler;
pub mod mock;
pub mod node;
pub mod participant;
pub mod recovery;
pub mod registration;
pub mod registry;
pub mod rpc;
pub mod state;
pub mod transaction;

pub use bridge::{BridgeResult, TransactionManager};
pub use config::WsatConfig;
pub use coordinator::{Coordinator, RemoteParticipant};
pub use directory::{BaseAddresses, EndpointDirectory};
pub use error::{BridgeError, Result, WsatError};
pub use handler::{CallContext, TransactionHandler};
pub use mock::{BridgeCall, MockTransactionManager};
pub use node::WsatNode;
pub use participant::ParticipantService;
pub use recovery::{LoggedParticipant, RecoveryService};
pub use registration::RegistrationService;
pub use registry::TransactionRegistry;
pub use rpc::{ProtocolClient, Transport};
pub use state::{Participant, ParticipantState};
pub use transaction::{CoordinatorRecord, GlobalTransaction, Outcome, ParticipantSideRecord, Role};
