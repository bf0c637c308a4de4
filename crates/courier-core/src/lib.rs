//! # courier-core
//!
//! Identity-addressed message routing across processes.
//!
//! Every process runs a [`Node`] that owns its live connections. A connection
//! logs in as an identity; after that, any process can send to that identity
//! without knowing where it lives:
//!
//! - **Registry** - which identities are connected to this process
//! - **Router** - local fast path, or broker queue/channel otherwise
//! - **Queue** - per-identity FIFO list on the broker, drained by the owner
//! - **Presence** - per-identity broker channel carrying wake signals or
//!   direct envelopes
//! - **Hub** - the process's connections and rooms
//!
//! ## Architecture
//!
//! ```text
//!   send(X) ──▶ ┌──────────┐  local  ┌─────────┐
//!               │  Router  │────────▶│   Hub   │──▶ connection of X
//!               └──────────┘         └─────────┘
//!                    │ remote              ▲
//!                    ▼                     │ drain / direct
//!             ┌─────────────┐      ┌──────────────┐
//!             │ queue list X│◀─────│ owner of X   │
//!             │ channel X   │─────▶│ (other node) │
//!             └─────────────┘      └──────────────┘
//!                  broker
//! ```
//!
//! ## Example
//!
//! ```
//! use courier_core::{AllowAll, BrokerClients, LocalHub, LoginRequest, MemoryBroker, Node, NodeConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let broker = MemoryBroker::new();
//! let node = Node::start(
//!     NodeConfig::default(),
//!     BrokerClients::single(Arc::new(broker.client())),
//!     Arc::new(LocalHub::new()),
//!     Arc::new(AllowAll),
//! )
//! .await
//! .unwrap();
//!
//! let mut outbox = node.connect("conn-1");
//! assert!(node.login("conn-1", LoginRequest::new("t100n", "")).await.is_ok());
//!
//! node.send("t100n", "message", serde_json::json!("hi")).await;
//! assert_eq!(outbox.recv().await.unwrap().event, "message");
//! # }
//! ```

pub mod auth;
pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod envelope;
pub mod hub;
pub mod identity;
pub mod node;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod router;

pub use auth::{AllowAll, AuthError, Authenticator, Handshake, HandshakeGate, StaticCredentials, TokenGate};
pub use broker::{BrokerClients, BrokerError, ChannelMessage, MemoryBroker};
pub use config::{DeliveryMode, NodeConfig};
pub use dead_letter::{DeadLetter, DeadLetterSink};
pub use envelope::{Envelope, EnvelopeError};
pub use hub::{Hub, HubEvent, LocalHub};
pub use node::{Event, LoginRequest, LoginResponse, Node, NodeError};
pub use registry::{Connection, ConnectionRegistry};
pub use router::{MessageRouter, Route};
