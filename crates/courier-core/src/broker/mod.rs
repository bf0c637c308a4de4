//! Broker abstraction.
//!
//! Courier needs two things from a shared broker: per-key FIFO lists and
//! channel publish/subscribe. Each is a separate role trait so a deployment
//! can hand the node one shared client, or a dedicated client per role
//! (a subscribed Redis connection cannot issue list commands, for example).
//!
//! All roles extend [`BrokerClient`], which covers authentication and
//! shutdown.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

pub use memory::{MemoryBroker, MemoryClient};
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Broker errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The client was closed.
    #[error("Broker connection closed")]
    Closed,

    /// The broker refused the credential, or one is required.
    #[error("Broker authentication failed: {0}")]
    Auth(String),

    /// The inbound message stream was already handed out.
    #[error("Inbound messages already taken")]
    MessagesTaken,

    /// Backend-specific failure.
    #[error("Broker error: {0}")]
    Backend(String),
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

impl ChannelMessage {
    /// Create a new channel message.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Connection-level operations shared by every broker role.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Short backend name for logs (e.g. "memory", "redis").
    fn name(&self) -> &'static str;

    /// Authenticate this client with a credential.
    async fn auth(&self, _credential: &str) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Close the client. Subsequent calls fail with [`BrokerError::Closed`].
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Per-key FIFO lists.
#[async_trait]
pub trait ListStore: BrokerClient {
    /// Append to the tail of a list, returning the new length.
    async fn push_back(&self, key: &str, value: String) -> Result<usize, BrokerError>;

    /// Remove and return the head of a list, or `None` if it is empty.
    async fn pop_front(&self, key: &str) -> Result<Option<String>, BrokerError>;
}

/// Channel publishing.
#[async_trait]
pub trait Publisher: BrokerClient {
    /// Publish a message, returning how many subscribers received it.
    async fn publish(&self, channel: &str, message: String) -> Result<usize, BrokerError>;
}

/// Channel subscription.
///
/// Messages for every channel this client subscribes to arrive on a single
/// stream, obtained once with [`Subscriber::take_messages`].
#[async_trait]
pub trait Subscriber: BrokerClient {
    /// Start receiving messages published on `channel`. Idempotent.
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Stop receiving messages published on `channel`. No-op if not subscribed.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Take the inbound message stream.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::MessagesTaken`] on every call after the first.
    fn take_messages(&self) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, BrokerError>;
}

/// The broker clients a node works with, one per role.
#[derive(Clone)]
pub struct BrokerClients {
    /// List commands (queue push/pop).
    pub commands: Arc<dyn ListStore>,
    /// Publishing.
    pub publisher: Arc<dyn Publisher>,
    /// Subscribing.
    pub subscriber: Arc<dyn Subscriber>,
    shared: bool,
}

impl BrokerClients {
    /// Use one client for every role.
    #[must_use]
    pub fn single<C>(client: Arc<C>) -> Self
    where
        C: ListStore + Publisher + Subscriber + 'static,
    {
        Self {
            commands: client.clone(),
            publisher: client.clone(),
            subscriber: client,
            shared: true,
        }
    }

    /// Use a dedicated client per role.
    #[must_use]
    pub fn split(
        commands: Arc<dyn ListStore>,
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
    ) -> Self {
        Self {
            commands,
            publisher,
            subscriber,
            shared: false,
        }
    }

    /// Whether all roles share one client.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Authenticate every client with the same credential.
    ///
    /// # Errors
    ///
    /// Returns the first authentication failure.
    pub async fn auth(&self, credential: &str) -> Result<(), BrokerError> {
        self.commands.auth(credential).await?;
        if !self.shared {
            self.publisher.auth(credential).await?;
            self.subscriber.auth(credential).await?;
        }
        Ok(())
    }

    /// Close every client. Failures are logged.
    pub async fn close(&self) {
        let mut results = vec![("commands", self.commands.close().await)];
        if !self.shared {
            results.push(("publisher", self.publisher.close().await));
            results.push(("subscriber", self.subscriber.close().await));
        }

        for (role, result) in results {
            if let Err(e) = result {
                warn!(role = role, error = %e, "Failed to close broker client");
            }
        }
    }
}

impl std::fmt::Debug for BrokerClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClients")
            .field("commands", &self.commands.name())
            .field("publisher", &self.publisher.name())
            .field("subscriber", &self.subscriber.name())
            .field("shared", &self.shared)
            .finish()
    }
}
