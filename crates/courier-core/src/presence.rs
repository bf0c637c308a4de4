//! Identity channels on the broker.
//!
//! Every logged-in identity is subscribed on the broker by the process that
//! owns its connection. Senders elsewhere never need to know which process
//! that is: they publish on the identity's channel and whoever is subscribed
//! reacts.
//!
//! What travels on the channel depends on the [`DeliveryMode`]:
//!
//! - `Queued`: a wake signal whose payload is just the identity ("check your
//!   queue").
//! - `FireAndForget`: the full serialized [`Envelope`].

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::broker::{BrokerError, ChannelMessage, Publisher, Subscriber};
use crate::config::DeliveryMode;
use crate::envelope::{Envelope, EnvelopeError};
use crate::identity::Keyspace;

/// A decoded channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Drain the identity's queue.
    Wake(String),
    /// Deliver this envelope directly.
    Direct(Envelope),
}

/// Inbound signal errors.
#[derive(Debug, Error)]
pub enum SignalError {
    /// The channel does not belong to this node's keyspace.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// The channel carried something that is not an envelope.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Subscribe/unsubscribe/publish over the broker, keyed by identity.
pub struct PresenceChannel {
    publisher: Arc<dyn Publisher>,
    subscriber: Arc<dyn Subscriber>,
    keyspace: Keyspace,
    mode: DeliveryMode,
}

impl PresenceChannel {
    /// Create a presence channel over the given broker roles.
    #[must_use]
    pub fn new(
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
        keyspace: Keyspace,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            publisher,
            subscriber,
            keyspace,
            mode,
        }
    }

    /// Start receiving signals for an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the subscription.
    pub async fn subscribe(&self, identity: &str) -> Result<(), BrokerError> {
        self.subscriber
            .subscribe(&self.keyspace.channel(identity))
            .await?;
        debug!(identity = %identity, "Subscribed to identity channel");
        Ok(())
    }

    /// Stop receiving signals for an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker call fails.
    pub async fn unsubscribe(&self, identity: &str) -> Result<(), BrokerError> {
        self.subscriber
            .unsubscribe(&self.keyspace.channel(identity))
            .await?;
        debug!(identity = %identity, "Unsubscribed from identity channel");
        Ok(())
    }

    /// Publish a signal on an identity's channel.
    ///
    /// Returns the number of subscribed processes that received it.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be encoded or the broker call fails.
    pub async fn publish(&self, identity: &str, signal: &Signal) -> Result<usize, BrokerError> {
        let payload = match signal {
            Signal::Wake(name) => name.clone(),
            Signal::Direct(envelope) => envelope
                .to_json()
                .map_err(|e| BrokerError::Backend(e.to_string()))?,
        };

        let receivers = self
            .publisher
            .publish(&self.keyspace.channel(identity), payload)
            .await?;
        trace!(identity = %identity, receivers = receivers, "Published signal");
        Ok(receivers)
    }

    /// Decode an inbound channel message according to the delivery mode.
    ///
    /// # Errors
    ///
    /// Returns an error for channels outside the keyspace, and in
    /// fire-and-forget mode for payloads that are not envelopes.
    pub fn decode(&self, message: &ChannelMessage) -> Result<Signal, SignalError> {
        let identity = self
            .keyspace
            .identity_of(&message.channel)
            .ok_or_else(|| SignalError::UnknownChannel(message.channel.clone()))?;

        match self.mode {
            DeliveryMode::Queued => Ok(Signal::Wake(identity.to_string())),
            DeliveryMode::FireAndForget => {
                Ok(Signal::Direct(Envelope::from_json(&message.payload)?))
            }
        }
    }

    /// Identity owning a channel name, if any.
    #[must_use]
    pub fn identity_of<'a>(&self, channel: &'a str) -> Option<&'a str> {
        self.keyspace.identity_of(channel)
    }
}
