//! Broker-backed FIFO queue per identity.
//!
//! Messages for an identity that is not connected to this process are pushed
//! onto the tail of the identity's broker list. Whichever process owns the
//! identity drains the list from the head, either when woken by a signal or
//! right after the identity logs in.
//!
//! # Concurrent drains
//!
//! Within one process a drain guard keeps at most one drain per identity in
//! flight; a wake that arrives mid-drain makes the running drain take one
//! more pass instead of starting a second one. Across processes nothing
//! coordinates: two nodes may drain the same list at once, which can
//! interleave deliveries. Pops are atomic at the broker, so no entry is ever
//! delivered twice, but FIFO order only holds while a single drain runs.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::broker::{BrokerError, ListStore};
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::envelope::{Envelope, EnvelopeError};
use crate::identity::Keyspace;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The envelope could not be serialized.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// The broker rejected the write.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// The local delivery path used by a drain.
pub trait LocalDelivery: Send + Sync {
    /// Hand an envelope to its target's local connection.
    ///
    /// Returns `false` if the target has no connection on this process; the
    /// envelope is then dropped.
    fn deliver_local(&self, envelope: &Envelope) -> bool;
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries handed to a local connection.
    pub delivered: usize,
    /// Entries whose target was no longer connected here.
    pub undeliverable: usize,
    /// Entries that failed to decode and went to the dead-letter sink.
    pub malformed: usize,
}

impl DrainReport {
    /// Total entries popped.
    #[must_use]
    pub fn popped(&self) -> usize {
        self.delivered + self.undeliverable + self.malformed
    }
}

/// Per-identity FIFO queue on the broker's list store.
pub struct ReliableQueue {
    store: Arc<dyn ListStore>,
    keyspace: Keyspace,
    /// Identities with a drain in flight; the flag requests another pass.
    draining: DashMap<String, bool>,
    dead_letters: Arc<DeadLetterSink>,
}

impl ReliableQueue {
    /// Create a queue over a list store.
    #[must_use]
    pub fn new(
        store: Arc<dyn ListStore>,
        keyspace: Keyspace,
        dead_letters: Arc<DeadLetterSink>,
    ) -> Self {
        Self {
            store,
            keyspace,
            draining: DashMap::new(),
            dead_letters,
        }
    }

    /// Append an envelope to the tail of an identity's queue.
    ///
    /// Returns the queue length after the push.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized or the broker
    /// write fails.
    pub async fn enqueue(&self, identity: &str, envelope: &Envelope) -> Result<usize, QueueError> {
        let raw = envelope.to_json()?;
        let len = self
            .store
            .push_back(&self.keyspace.queue_key(identity), raw)
            .await?;
        trace!(identity = %identity, len = len, "Enqueued envelope");
        Ok(len)
    }

    /// Pop every entry of an identity's queue and hand it to `delivery`.
    ///
    /// Returns `None` without popping anything if a drain for this identity is
    /// already running on this process; that drain will make another pass.
    /// Malformed entries are dead-lettered and skipped. A broker error ends
    /// the drain early.
    pub async fn drain(&self, identity: &str, delivery: &dyn LocalDelivery) -> Option<DrainReport> {
        if !self.begin(identity) {
            trace!(identity = %identity, "Drain already in flight");
            return None;
        }

        let key = self.keyspace.queue_key(identity);
        let mut report = DrainReport::default();

        loop {
            match self.store.pop_front(&key).await {
                Ok(Some(raw)) => {
                    self.dispatch(identity, raw, delivery, &mut report);
                    tokio::task::yield_now().await;
                }
                Ok(None) => {
                    if self.finish(identity) {
                        break;
                    }
                }
                Err(e) => {
                    error!(identity = %identity, error = %e, "Drain aborted by broker error");
                    self.draining.remove(identity);
                    break;
                }
            }
        }

        if report.popped() > 0 {
            debug!(
                identity = %identity,
                delivered = report.delivered,
                undeliverable = report.undeliverable,
                malformed = report.malformed,
                "Drained queue"
            );
        }
        Some(report)
    }

    /// Whether a drain for this identity is running on this process.
    #[must_use]
    pub fn is_draining(&self, identity: &str) -> bool {
        self.draining.contains_key(identity)
    }

    fn dispatch(
        &self,
        identity: &str,
        raw: String,
        delivery: &dyn LocalDelivery,
        report: &mut DrainReport,
    ) {
        match Envelope::from_json(&raw) {
            Ok(envelope) => {
                if delivery.deliver_local(&envelope) {
                    report.delivered += 1;
                } else {
                    debug!(identity = %identity, event = %envelope.event, "Dropped envelope for absent target");
                    report.undeliverable += 1;
                }
            }
            Err(e) => {
                self.dead_letters.push(DeadLetter {
                    identity: identity.to_string(),
                    payload: raw,
                    error: e.to_string(),
                });
                report.malformed += 1;
            }
        }
    }

    /// Claim the drain guard, or flag the running drain for another pass.
    fn begin(&self, identity: &str) -> bool {
        match self.draining.entry(identity.to_string()) {
            Entry::Occupied(mut running) => {
                *running.get_mut() = true;
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(false);
                true
            }
        }
    }

    /// Release the guard unless another pass was requested meanwhile.
    fn finish(&self, identity: &str) -> bool {
        if self
            .draining
            .remove_if(identity, |_, rerun| !*rerun)
            .is_some()
        {
            return true;
        }
        if let Some(mut rerun) = self.draining.get_mut(identity) {
            *rerun = false;
        }
        false
    }
}
