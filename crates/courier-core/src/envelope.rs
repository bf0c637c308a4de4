//! The unit of routed traffic.
//!
//! An [`Envelope`] is what crosses process boundaries: it is stored in an
//! identity's broker queue, or published straight onto the identity's
//! channel in fire-and-forget mode. The JSON field names (`room`, `event`,
//! `data`) are the broker wire format and must stay stable across versions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Envelope decoding/encoding errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The payload is not a JSON envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A routed message: target identity, event name and an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Target identity.
    #[serde(rename = "room")]
    pub target: String,
    /// Event name emitted to the target's connection.
    pub event: String,
    /// Application payload; never inspected by the router.
    #[serde(rename = "data", default)]
    pub payload: Value,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(target: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            target: target.into(),
            event: event.into(),
            payload,
        }
    }

    /// Serialize to the broker wire format.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an envelope from the broker wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] for anything that is not a JSON
    /// object with `room` and `event` fields.
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }
}
