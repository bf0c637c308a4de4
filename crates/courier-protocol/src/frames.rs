//! Frame types for the Courier protocol.
//!
//! Frames are serialized with MessagePack. Event payloads are arbitrary JSON
//! values; the node never inspects them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version, announced in the `Connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by `Error` frames.
pub mod codes {
    /// The frame could not be decoded.
    pub const INVALID_FRAME: u16 = 1001;
    /// The frame exceeds the configured size limit.
    pub const FRAME_TOO_LARGE: u16 = 1002;
    /// The operation requires a logged-in connection.
    pub const NOT_AUTHENTICATED: u16 = 1003;
    /// The frame type is not accepted from clients.
    pub const UNEXPECTED_FRAME: u16 = 1004;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Login,
    LoginResult,
    Send,
    Event,
    Ack,
    Error,
    Ping,
    Pong,
    Connected,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Claim an identity.
    #[serde(rename = "login")]
    Login {
        /// Request ID echoed in the `LoginResult`.
        id: u64,
        /// Identity to register under (e.g. a username).
        identity: String,
        /// Opaque credential handed to the authenticator.
        credential: String,
    },

    /// Outcome of a login.
    #[serde(rename = "login_result")]
    LoginResult {
        /// ID of the login request.
        id: u64,
        /// Failure reason; absent on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Route an event to an identity.
    #[serde(rename = "send")]
    Send {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Target identity. Absent or empty means every connection on the node.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        /// Event name.
        event: String,
        /// Event payload.
        #[serde(default)]
        payload: Value,
    },

    /// An event delivered to this connection.
    #[serde(rename = "event")]
    Event {
        /// Event name.
        event: String,
        /// Event payload.
        #[serde(default)]
        payload: Value,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Sent by the node once the socket is accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Node-assigned connection identifier.
        connection_id: String,
        /// Protocol version spoken by the node.
        version: u8,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Login { .. } => FrameType::Login,
            Frame::LoginResult { .. } => FrameType::LoginResult,
            Frame::Send { .. } => FrameType::Send,
            Frame::Event { .. } => FrameType::Event,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// Create a new Login frame.
    #[must_use]
    pub fn login(id: u64, identity: impl Into<String>, credential: impl Into<String>) -> Self {
        Frame::Login {
            id,
            identity: identity.into(),
            credential: credential.into(),
        }
    }

    /// Create a successful LoginResult frame.
    #[must_use]
    pub fn login_ok(id: u64) -> Self {
        Frame::LoginResult { id, error: None }
    }

    /// Create a failed LoginResult frame.
    #[must_use]
    pub fn login_failed(id: u64, reason: impl Into<String>) -> Self {
        Frame::LoginResult {
            id,
            error: Some(reason.into()),
        }
    }

    /// Create a Send frame aimed at a single identity.
    #[must_use]
    pub fn send(target: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Frame::Send {
            id: None,
            target: Some(target.into()),
            event: event.into(),
            payload,
        }
    }

    /// Create an Event frame.
    #[must_use]
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Frame::Event {
            event: event.into(),
            payload,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
        }
    }
}
