//! Authentication and connection authorization hooks.
//!
//! Two seams gate a connection:
//!
//! - [`HandshakeGate`] runs before the transport upgrade and can refuse the
//!   connection outright.
//! - [`Authenticator`] runs on every login and decides whether the connection
//!   may claim an identity.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Profile data an authenticator may attach to a successful login.
pub type Profile = Value;

/// Authentication errors. The message is sent back to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The identity is not acceptable as a routing key.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(&'static str),

    /// Unknown identity or wrong credential.
    #[error("Invalid account")]
    InvalidCredentials,

    /// Handshake refused.
    #[error("Unauthorized")]
    Unauthorized,

    /// Custom rejection reason.
    #[error("{0}")]
    Rejected(String),
}

/// Credential check run on every login.
///
/// Implementations may do arbitrary asynchronous work. Returning `Ok` lets the
/// connection register under `identity`, optionally with a profile.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify a credential for an identity.
    async fn authenticate(
        &self,
        identity: &str,
        credential: &str,
    ) -> Result<Option<Profile>, AuthError>;
}

/// What the transport knows about a connection before it is accepted.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Peer address, if known.
    pub remote_addr: Option<String>,
    /// Token presented by the client (query string or bearer header).
    pub token: Option<String>,
}

/// Connection-level authorization run before a transport is accepted.
#[async_trait]
pub trait HandshakeGate: Send + Sync {
    /// Decide whether the connection may proceed.
    async fn authorize(&self, handshake: &Handshake) -> Result<(), AuthError>;
}

/// Accepts every login and every handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(
        &self,
        _identity: &str,
        _credential: &str,
    ) -> Result<Option<Profile>, AuthError> {
        Ok(None)
    }
}

#[async_trait]
impl HandshakeGate for AllowAll {
    async fn authorize(&self, _handshake: &Handshake) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Checks logins against a fixed identity → credential table.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    /// Create from an identity → credential map.
    #[must_use]
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Add a user.
    #[must_use]
    pub fn with_user(mut self, identity: impl Into<String>, credential: impl Into<String>) -> Self {
        self.users.insert(identity.into(), credential.into());
        self
    }
}

#[async_trait]
impl Authenticator for StaticCredentials {
    async fn authenticate(
        &self,
        identity: &str,
        credential: &str,
    ) -> Result<Option<Profile>, AuthError> {
        match self.users.get(identity) {
            Some(expected) if expected == credential => Ok(Some(json!({ "identity": identity }))),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}

/// Requires every handshake to present a shared token.
#[derive(Debug, Clone)]
pub struct TokenGate {
    token: String,
}

impl TokenGate {
    /// Create a gate expecting `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl HandshakeGate for TokenGate {
    async fn authorize(&self, handshake: &Handshake) -> Result<(), AuthError> {
        match handshake.token.as_deref() {
            Some(token) if token == self.token => Ok(()),
            _ => Err(AuthError::Unauthorized),
        }
    }
}
