//! Per-process table of logged-in identities.
//!
//! The registry answers one question for the router: does this identity's
//! connection live on this process? Entries are never shared between
//! processes; cross-process reachability is the broker's job.

use dashmap::DashMap;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// A registered, process-local connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Identity the connection logged in as.
    pub identity: String,
    /// Hub connection identifier (the transport handle).
    pub connection_id: String,
    /// Whether the authenticator accepted this connection.
    pub authenticated: bool,
    /// Profile returned by the authenticator, if any.
    pub profile: Option<Value>,
    /// Registration time in milliseconds since the epoch.
    pub registered_at: u64,
}

impl Connection {
    /// Create an authenticated connection record.
    #[must_use]
    pub fn new(identity: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            connection_id: connection_id.into(),
            authenticated: true,
            profile: None,
            registered_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    /// Attach the authenticator's profile.
    #[must_use]
    pub fn with_profile(mut self, profile: Option<Value>) -> Self {
        self.profile = profile;
        self
    }
}

/// Identity → connection map for one process.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<String, Connection>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its identity.
    ///
    /// Last writer wins: an existing entry for the same identity is replaced
    /// and returned, without touching the displaced connection.
    pub fn register(&self, connection: Connection) -> Option<Connection> {
        let identity = connection.identity.clone();
        let displaced = self.entries.insert(identity.clone(), connection);
        debug!(identity = %identity, replaced = displaced.is_some(), "Registered");
        displaced
    }

    /// Remove the entry for an identity. No-op if absent.
    pub fn unregister(&self, identity: &str) -> Option<Connection> {
        let removed = self.entries.remove(identity).map(|(_, c)| c);
        if removed.is_some() {
            debug!(identity = %identity, "Unregistered");
        }
        removed
    }

    /// Remove the entry for an identity only if it still belongs to the given
    /// connection.
    pub fn unregister_connection(&self, identity: &str, connection_id: &str) -> Option<Connection> {
        let removed = self
            .entries
            .remove_if(identity, |_, c| c.connection_id == connection_id)
            .map(|(_, c)| c);
        if removed.is_some() {
            debug!(identity = %identity, connection = %connection_id, "Unregistered");
        }
        removed
    }

    /// Whether the identity is registered on this process.
    #[must_use]
    pub fn is_local(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    /// Look up the connection registered for an identity.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<Connection> {
        self.entries.get(identity).map(|c| c.clone())
    }

    /// Number of registered identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no identity is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All registered identities.
    #[must_use]
    pub fn identities(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
