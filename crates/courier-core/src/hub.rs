//! Realtime connection hub.
//!
//! The hub owns the live connections of one process and knows which rooms
//! each has joined. The node only ever talks to it through the [`Hub`] trait,
//! so an embedding application can supply its own. [`LocalHub`] is the
//! bundled implementation: every attached connection gets an unbounded
//! outbox that its transport task drains onto the socket.

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// An event pushed to a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct HubEvent {
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Value,
}

impl HubEvent {
    /// Create a new hub event.
    #[must_use]
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Connection registry, room membership and emit primitives.
pub trait Hub: Send + Sync {
    /// Register a connection and return its outbox.
    fn attach(&self, connection_id: &str) -> mpsc::UnboundedReceiver<HubEvent>;

    /// Remove a connection and all its room memberships.
    fn detach(&self, connection_id: &str);

    /// Add a connection to a room. Returns `false` if the connection is unknown.
    fn join(&self, connection_id: &str, room: &str) -> bool;

    /// Remove a connection from a room. Returns `true` if it was a member.
    fn leave(&self, connection_id: &str, room: &str) -> bool;

    /// Emit to every connection in a room. Returns the number reached.
    fn emit_to(&self, room: &str, event: &str, payload: &Value) -> usize;

    /// Emit to every connection on this process. Returns the number reached.
    fn emit_all(&self, event: &str, payload: &Value) -> usize;

    /// Emit to a single connection. Returns `false` if it is gone.
    fn emit_to_connection(&self, connection_id: &str, event: &str, payload: &Value) -> bool;

    /// Number of attached connections.
    fn connection_count(&self) -> usize;

    /// Detach every connection and refuse new ones.
    fn close(&self);
}

/// Attached connection.
struct ConnectionEntry {
    outbox: mpsc::UnboundedSender<HubEvent>,
    rooms: DashSet<String>,
}

/// In-process hub.
#[derive(Default)]
pub struct LocalHub {
    /// Connections indexed by ID.
    connections: DashMap<String, ConnectionEntry>,
    /// Room name -> member connection IDs.
    rooms: DashMap<String, DashSet<String>>,
    closed: AtomicBool,
}

impl LocalHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members in a room.
    #[must_use]
    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn connection_rooms(&self, connection_id: &str) -> Vec<String> {
        self.connections
            .get(connection_id)
            .map(|c| c.rooms.iter().map(|r| r.clone()).collect())
            .unwrap_or_default()
    }

    fn send(&self, connection_id: &str, event: &HubEvent) -> bool {
        self.connections
            .get(connection_id)
            .map(|c| c.outbox.send(event.clone()).is_ok())
            .unwrap_or(false)
    }

    fn remove_member(&self, room: &str, connection_id: &str) -> bool {
        let removed = self
            .rooms
            .get(room)
            .map(|members| members.remove(connection_id).is_some())
            .unwrap_or(false);
        // Auto-delete empty rooms
        self.rooms.remove_if(room, |_, members| members.is_empty());
        removed
    }
}

impl Hub for LocalHub {
    fn attach(&self, connection_id: &str) -> mpsc::UnboundedReceiver<HubEvent> {
        let (outbox, receiver) = mpsc::unbounded_channel();
        if self.closed.load(Ordering::SeqCst) {
            // Dropping the sender closes the outbox right away.
            return receiver;
        }

        let previous = self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                outbox,
                rooms: DashSet::new(),
            },
        );
        if let Some(previous) = previous {
            for room in previous.rooms.iter() {
                self.remove_member(room.as_str(), connection_id);
            }
        }

        debug!(connection = %connection_id, "Connection attached");
        receiver
    }

    fn detach(&self, connection_id: &str) {
        if let Some((_, entry)) = self.connections.remove(connection_id) {
            for room in entry.rooms.iter() {
                self.remove_member(room.as_str(), connection_id);
            }
            debug!(connection = %connection_id, "Connection detached");
        }
    }

    fn join(&self, connection_id: &str, room: &str) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        entry.rooms.insert(room.to_string());
        drop(entry);

        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(connection = %connection_id, room = %room, "Joined room");
        true
    }

    fn leave(&self, connection_id: &str, room: &str) -> bool {
        if let Some(entry) = self.connections.get(connection_id) {
            entry.rooms.remove(room);
        }
        self.remove_member(room, connection_id)
    }

    fn emit_to(&self, room: &str, event: &str, payload: &Value) -> usize {
        let members: Vec<String> = match self.rooms.get(room) {
            Some(members) => members.iter().map(|m| m.clone()).collect(),
            None => return 0,
        };

        let event = HubEvent::new(event, payload.clone());
        let reached = members.iter().filter(|id| self.send(id, &event)).count();
        trace!(room = %room, recipients = reached, "Emitted to room");
        reached
    }

    fn emit_all(&self, event: &str, payload: &Value) -> usize {
        let event = HubEvent::new(event, payload.clone());
        let reached = self
            .connections
            .iter()
            .filter(|c| c.outbox.send(event.clone()).is_ok())
            .count();
        trace!(recipients = reached, "Emitted to all connections");
        reached
    }

    fn emit_to_connection(&self, connection_id: &str, event: &str, payload: &Value) -> bool {
        self.send(connection_id, &HubEvent::new(event, payload.clone()))
    }

    fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connections.clear();
        self.rooms.clear();
        debug!("Hub closed");
    }
}
