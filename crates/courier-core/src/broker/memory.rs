//! In-memory broker.
//!
//! A [`MemoryBroker`] plays the role of the shared broker server; each
//! [`MemoryClient`] behaves like an independent connection to it, so several
//! nodes in one process can exercise the same cross-process protocol they
//! would run against Redis. Lists follow Redis semantics (an emptied list
//! disappears) and publishing is fire-and-forget to current subscribers.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{BrokerClient, BrokerError, ChannelMessage, ListStore, Publisher, Subscriber};

/// Subscriber handle registered on a channel.
struct Subscription {
    client: u64,
    sender: mpsc::UnboundedSender<ChannelMessage>,
}

#[derive(Default)]
struct Shared {
    lists: DashMap<String, VecDeque<String>>,
    channels: DashMap<String, Vec<Subscription>>,
    password: Option<String>,
    next_client: AtomicU64,
}

/// A broker server living in process memory.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Create a broker that accepts every client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker that requires clients to authenticate with `password`.
    #[must_use]
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                password: Some(password.into()),
                ..Shared::default()
            }),
        }
    }

    /// Open a new client connection.
    #[must_use]
    pub fn client(&self) -> MemoryClient {
        let id = self.shared.next_client.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        debug!(client = id, "Memory broker client connected");

        MemoryClient {
            id,
            shared: Arc::clone(&self.shared),
            sender,
            receiver: Mutex::new(Some(receiver)),
            authenticated: AtomicBool::new(self.shared.password.is_none()),
            closed: AtomicBool::new(false),
        }
    }

    /// Current length of a list.
    #[must_use]
    pub fn list_len(&self, key: &str) -> usize {
        self.shared.lists.get(key).map(|l| l.len()).unwrap_or(0)
    }

    /// Number of clients subscribed to a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .channels
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Append a raw entry to a list, bypassing any client.
    pub fn inject(&self, key: &str, value: impl Into<String>) {
        self.shared
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.into());
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryClient {
    id: u64,
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<ChannelMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
    authenticated: AtomicBool,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ready(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if !self.authenticated.load(Ordering::SeqCst) {
            return Err(BrokerError::Auth("NOAUTH Authentication required".into()));
        }
        Ok(())
    }

    fn drop_subscriptions(&self) {
        self.shared
            .channels
            .iter_mut()
            .for_each(|mut subs| subs.retain(|s| s.client != self.id));
        self.shared.channels.retain(|_, subs| !subs.is_empty());
    }
}

#[async_trait]
impl BrokerClient for MemoryClient {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn auth(&self, credential: &str) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        match self.shared.password.as_deref() {
            None => Ok(()),
            Some(expected) if expected == credential => {
                self.authenticated.store(true, Ordering::SeqCst);
                Ok(())
            }
            Some(_) => Err(BrokerError::Auth("WRONGPASS invalid password".into())),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.drop_subscriptions();
            debug!(client = self.id, "Memory broker client closed");
        }
        Ok(())
    }
}

#[async_trait]
impl ListStore for MemoryClient {
    async fn push_back(&self, key: &str, value: String) -> Result<usize, BrokerError> {
        self.ready()?;
        let mut list = self.shared.lists.entry(key.to_string()).or_default();
        list.push_back(value);
        Ok(list.len())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, BrokerError> {
        self.ready()?;
        let (value, emptied) = match self.shared.lists.get_mut(key) {
            Some(mut list) => {
                let value = list.pop_front();
                (value, list.is_empty())
            }
            None => return Ok(None),
        };
        if emptied {
            self.shared.lists.remove_if(key, |_, list| list.is_empty());
        }
        Ok(value)
    }
}

#[async_trait]
impl Publisher for MemoryClient {
    async fn publish(&self, channel: &str, message: String) -> Result<usize, BrokerError> {
        self.ready()?;
        let Some(mut subs) = self.shared.channels.get_mut(channel) else {
            trace!(channel = %channel, "Publish without subscribers");
            return Ok(0);
        };

        let delivered = ChannelMessage::new(channel, message);
        subs.retain(|s| s.sender.send(delivered.clone()).is_ok());
        Ok(subs.len())
    }
}

#[async_trait]
impl Subscriber for MemoryClient {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.ready()?;
        let mut subs = self.shared.channels.entry(channel.to_string()).or_default();
        if !subs.iter().any(|s| s.client == self.id) {
            subs.push(Subscription {
                client: self.id,
                sender: self.sender.clone(),
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.ready()?;
        if let Some(mut subs) = self.shared.channels.get_mut(channel) {
            subs.retain(|s| s.client != self.id);
        }
        self.shared.channels.remove_if(channel, |_, subs| subs.is_empty());
        Ok(())
    }

    fn take_messages(&self) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, BrokerError> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BrokerError::MessagesTaken)
    }
}

impl MemoryClient {
    /// Channels this client is subscribed to.
    #[must_use]
    pub fn subscriptions(&self) -> HashSet<String> {
        self.shared
            .channels
            .iter()
            .filter(|e| e.value().iter().any(|s| s.client == self.id))
            .map(|e| e.key().clone())
            .collect()
    }
}
