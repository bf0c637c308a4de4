//! Message routing.
//!
//! The router decides, per send, whether a message can be handed straight to
//! a local connection or has to travel through the broker. Local delivery
//! never touches the broker; everything else goes through the identity's
//! queue and channel according to the [`DeliveryMode`].

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::broker::{BrokerClients, ChannelMessage};
use crate::config::{DeliveryMode, NodeConfig};
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::envelope::Envelope;
use crate::hub::Hub;
use crate::identity::Keyspace;
use crate::presence::{PresenceChannel, Signal, SignalError};
use crate::queue::{DrainReport, LocalDelivery, ReliableQueue};
use crate::registry::ConnectionRegistry;

/// The path a sent message took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Empty target: emitted to every connection on this process.
    Broadcast(usize),
    /// Target connected here: emitted to its room.
    Local(usize),
    /// Pushed onto the target's broker queue and a wake signal published.
    Queued,
    /// Published directly on the target's channel to this many processes.
    Published(usize),
    /// The broker failed; the message is gone.
    Dropped,
}

impl Route {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast(_) => "broadcast",
            Self::Local(_) => "local",
            Self::Queued => "queued",
            Self::Published(_) => "published",
            Self::Dropped => "dropped",
        }
    }
}

/// Routes messages between local connections and the broker.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    hub: Arc<dyn Hub>,
    queue: ReliableQueue,
    presence: PresenceChannel,
    mode: DeliveryMode,
    dead_letters: Arc<DeadLetterSink>,
}

impl MessageRouter {
    /// Create a router over the given registry, hub and broker clients.
    #[must_use]
    pub fn new(
        config: &NodeConfig,
        brokers: &BrokerClients,
        registry: Arc<ConnectionRegistry>,
        hub: Arc<dyn Hub>,
        dead_letters: Arc<DeadLetterSink>,
    ) -> Self {
        let keyspace = Keyspace::new(config.key_prefix.clone());
        Self {
            registry,
            hub,
            queue: ReliableQueue::new(
                brokers.commands.clone(),
                keyspace.clone(),
                dead_letters.clone(),
            ),
            presence: PresenceChannel::new(
                brokers.publisher.clone(),
                brokers.subscriber.clone(),
                keyspace,
                config.mode,
            ),
            mode: config.mode,
            dead_letters,
        }
    }

    /// Delivery mode for non-local targets.
    #[must_use]
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Identity channel subscriptions.
    #[must_use]
    pub fn presence(&self) -> &PresenceChannel {
        &self.presence
    }

    /// Route a message to `target`.
    ///
    /// Broker failures are logged and reported as [`Route::Dropped`]; they
    /// never surface as errors.
    pub async fn send(&self, target: &str, event: &str, payload: Value) -> Route {
        if target.is_empty() {
            let reached = self.hub.emit_all(event, &payload);
            trace!(event = %event, recipients = reached, "Broadcast locally");
            return Route::Broadcast(reached);
        }

        if self.registry.is_local(target) {
            let reached = self.hub.emit_to(target, event, &payload);
            trace!(identity = %target, event = %event, "Delivered locally");
            return Route::Local(reached);
        }

        let envelope = Envelope::new(target, event, payload);
        match self.mode {
            DeliveryMode::Queued => self.send_queued(target, &envelope).await,
            DeliveryMode::FireAndForget => self.send_direct(target, envelope).await,
        }
    }

    async fn send_queued(&self, target: &str, envelope: &Envelope) -> Route {
        if let Err(e) = self.queue.enqueue(target, envelope).await {
            warn!(identity = %target, error = %e, "Failed to enqueue message");
            return Route::Dropped;
        }

        // The message is durable from here; a lost wake only delays it until
        // the next login or wake for this identity.
        match self
            .presence
            .publish(target, &Signal::Wake(target.to_string()))
            .await
        {
            Ok(receivers) => {
                trace!(identity = %target, receivers = receivers, "Published wake signal");
            }
            Err(e) => warn!(identity = %target, error = %e, "Failed to publish wake signal"),
        }
        Route::Queued
    }

    async fn send_direct(&self, target: &str, envelope: Envelope) -> Route {
        match self.presence.publish(target, &Signal::Direct(envelope)).await {
            Ok(receivers) => {
                if receivers == 0 {
                    debug!(identity = %target, "No owner for direct message");
                }
                Route::Published(receivers)
            }
            Err(e) => {
                warn!(identity = %target, error = %e, "Failed to publish direct message");
                Route::Dropped
            }
        }
    }

    /// Drain an identity's queue onto its local connection.
    ///
    /// Returns `None` in fire-and-forget mode, when the identity is not
    /// registered here, or when a drain for the identity is already running
    /// here. The queue is left untouched in all three cases.
    pub async fn flush(&self, identity: &str) -> Option<DrainReport> {
        if !self.registry.is_local(identity) {
            debug!(identity = %identity, "Skipping flush for identity not registered here");
            return None;
        }
        match self.mode {
            DeliveryMode::Queued => self.queue.drain(identity, self).await,
            DeliveryMode::FireAndForget => None,
        }
    }

    /// Handle a message from the broker.
    ///
    /// Direct envelopes are delivered inline. For a wake signal the identity
    /// whose queue should be drained is returned.
    pub fn handle_signal(&self, message: &ChannelMessage) -> Option<String> {
        match self.presence.decode(message) {
            Ok(Signal::Wake(identity)) => Some(identity),
            Ok(Signal::Direct(envelope)) => {
                if !self.deliver_local(&envelope) {
                    debug!(identity = %envelope.target, "Direct message for absent target");
                }
                None
            }
            Err(SignalError::UnknownChannel(channel)) => {
                warn!(channel = %channel, "Signal on unknown channel");
                None
            }
            Err(SignalError::Envelope(e)) => {
                let identity = self
                    .presence
                    .identity_of(&message.channel)
                    .unwrap_or_default();
                self.dead_letters.push(DeadLetter {
                    identity: identity.to_string(),
                    payload: message.payload.clone(),
                    error: e.to_string(),
                });
                None
            }
        }
    }
}

impl LocalDelivery for MessageRouter {
    fn deliver_local(&self, envelope: &Envelope) -> bool {
        if !self.registry.is_local(&envelope.target) {
            return false;
        }
        self.hub
            .emit_to(&envelope.target, &envelope.event, &envelope.payload)
            > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerClient, MemoryBroker, MemoryClient, Subscriber};
    use crate::hub::{HubEvent, LocalHub};
    use crate::registry::Connection;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        router: MessageRouter,
        hub: Arc<LocalHub>,
        registry: Arc<ConnectionRegistry>,
        client: Arc<MemoryClient>,
        dead_letters: Arc<DeadLetterSink>,
    }

    fn fixture(broker: &MemoryBroker, mode: DeliveryMode) -> Fixture {
        let client = Arc::new(broker.client());
        let hub = Arc::new(LocalHub::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let dead_letters = Arc::new(DeadLetterSink::new(8));
        let router = MessageRouter::new(
            &NodeConfig::with_mode(mode),
            &BrokerClients::single(client.clone()),
            registry.clone(),
            hub.clone(),
            dead_letters.clone(),
        );
        Fixture {
            router,
            hub,
            registry,
            client,
            dead_letters,
        }
    }

    fn connect(f: &Fixture, identity: &str, conn_id: &str) -> mpsc::UnboundedReceiver<HubEvent> {
        let rx = f.hub.attach(conn_id);
        f.hub.join(conn_id, identity);
        f.registry.register(Connection::new(identity, conn_id));
        rx
    }

    #[tokio::test]
    async fn test_local_fast_path() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::Queued);
        let mut rx = connect(&f, "t100n", "conn-1");

        let route = f.router.send("t100n", "message", json!("hi")).await;
        assert_eq!(route, Route::Local(1));
        assert_eq!(rx.try_recv().unwrap(), HubEvent::new("message", json!("hi")));
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.list_len("t100n"), 0);
    }

    #[tokio::test]
    async fn test_empty_target_broadcasts_locally() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::Queued);
        let mut rx1 = connect(&f, "t100n", "conn-1");
        let mut rx2 = f.hub.attach("conn-2");

        assert_eq!(f.router.send("", "notice", json!(null)).await, Route::Broadcast(2));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_offline_target_is_queued() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::Queued);

        let route = f.router.send("ojogador", "message", json!({ "n": 1 })).await;
        assert_eq!(route, Route::Queued);
        assert_eq!(broker.list_len("ojogador"), 1);

        // Nothing is registered here, so the entry waits for the owner.
        assert!(f.router.flush("ojogador").await.is_none());
        assert_eq!(broker.list_len("ojogador"), 1);
    }

    #[tokio::test]
    async fn test_wake_after_release_keeps_queue() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::Queued);
        let _rx = connect(&f, "t100n", "conn-1");
        assert!(f.registry.unregister_connection("t100n", "conn-1").is_some());

        f.router.send("t100n", "message", json!(1)).await;
        let message = ChannelMessage::new("t100n", "t100n");
        let identity = f.router.handle_signal(&message).unwrap();
        assert!(f.router.flush(&identity).await.is_none());
        assert_eq!(broker.list_len("t100n"), 1);
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::Queued);
        for n in 0..3 {
            f.router.send("t100n", "message", json!(n)).await;
        }

        let mut rx = connect(&f, "t100n", "conn-1");
        let report = f.router.flush("t100n").await.unwrap();
        assert_eq!(report.delivered, 3);
        for n in 0..3 {
            assert_eq!(rx.try_recv().unwrap().payload, json!(n));
        }
    }

    #[tokio::test]
    async fn test_fire_and_forget_without_owner() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::FireAndForget);

        let route = f.router.send("ojogador", "message", json!(1)).await;
        assert_eq!(route, Route::Published(0));
        assert_eq!(broker.list_len("ojogador"), 0);
        assert!(f.router.flush("ojogador").await.is_none());
    }

    #[tokio::test]
    async fn test_broker_failure_drops() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::Queued);
        let mut rx = connect(&f, "t100n", "conn-1");
        f.client.close().await.unwrap();

        assert_eq!(f.router.send("ojogador", "message", json!(1)).await, Route::Dropped);
        // The local path does not need the broker.
        assert_eq!(f.router.send("t100n", "message", json!(2)).await, Route::Local(1));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_handle_wake_signal() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::Queued);

        let message = ChannelMessage::new("t100n", "t100n");
        assert_eq!(f.router.handle_signal(&message), Some("t100n".to_string()));
    }

    #[tokio::test]
    async fn test_handle_direct_signal() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::FireAndForget);
        let mut rx = connect(&f, "t100n", "conn-1");

        let raw = Envelope::new("t100n", "message", json!("hi")).to_json().unwrap();
        assert_eq!(f.router.handle_signal(&ChannelMessage::new("t100n", raw)), None);
        assert_eq!(rx.try_recv().unwrap().payload, json!("hi"));

        assert_eq!(f.router.handle_signal(&ChannelMessage::new("t100n", "garbage")), None);
        let letters = f.dead_letters.drain_all();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].identity, "t100n");
        assert_eq!(letters[0].payload, "garbage");
    }

    #[tokio::test]
    async fn test_deliver_local_requires_registration() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, DeliveryMode::Queued);
        let _rx = f.hub.attach("conn-1");
        f.hub.join("conn-1", "t100n");

        let envelope = Envelope::new("t100n", "message", json!(1));
        assert!(!f.router.deliver_local(&envelope));

        f.registry.register(Connection::new("t100n", "conn-1"));
        assert!(f.router.deliver_local(&envelope));
    }

    #[tokio::test]
    async fn test_cross_router_wake() {
        let broker = MemoryBroker::new();
        let owner = fixture(&broker, DeliveryMode::Queued);
        let sender = fixture(&broker, DeliveryMode::Queued);
        let mut inbound = owner.client.take_messages().unwrap();
        owner.router.presence().subscribe("t100n").await.unwrap();

        assert_eq!(sender.router.send("t100n", "message", json!(1)).await, Route::Queued);

        let message = inbound.recv().await.unwrap();
        assert_eq!(owner.router.handle_signal(&message), Some("t100n".to_string()));
        assert_eq!(broker.list_len("t100n"), 1);
    }
}
