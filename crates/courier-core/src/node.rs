//! A courier node: one process's view of the routed network.
//!
//! The node owns the connection registry, the router and the broker signal
//! listener, and drives each connection through its lifecycle:
//!
//! ```text
//! connect ──▶ Connected ──login──▶ Authenticating ──ok──▶ Registered
//!                 ▲                      │                    │
//!                 └──────── failed ──────┘                disconnect
//!                                                             ▼
//!                                                        (unregistered,
//!                                                         unsubscribed)
//! ```
//!
//! Applications observe the lifecycle through [`Node::subscribe_events`].

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Authenticator, Profile};
use crate::broker::{BrokerClients, BrokerError, ChannelMessage};
use crate::config::NodeConfig;
use crate::dead_letter::DeadLetterSink;
use crate::hub::{Hub, HubEvent};
use crate::identity::validate_identity;
use crate::registry::{Connection, ConnectionRegistry};
use crate::router::{MessageRouter, Route};

/// Node errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The broker could not be set up.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A transport connection was attached.
    Connected {
        /// Hub connection ID.
        connection_id: String,
    },
    /// A connection logged in and was registered.
    LoggedIn {
        /// Hub connection ID.
        connection_id: String,
        /// Identity it registered as.
        identity: String,
        /// Profile returned by the authenticator.
        profile: Option<Profile>,
    },
    /// A login attempt was refused.
    LoginFailed {
        /// Hub connection ID.
        connection_id: String,
        /// Identity the connection tried to claim.
        identity: String,
        /// Reason sent back to the client.
        reason: String,
    },
    /// A transport connection went away.
    Disconnected {
        /// Hub connection ID.
        connection_id: String,
        /// Identity it was registered as, if any.
        identity: Option<String>,
    },
}

/// Login request from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    /// Identity to register as.
    pub identity: String,
    /// Credential checked by the authenticator.
    pub credential: String,
}

impl LoginRequest {
    /// Create a new login request.
    #[must_use]
    pub fn new(identity: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            credential: credential.into(),
        }
    }
}

/// Login response sent back to the originating connection only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginResponse {
    /// Failure reason; `None` on success.
    pub error: Option<String>,
}

impl LoginResponse {
    /// Whether the login succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Connected,
    Authenticating,
    Registered(String),
}

/// One process's routing node.
pub struct Node {
    config: NodeConfig,
    brokers: BrokerClients,
    registry: Arc<ConnectionRegistry>,
    hub: Arc<dyn Hub>,
    router: Arc<MessageRouter>,
    authenticator: Arc<dyn Authenticator>,
    dead_letters: Arc<DeadLetterSink>,
    /// Connection ID -> lifecycle state.
    sessions: DashMap<String, SessionState>,
    events: broadcast::Sender<Event>,
    listener: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Node {
    /// Start a node.
    ///
    /// Authenticates the broker clients when a credential is configured (a
    /// refusal is logged, not fatal) and spawns the broker signal listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber's message stream was already taken.
    pub async fn start(
        config: NodeConfig,
        brokers: BrokerClients,
        hub: Arc<dyn Hub>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, NodeError> {
        if let Some(credential) = &config.broker_credential {
            if let Err(e) = brokers.auth(credential).await {
                warn!(error = %e, "Broker authentication failed");
            }
        }

        let messages = brokers.subscriber.take_messages()?;
        let registry = Arc::new(ConnectionRegistry::new());
        let dead_letters = Arc::new(DeadLetterSink::new(config.dead_letter_capacity));
        let router = Arc::new(MessageRouter::new(
            &config,
            &brokers,
            registry.clone(),
            hub.clone(),
            dead_letters.clone(),
        ));
        let listener = tokio::spawn(listen(router.clone(), messages));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        info!(mode = ?config.mode, brokers = ?brokers, "Node started");

        Ok(Self {
            config,
            brokers,
            registry,
            hub,
            router,
            authenticator,
            dead_letters,
            sessions: DashMap::new(),
            events,
            listener: Mutex::new(Some(listener)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Attach a new transport connection and return its outbox.
    pub fn connect(&self, connection_id: &str) -> mpsc::UnboundedReceiver<HubEvent> {
        let outbox = self.hub.attach(connection_id);
        self.sessions
            .insert(connection_id.to_string(), SessionState::Connected);
        debug!(connection = %connection_id, "Connected");
        self.notify(Event::Connected {
            connection_id: connection_id.to_string(),
        });
        outbox
    }

    /// Log a connection in.
    ///
    /// On success the connection is registered under the identity, joins the
    /// identity's room, subscribes to its broker channel and any queued
    /// messages are flushed to it. On failure the connection stays connected
    /// in the state it had before.
    pub async fn login(&self, connection_id: &str, request: LoginRequest) -> LoginResponse {
        let LoginRequest {
            identity,
            credential,
        } = request;

        if let Err(reason) = validate_identity(&identity) {
            return self.refuse(connection_id, &identity, AuthError::InvalidIdentity(reason));
        }

        let previous = match self.sessions.get_mut(connection_id) {
            None => {
                return self.refuse(
                    connection_id,
                    &identity,
                    AuthError::Rejected("Not connected".into()),
                )
            }
            Some(mut state) => {
                if *state == SessionState::Authenticating {
                    drop(state);
                    return self.refuse(
                        connection_id,
                        &identity,
                        AuthError::Rejected("Login already in progress".into()),
                    );
                }
                std::mem::replace(&mut *state, SessionState::Authenticating)
            }
        };

        let profile = match self.authenticator.authenticate(&identity, &credential).await {
            Ok(profile) => profile,
            Err(e) => {
                let restored = match self.sessions.get_mut(connection_id) {
                    Some(mut state) => {
                        if *state == SessionState::Authenticating {
                            *state = previous.clone();
                        }
                        true
                    }
                    None => false,
                };
                if !restored {
                    self.release_previous(connection_id, &previous).await;
                }
                return self.refuse(connection_id, &identity, e);
            }
        };

        // The transport may have gone away while the authenticator ran.
        let registered = match self.sessions.get_mut(connection_id) {
            Some(mut state) => {
                *state = SessionState::Registered(identity.clone());
                true
            }
            None => false,
        };
        if !registered {
            // Disconnect skipped the release while the session was
            // authenticating, so the old identity is released here.
            self.release_previous(connection_id, &previous).await;
            return self.refuse(
                connection_id,
                &identity,
                AuthError::Rejected("Disconnected".into()),
            );
        }

        if let SessionState::Registered(old) = &previous {
            if *old != identity {
                self.release(connection_id, old).await;
            }
        }
        self.register(connection_id, &identity, profile.clone()).await;

        info!(connection = %connection_id, identity = %identity, "Logged in");
        self.notify(Event::LoggedIn {
            connection_id: connection_id.to_string(),
            identity: identity.clone(),
            profile,
        });

        let router = self.router.clone();
        tokio::spawn(async move {
            router.flush(&identity).await;
        });

        LoginResponse::default()
    }

    /// Detach a transport connection.
    ///
    /// If the connection was registered and still owns its identity's entry,
    /// the entry is removed and the identity's channel unsubscribed.
    pub async fn disconnect(&self, connection_id: &str) {
        let identity = match self.sessions.remove(connection_id) {
            Some((_, SessionState::Registered(identity))) => {
                self.release(connection_id, &identity).await;
                Some(identity)
            }
            _ => None,
        };
        self.hub.detach(connection_id);

        debug!(connection = %connection_id, identity = ?identity, "Disconnected");
        self.notify(Event::Disconnected {
            connection_id: connection_id.to_string(),
            identity,
        });
    }

    /// Route a message. See [`MessageRouter::send`].
    pub async fn send(&self, target: &str, event: &str, payload: Value) -> Route {
        self.router.send(target, event, payload).await
    }

    /// Identity a connection is registered as.
    #[must_use]
    pub fn identity_of(&self, connection_id: &str) -> Option<String> {
        match self.sessions.get(connection_id).as_deref() {
            Some(SessionState::Registered(identity)) => Some(identity.clone()),
            _ => None,
        }
    }

    /// Receive lifecycle events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// The node's connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The node's hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<dyn Hub> {
        &self.hub
    }

    /// Payloads dropped because they could not be decoded.
    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterSink {
        &self.dead_letters
    }

    /// The node's configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Stop the signal listener, close the broker clients and the hub, and
    /// forget every registration. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }

        self.registry.clear();
        self.sessions.clear();
        self.hub.close();
        self.brokers.close().await;
        info!("Node shut down");
    }

    async fn register(&self, connection_id: &str, identity: &str, profile: Option<Profile>) {
        let connection = Connection::new(identity, connection_id).with_profile(profile);
        if let Some(displaced) = self.registry.register(connection) {
            if displaced.connection_id != connection_id {
                // The older connection stays open but no longer receives
                // this identity's messages.
                self.hub.leave(&displaced.connection_id, identity);
                if let Some(mut state) = self.sessions.get_mut(&displaced.connection_id) {
                    *state = SessionState::Connected;
                }
                info!(
                    identity = %identity,
                    previous = %displaced.connection_id,
                    connection = %connection_id,
                    "Identity taken over by a newer connection"
                );
            }
        }
        self.hub.join(connection_id, identity);

        if let Err(e) = self.router.presence().subscribe(identity).await {
            warn!(identity = %identity, error = %e, "Failed to subscribe identity channel");
        }
        // A disconnect may have run between registering and subscribing.
        if !self.registry.is_local(identity) {
            self.unsubscribe(identity).await;
        }
    }

    async fn release_previous(&self, connection_id: &str, previous: &SessionState) {
        if let SessionState::Registered(old) = previous {
            self.release(connection_id, old).await;
            debug!(connection = %connection_id, identity = %old, "Released identity of departed connection");
        }
    }

    async fn release(&self, connection_id: &str, identity: &str) {
        self.hub.leave(connection_id, identity);
        if self
            .registry
            .unregister_connection(identity, connection_id)
            .is_none()
        {
            return;
        }

        self.unsubscribe(identity).await;
        // Another connection may have claimed the identity meanwhile.
        if self.registry.is_local(identity) {
            if let Err(e) = self.router.presence().subscribe(identity).await {
                warn!(identity = %identity, error = %e, "Failed to subscribe identity channel");
            }
        }
    }

    async fn unsubscribe(&self, identity: &str) {
        if let Err(e) = self.router.presence().unsubscribe(identity).await {
            warn!(identity = %identity, error = %e, "Failed to unsubscribe identity channel");
        }
    }

    fn refuse(&self, connection_id: &str, identity: &str, error: AuthError) -> LoginResponse {
        let reason = error.to_string();
        debug!(connection = %connection_id, identity = %identity, reason = %reason, "Login refused");
        self.notify(Event::LoginFailed {
            connection_id: connection_id.to_string(),
            identity: identity.to_string(),
            reason: reason.clone(),
        });
        LoginResponse::failed(reason)
    }

    fn notify(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Apply inbound broker signals until the stream ends.
async fn listen(router: Arc<MessageRouter>, mut messages: mpsc::UnboundedReceiver<ChannelMessage>) {
    while let Some(message) = messages.recv().await {
        if let Some(identity) = router.handle_signal(&message) {
            let router = router.clone();
            tokio::spawn(async move {
                router.flush(&identity).await;
            });
        }
    }
    debug!("Signal listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, StaticCredentials};
    use crate::broker::MemoryBroker;
    use crate::config::DeliveryMode;
    use crate::hub::LocalHub;
    use serde_json::json;
    use std::time::Duration;

    async fn node(broker: &MemoryBroker, authenticator: Arc<dyn Authenticator>) -> Node {
        Node::start(
            NodeConfig::with_mode(DeliveryMode::Queued),
            BrokerClients::single(Arc::new(broker.client())),
            Arc::new(LocalHub::new()),
            authenticator,
        )
        .await
        .unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<HubEvent>) -> HubEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("outbox closed")
    }

    #[tokio::test]
    async fn test_login_lifecycle_events() {
        let broker = MemoryBroker::new();
        let node = node(&broker, Arc::new(AllowAll)).await;
        let mut events = node.subscribe_events();

        let _outbox = node.connect("conn-1");
        let response = node.login("conn-1", LoginRequest::new("t100n", "")).await;
        assert!(response.is_ok());
        assert!(node.registry().is_local("t100n"));
        assert_eq!(node.identity_of("conn-1").as_deref(), Some("t100n"));
        assert_eq!(broker.subscriber_count("t100n"), 1);

        node.disconnect("conn-1").await;
        assert!(!node.registry().is_local("t100n"));
        assert_eq!(broker.subscriber_count("t100n"), 0);

        assert!(matches!(events.recv().await.unwrap(), Event::Connected { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::LoggedIn { identity, .. } if identity == "t100n"
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Disconnected {
                connection_id: "conn-1".into(),
                identity: Some("t100n".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_failed_login_has_no_side_effects() {
        let broker = MemoryBroker::new();
        let credentials = StaticCredentials::default().with_user("t100n", "secret");
        let node = node(&broker, Arc::new(credentials)).await;
        let mut events = node.subscribe_events();
        let _outbox = node.connect("conn-1");

        let response = node.login("conn-1", LoginRequest::new("t100n", "wrong")).await;
        assert_eq!(response.error.as_deref(), Some("Invalid account"));
        assert!(!node.registry().is_local("t100n"));
        assert_eq!(broker.subscriber_count("t100n"), 0);
        assert_eq!(node.identity_of("conn-1"), None);

        let _ = events.recv().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), Event::LoginFailed { .. }));

        // The connection can retry.
        let response = node.login("conn-1", LoginRequest::new("t100n", "secret")).await;
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_login_is_refused() {
        let broker = MemoryBroker::new();
        let node = node(&broker, Arc::new(AllowAll)).await;
        let _outbox = node.connect("conn-1");

        let too_long = "x".repeat(300);
        for identity in ["", "bad\nname", too_long.as_str()] {
            let response = node.login("conn-1", LoginRequest::new(identity, "")).await;
            assert!(!response.is_ok(), "{identity:?} should be refused");
        }
        assert!(node.registry().is_empty());

        let response = node.login("ghost", LoginRequest::new("t100n", "")).await;
        assert_eq!(response.error.as_deref(), Some("Not connected"));
    }

    #[tokio::test]
    async fn test_queued_messages_flush_on_login() {
        let broker = MemoryBroker::new();
        let node = node(&broker, Arc::new(AllowAll)).await;

        for n in 0..3 {
            assert_eq!(node.send("t100n", "message", json!(n)).await, Route::Queued);
        }
        assert_eq!(broker.list_len("t100n"), 3);

        let mut outbox = node.connect("conn-1");
        assert!(node.login("conn-1", LoginRequest::new("t100n", "")).await.is_ok());
        for n in 0..3 {
            assert_eq!(next_event(&mut outbox).await.payload, json!(n));
        }
        assert_eq!(broker.list_len("t100n"), 0);
    }

    #[tokio::test]
    async fn test_relogin_takes_over_identity() {
        let broker = MemoryBroker::new();
        let node = node(&broker, Arc::new(AllowAll)).await;
        let mut first = node.connect("conn-1");
        let mut second = node.connect("conn-2");

        assert!(node.login("conn-1", LoginRequest::new("t100n", "")).await.is_ok());
        assert!(node.login("conn-2", LoginRequest::new("t100n", "")).await.is_ok());
        assert_eq!(
            node.registry().lookup("t100n").unwrap().connection_id,
            "conn-2"
        );
        assert_eq!(node.identity_of("conn-1"), None);

        assert_eq!(node.send("t100n", "message", json!(1)).await, Route::Local(1));
        assert_eq!(next_event(&mut second).await.payload, json!(1));
        assert!(first.try_recv().is_err());

        // The displaced connection going away leaves the new owner alone.
        node.disconnect("conn-1").await;
        assert!(node.registry().is_local("t100n"));
        assert_eq!(broker.subscriber_count("t100n"), 1);
    }

    #[tokio::test]
    async fn test_login_as_another_identity_releases_the_first() {
        let broker = MemoryBroker::new();
        let node = node(&broker, Arc::new(AllowAll)).await;
        let _outbox = node.connect("conn-1");

        assert!(node.login("conn-1", LoginRequest::new("t100n", "")).await.is_ok());
        assert!(node.login("conn-1", LoginRequest::new("ojogador", "")).await.is_ok());
        assert!(!node.registry().is_local("t100n"));
        assert!(node.registry().is_local("ojogador"));
        assert_eq!(broker.subscriber_count("t100n"), 0);
    }

    /// Takes a while for "ojogador"; rejects the credential "wrong".
    struct SlowAuthenticator;

    #[async_trait::async_trait]
    impl Authenticator for SlowAuthenticator {
        async fn authenticate(
            &self,
            identity: &str,
            credential: &str,
        ) -> Result<Option<Profile>, AuthError> {
            if identity == "ojogador" {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if credential == "wrong" {
                return Err(AuthError::InvalidCredentials);
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_disconnect_during_relogin_releases_identity() {
        for credential in ["", "wrong"] {
            let broker = MemoryBroker::new();
            let node = Arc::new(node(&broker, Arc::new(SlowAuthenticator)).await);
            let _outbox = node.connect("conn-1");
            assert!(node.login("conn-1", LoginRequest::new("t100n", "")).await.is_ok());

            let relogin = {
                let node = node.clone();
                tokio::spawn(async move {
                    node.login("conn-1", LoginRequest::new("ojogador", credential))
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            node.disconnect("conn-1").await;

            let response = relogin.await.unwrap();
            assert!(!response.is_ok());
            assert!(!node.registry().is_local("t100n"), "credential {credential:?}");
            assert!(!node.registry().is_local("ojogador"));
            assert_eq!(broker.subscriber_count("t100n"), 0);

            // Messages for the departed identity are kept for its next login.
            assert_eq!(node.send("t100n", "message", json!(1)).await, Route::Queued);
            assert_eq!(broker.list_len("t100n"), 1);
        }
    }

    #[tokio::test]
    async fn test_broker_auth_failure_is_not_fatal() {
        let broker = MemoryBroker::with_password("secret");
        let config = NodeConfig {
            broker_credential: Some("wrong".into()),
            ..NodeConfig::default()
        };
        let node = Node::start(
            config,
            BrokerClients::single(Arc::new(broker.client())),
            Arc::new(LocalHub::new()),
            Arc::new(AllowAll),
        )
        .await
        .unwrap();

        let _outbox = node.connect("conn-1");
        assert!(node.login("conn-1", LoginRequest::new("t100n", "")).await.is_ok());
        assert_eq!(node.send("t100n", "message", json!(1)).await, Route::Local(1));
        assert_eq!(node.send("ojogador", "message", json!(1)).await, Route::Dropped);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let broker = MemoryBroker::new();
        let node = node(&broker, Arc::new(AllowAll)).await;
        let _outbox = node.connect("conn-1");
        node.login("conn-1", LoginRequest::new("t100n", "")).await;

        node.shutdown().await;
        node.shutdown().await;
        assert!(node.registry().is_empty());
        assert_eq!(node.hub().connection_count(), 0);
        assert_eq!(broker.subscriber_count("t100n"), 0);
    }
}
