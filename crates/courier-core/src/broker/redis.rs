//! Redis broker (feature `redis`).
//!
//! Each [`RedisBroker`] holds a multiplexed command connection for lists and
//! publishing plus a dedicated pub/sub connection whose messages are
//! forwarded onto the inbound stream by a background task.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink};
use redis::{AsyncCommands, IntoConnectionInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrokerClient, BrokerError, ChannelMessage, ListStore, Publisher, Subscriber};

fn backend(e: redis::RedisError) -> BrokerError {
    if e.kind() == redis::ErrorKind::AuthenticationFailed {
        BrokerError::Auth(e.to_string())
    } else {
        BrokerError::Backend(e.to_string())
    }
}

/// A connection pair to one Redis server.
pub struct RedisBroker {
    commands: MultiplexedConnection,
    sink: tokio::sync::Mutex<PubSubSink>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
    forwarder: JoinHandle<()>,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    ///
    /// Redis authenticates at connection time, so the credential is applied
    /// here; [`BrokerClient::auth`] is a no-op for this backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or either connection fails.
    pub async fn connect(url: &str, credential: Option<&str>) -> Result<Self, BrokerError> {
        let mut connection_info = url.into_connection_info().map_err(backend)?;
        if let Some(password) = credential {
            connection_info.redis.password = Some(password.to_string());
        }

        let client = redis::Client::open(connection_info).map_err(backend)?;
        let commands = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend)?;
        let (sink, mut stream) = client.get_async_pubsub().await.map_err(backend)?.split();

        let (sender, receiver) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if sender.send(ChannelMessage { channel, payload }).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Undecodable pub/sub payload"),
                }
            }
            debug!("Redis pub/sub stream ended");
        });

        info!("Connected to Redis broker");

        Ok(Self {
            commands,
            sink: tokio::sync::Mutex::new(sink),
            receiver: Mutex::new(Some(receiver)),
            forwarder,
            closed: AtomicBool::new(false),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(self.commands.clone())
    }
}

#[async_trait]
impl BrokerClient for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.forwarder.abort();
            debug!("Redis broker closed");
        }
        Ok(())
    }
}

#[async_trait]
impl ListStore for RedisBroker {
    async fn push_back(&self, key: &str, value: String) -> Result<usize, BrokerError> {
        let mut conn = self.connection()?;
        conn.rpush::<_, _, usize>(key, value).await.map_err(backend)
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.connection()?;
        conn.lpop::<_, Option<String>>(key, None).await.map_err(backend)
    }
}

#[async_trait]
impl Publisher for RedisBroker {
    async fn publish(&self, channel: &str, message: String) -> Result<usize, BrokerError> {
        let mut conn = self.connection()?;
        conn.publish::<_, _, usize>(channel, message)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl Subscriber for RedisBroker {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.connection()?;
        self.sink.lock().await.subscribe(channel).await.map_err(backend)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.connection()?;
        self.sink
            .lock()
            .await
            .unsubscribe(channel)
            .await
            .map_err(backend)
    }

    fn take_messages(&self) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, BrokerError> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BrokerError::MessagesTaken)
    }
}
