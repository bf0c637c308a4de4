//! Broker clients from configuration.

use anyhow::Result;
use courier_core::{BrokerClients, MemoryBroker};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{BrokerBackend, BrokerConfig, BrokerTopology};

/// Open the broker clients described by `config`.
///
/// # Errors
///
/// Returns an error if a broker connection cannot be established, or the
/// configured backend was not compiled in.
pub async fn connect(config: &BrokerConfig) -> Result<BrokerClients> {
    match config.backend {
        BrokerBackend::Memory => Ok(memory(config)),
        BrokerBackend::Redis => redis(config).await,
    }
}

fn memory(config: &BrokerConfig) -> BrokerClients {
    warn!("Using the in-memory broker; identities on other nodes are unreachable");

    let broker = match &config.credential {
        Some(password) => MemoryBroker::with_password(password.clone()),
        None => MemoryBroker::new(),
    };
    match config.topology {
        BrokerTopology::Single => BrokerClients::single(Arc::new(broker.client())),
        BrokerTopology::Split => BrokerClients::split(
            Arc::new(broker.client()),
            Arc::new(broker.client()),
            Arc::new(broker.client()),
        ),
    }
}

#[cfg(feature = "redis")]
async fn redis(config: &BrokerConfig) -> Result<BrokerClients> {
    use courier_core::broker::RedisBroker;

    let credential = config.credential.as_deref();
    let clients = match config.topology {
        BrokerTopology::Single => {
            BrokerClients::single(Arc::new(RedisBroker::connect(&config.url, credential).await?))
        }
        BrokerTopology::Split => {
            let publish_url = config.publish_url.as_deref().unwrap_or(&config.url);
            let subscribe_url = config.subscribe_url.as_deref().unwrap_or(&config.url);
            BrokerClients::split(
                Arc::new(RedisBroker::connect(&config.url, credential).await?),
                Arc::new(RedisBroker::connect(publish_url, credential).await?),
                Arc::new(RedisBroker::connect(subscribe_url, credential).await?),
            )
        }
    };

    info!(topology = ?config.topology, "Redis broker ready");
    Ok(clients)
}

#[cfg(not(feature = "redis"))]
async fn redis(_config: &BrokerConfig) -> Result<BrokerClients> {
    anyhow::bail!("Redis broker requested but the `redis` feature is disabled")
}
