//! # Courier Server
//!
//! Identity-addressed realtime message relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory broker, single node)
//! courier
//!
//! # Run with ./courier.toml, /etc/courier/courier.toml or
//! # ~/.config/courier/courier.toml, whichever exists first
//! courier
//!
//! # Run with environment variables
//! COURIER_PORT=8080 COURIER_HOST=0.0.0.0 courier
//! ```

mod broker;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,courier_core=debug,courier_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        mode = ?config.delivery.mode,
        backend = ?config.broker.backend,
        "Starting Courier server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
