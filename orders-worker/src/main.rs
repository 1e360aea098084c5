//! Orders Consumer - hosted service printing every message of the orders queue.
//!
//! Message lines go to stdout; structured logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orders::{run_until, shutdown_signal, Config, HookTimeouts, OrdersConsumer, PrintHandler};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_writer(std::io::stderr),
        )
        .init();

    tracing::info!("consumer_service_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        amqp_url_set = std::env::var("AMQP_URL").is_ok(),
        queue = %config.queue_name,
        ack_mode = %config.ack_mode,
        concurrency = config.consumer_concurrency,
        "config_loaded"
    );

    let consumer = OrdersConsumer::new(&config, Arc::new(PrintHandler::stdout()));

    run_until(&consumer, shutdown_signal(), HookTimeouts::from(&config))
        .await
        .context("Consumer service failed")?;

    tracing::info!("consumer_service_shutdown_complete");
    Ok(())
}
