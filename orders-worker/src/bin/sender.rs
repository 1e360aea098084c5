//! Orders Sender - publishes messages to the orders queue.
//!
//! Each message is sent over its own connection. Sending stops at the first
//! failure; nothing is retried.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orders::{Config, OrdersPublisher};

#[derive(Parser, Debug)]
#[command(
    name = "orders-sender",
    version,
    about = "Publish messages to the orders queue"
)]
struct Cli {
    /// Messages to send, in order
    #[arg(required = true)]
    messages: Vec<String>,

    /// Send every message this many times
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Broker URL (overrides AMQP_URL)
    #[arg(long)]
    url: Option<String>,

    /// Queue name (overrides ORDERS_QUEUE)
    #[arg(long)]
    queue: Option<String>,
}

/// Number of sends the invocation asks for.
fn total_sends(messages: usize, count: usize) -> Result<usize> {
    if count == 0 {
        bail!("--count must be at least 1");
    }
    match messages.checked_mul(count) {
        Some(total) => Ok(total),
        None => bail!("--count {count} is too large for {messages} messages"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(url) = cli.url {
        config.amqp_url = url;
    }
    if let Some(queue) = cli.queue {
        config.queue_name = queue;
    }

    let total = total_sends(cli.messages.len(), cli.count)?;
    let publisher = OrdersPublisher::from_config(&config);
    let mut sent = 0;

    for message in &cli.messages {
        for _ in 0..cli.count {
            publisher
                .send(message)
                .await
                .with_context(|| format!("Failed to send message {} of {}", sent + 1, total))?;
            sent += 1;
        }
    }

    info!(queue = %config.queue_name, sent = sent, "sender_complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_sends() {
        assert_eq!(total_sends(3, 1).unwrap(), 3);
        assert_eq!(total_sends(2, 5).unwrap(), 10);
    }

    #[test]
    fn test_zero_count_is_rejected() {
        assert!(total_sends(1, 0).is_err());
    }

    #[test]
    fn test_overflowing_count_is_rejected() {
        let err = total_sends(2, usize::MAX).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_cli_parses_count() {
        let cli = Cli::try_parse_from(["orders-sender", "--count", "3", "a", "b"]).unwrap();
        assert_eq!(cli.messages, vec!["a", "b"]);
        assert_eq!(cli.count, 3);
    }
}
