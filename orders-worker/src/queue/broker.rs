//! Connection, channel and queue plumbing shared by both sides.

use std::time::Duration;

use lapin::{
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::types::QueueDefinition;
use crate::error::DeclareFailure;

/// AMQP `reply-success`.
const REPLY_SUCCESS: u16 = 200;

/// Open a connection to the broker.
pub(crate) async fn connect(
    url: &str,
    connection_name: Option<&str>,
) -> Result<Connection, lapin::Error> {
    let mut properties = ConnectionProperties::default();
    if let Some(name) = connection_name {
        properties = properties.with_connection_name(LongString::from(name.to_string()));
    }

    info!(url_length = url.len(), "rabbitmq_connecting");
    let connection = Connection::connect(url, properties).await?;
    info!("rabbitmq_connected");

    Ok(connection)
}

/// Owns a freshly opened connection until it is handed off or closed.
///
/// Dropping the guard while the connection is still open (a cancelled
/// `start` or `send`) closes it on a background task.
pub(crate) struct ConnectionGuard {
    connection: Option<Connection>,
}

impl ConnectionGuard {
    pub(crate) fn new(connection: Connection) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        match &self.connection {
            Some(connection) => connection,
            None => unreachable!("connection is only taken by into_inner"),
        }
    }

    /// Disarm the guard and hand the connection to a longer-lived owner.
    pub(crate) fn into_inner(mut self) -> Connection {
        match self.connection.take() {
            Some(connection) => connection,
            None => unreachable!("connection is only taken by into_inner"),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if !connection.status().connected() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("rabbitmq_connection_dropped_open");
            return;
        };

        runtime.spawn(async move {
            match connection.close(REPLY_SUCCESS, "Cancelled").await {
                Ok(()) => debug!("rabbitmq_connection_closed_on_drop"),
                Err(e) => warn!(error = %e, "rabbitmq_connection_close_error"),
            }
        });
    }
}

/// Declare `queue` on `channel`. Idempotent when the flags match.
pub(crate) async fn declare_queue(
    channel: &Channel,
    queue: &QueueDefinition,
) -> Result<(), DeclareFailure> {
    let declared = channel
        .queue_declare(&queue.name, queue.declare_options(), FieldTable::default())
        .await
        .map_err(DeclareFailure::classify)?;

    info!(
        queue = %queue.name,
        durable = queue.durable,
        messages = declared.message_count(),
        consumers = declared.consumer_count(),
        "rabbitmq_queue_declared"
    );

    Ok(())
}

/// Close a channel, logging instead of failing.
pub(crate) async fn close_channel(channel: &Channel, limit: Duration) {
    if !channel.status().connected() {
        debug!(channel_id = channel.id(), "rabbitmq_channel_already_closed");
        return;
    }

    match timeout(limit, channel.close(REPLY_SUCCESS, "Normal shutdown")).await {
        Ok(Ok(())) => debug!(channel_id = channel.id(), "rabbitmq_channel_closed"),
        Ok(Err(e)) => warn!(error = %e, "rabbitmq_channel_close_error"),
        Err(_) => warn!(
            timeout_ms = limit.as_millis() as u64,
            "rabbitmq_channel_close_timeout"
        ),
    }
}

/// Close a connection, logging instead of failing.
pub(crate) async fn close_connection(connection: &Connection, limit: Duration) {
    if !connection.status().connected() {
        debug!("rabbitmq_connection_already_closed");
        return;
    }

    match timeout(limit, connection.close(REPLY_SUCCESS, "Normal shutdown")).await {
        Ok(Ok(())) => debug!("rabbitmq_connection_closed"),
        Ok(Err(e)) => warn!(error = %e, "rabbitmq_connection_close_error"),
        Err(_) => warn!(
            timeout_ms = limit.as_millis() as u64,
            "rabbitmq_connection_close_timeout"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::DEFAULT_AMQP_URL;

    fn broker_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| DEFAULT_AMQP_URL.to_string())
    }

    #[tokio::test]
    #[ignore = "requires a running RabbitMQ broker"]
    async fn test_dropped_guard_closes_connection() {
        let connection = connect(&broker_url(), None).await.unwrap();
        let status = connection.status().clone();
        assert!(status.connected());

        drop(ConnectionGuard::new(connection));

        for _ in 0..50 {
            if !status.connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!status.connected());
    }

    #[tokio::test]
    #[ignore = "requires a running RabbitMQ broker"]
    async fn test_into_inner_keeps_connection_open() {
        let connection = connect(&broker_url(), None).await.unwrap();
        let connection = ConnectionGuard::new(connection).into_inner();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(connection.status().connected());

        close_connection(&connection, Duration::from_secs(1)).await;
        assert!(!connection.status().connected());
    }
}
