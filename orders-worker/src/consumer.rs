//! RabbitMQ consumer service for the orders queue.
//!
//! `start` connects, declares the queue, registers with `basic.consume` and
//! hands the delivery stream to a background task; it returns without
//! waiting for any message. `stop` closes the channel, then the connection,
//! then abandons whatever delivery is still in flight.
//!
//! With the default [`AckMode::Auto`] the broker considers a message
//! delivered as soon as it is pushed to us, before the handler runs. A crash
//! while the handler is running loses that message.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection,
};
use tokio::{
    sync::{Mutex, Semaphore},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConsumerError;
use crate::handler::{HandlerError, MessageHandler};
use crate::queue::{broker, codec, QueueDefinition, ReceivedMessage};

/// When the broker may forget a delivered message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledged on handoff, before the handler runs (at-most-once).
    #[default]
    Auto,
    /// Acknowledged after the handler succeeds.
    Manual,
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "manual" => Ok(AckMode::Manual),
            other => Err(format!("unknown ack mode `{other}`")),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Auto => f.write_str("auto"),
            AckMode::Manual => f.write_str("manual"),
        }
    }
}

/// How deliveries are handed to the handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dispatch {
    /// One invocation at a time, in delivery order.
    #[default]
    Serial,
    /// Up to `limit` invocations in flight, each on its own task.
    Concurrent { limit: usize },
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Running,
}

/// Resources held while running. Dropping it abandons the delivery task.
struct Session {
    connection: Connection,
    channel: Channel,
    deliveries: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.deliveries.abort();
    }
}

enum Lifecycle {
    Stopped,
    Running(Session),
}

/// Consumes a queue and feeds every delivery to a [`MessageHandler`].
pub struct OrdersConsumer<H> {
    url: String,
    connection_name: Option<String>,
    queue: QueueDefinition,
    consumer_tag: String,
    ack_mode: AckMode,
    dispatch: Dispatch,
    prefetch_count: u16,
    close_timeout: Duration,
    handler: Arc<H>,
    lifecycle: Mutex<Lifecycle>,
}

impl<H: MessageHandler> OrdersConsumer<H> {
    pub fn new(config: &Config, handler: Arc<H>) -> Self {
        Self {
            url: config.amqp_url.clone(),
            connection_name: config.connection_name.clone(),
            queue: QueueDefinition::durable(config.queue_name.clone()),
            consumer_tag: config.consumer_tag.clone(),
            ack_mode: config.ack_mode,
            dispatch: config.dispatch(),
            prefetch_count: config.prefetch_count,
            close_timeout: config.stop_timeout(),
            handler,
            lifecycle: Mutex::new(Lifecycle::Stopped),
        }
    }

    /// Consume from a different queue definition.
    pub fn with_queue(mut self, queue: QueueDefinition) -> Self {
        self.queue = queue;
        self
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub async fn state(&self) -> ConsumerState {
        match *self.lifecycle.lock().await {
            Lifecycle::Stopped => ConsumerState::Stopped,
            Lifecycle::Running(_) => ConsumerState::Running,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == ConsumerState::Running
    }

    /// Connect and begin consuming. Fails with `AlreadyRunning` without
    /// touching the broker if a session is active.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            warn!(queue = %self.queue.name, "consumer_already_running");
            return Err(ConsumerError::AlreadyRunning);
        }

        let session = self.open_session().await?;
        *lifecycle = Lifecycle::Running(session);

        info!(
            queue = %self.queue.name,
            consumer_tag = %self.consumer_tag,
            ack_mode = %self.ack_mode,
            dispatch = ?self.dispatch,
            "consumer_started"
        );

        Ok(())
    }

    /// Close channel and connection and go back to `Stopped`.
    ///
    /// Both closes are attempted; failures are logged, never returned.
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let mut session = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(session) => session,
            Lifecycle::Stopped => {
                debug!(queue = %self.queue.name, "consumer_not_running");
                return Err(ConsumerError::NotRunning);
            }
        };

        info!(queue = %self.queue.name, "consumer_stopping");

        broker::close_channel(&session.channel, self.close_timeout).await;
        broker::close_connection(&session.connection, self.close_timeout).await;

        session.deliveries.abort();
        match (&mut session.deliveries).await {
            Err(e) if e.is_panic() => error!("consumer_delivery_task_panicked"),
            _ => {}
        }

        info!(queue = %self.queue.name, "consumer_stopped");
        Ok(())
    }

    async fn open_session(&self) -> Result<Session, ConsumerError> {
        let connection = broker::connect(&self.url, self.connection_name.as_deref())
            .await
            .map_err(ConsumerError::ConnectionFailed)?;
        // A start abandoned by timeout or shutdown must not leave this open.
        let connection = broker::ConnectionGuard::new(connection);

        match self.subscribe(connection.connection()).await {
            Ok((channel, deliveries)) => Ok(Session {
                connection: connection.into_inner(),
                channel,
                deliveries,
            }),
            Err(e) => {
                broker::close_connection(connection.connection(), self.close_timeout).await;
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        connection: &Connection,
    ) -> Result<(Channel, JoinHandle<()>), ConsumerError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(ConsumerError::ConnectionFailed)?;
        debug!(channel_id = channel.id(), "rabbitmq_channel_created");

        match self.register(&channel).await {
            Ok(consumer) => {
                let delivery_loop = DeliveryLoop {
                    queue: self.queue.name.clone(),
                    handler: Arc::clone(&self.handler),
                    ack_mode: self.ack_mode,
                };
                let deliveries = tokio::spawn(delivery_loop.run(consumer, self.dispatch));
                Ok((channel, deliveries))
            }
            Err(e) => {
                broker::close_channel(&channel, self.close_timeout).await;
                Err(e)
            }
        }
    }

    async fn register(&self, channel: &Channel) -> Result<lapin::Consumer, ConsumerError> {
        let consume_failed = |source: lapin::Error| ConsumerError::ConsumeFailed {
            queue: self.queue.name.clone(),
            source,
        };

        // Prefetch only bounds unacknowledged deliveries; it has no effect
        // under auto-ack.
        if self.ack_mode == AckMode::Manual {
            channel
                .basic_qos(self.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(consume_failed)?;
            info!(prefetch_count = self.prefetch_count, "rabbitmq_qos_set");
        }

        broker::declare_queue(channel, &self.queue)
            .await
            .map_err(|failure| ConsumerError::from_declare(&self.queue.name, failure))?;

        let consumer = channel
            .basic_consume(
                &self.queue.name,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: self.ack_mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(consume_failed)?;

        info!(queue = %self.queue.name, "rabbitmq_consumer_started");
        Ok(consumer)
    }
}

/// What to tell the broker once a delivery has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// Auto-ack: the broker already forgot the message.
    Nothing,
    Ack,
    Requeue,
    Discard,
}

fn settle(ack_mode: AckMode, outcome: &Result<(), HandlerError>) -> Settlement {
    match (ack_mode, outcome) {
        (AckMode::Auto, _) => Settlement::Nothing,
        (AckMode::Manual, Ok(())) => Settlement::Ack,
        (AckMode::Manual, Err(e)) if e.requeue() => Settlement::Requeue,
        (AckMode::Manual, Err(_)) => Settlement::Discard,
    }
}

/// Undecodable payloads will never decode; don't requeue them.
fn settle_undecodable(ack_mode: AckMode) -> Settlement {
    match ack_mode {
        AckMode::Auto => Settlement::Nothing,
        AckMode::Manual => Settlement::Discard,
    }
}

struct DeliveryLoop<H> {
    queue: String,
    handler: Arc<H>,
    ack_mode: AckMode,
}

impl<H> Clone for DeliveryLoop<H> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            ack_mode: self.ack_mode,
        }
    }
}

impl<H: MessageHandler> DeliveryLoop<H> {
    async fn run(self, mut consumer: lapin::Consumer, dispatch: Dispatch) {
        // Dropping the set (when this task is aborted) aborts its tasks.
        let mut in_flight = JoinSet::new();
        let limiter = match dispatch {
            Dispatch::Serial => None,
            Dispatch::Concurrent { limit } => Some(Arc::new(Semaphore::new(limit))),
        };

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(error = %e, "rabbitmq_delivery_error");
                    continue;
                }
            };

            debug!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                body_length = delivery.data.len(),
                "rabbitmq_message_delivered"
            );

            let Some(limiter) = &limiter else {
                self.process(delivery).await;
                continue;
            };

            let Ok(permit) = Arc::clone(limiter).acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            in_flight.spawn(async move {
                worker.process(delivery).await;
                drop(permit);
            });

            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(queue = %self.queue, "orders_handler_panicked");
                    }
                }
            }
        }

        warn!(queue = %self.queue, "rabbitmq_consumer_closed");

        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!(queue = %self.queue, "orders_handler_panicked");
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let settlement = self
            .handle_payload(&delivery.data, delivery.delivery_tag, delivery.redelivered)
            .await;
        self.apply(&delivery, settlement).await;
    }

    /// Decode one payload and run the handler on it at most once.
    async fn handle_payload(&self, data: &[u8], delivery_tag: u64, redelivered: bool) -> Settlement {
        let text = match codec::decode_text(data) {
            Ok(text) => text.to_string(),
            Err(e) => {
                error!(
                    queue = %self.queue,
                    delivery_tag = delivery_tag,
                    body_length = data.len(),
                    error = %e,
                    "orders_message_decode_failed"
                );
                return settle_undecodable(self.ack_mode);
            }
        };

        let message = ReceivedMessage {
            queue: self.queue.clone(),
            delivery_tag,
            redelivered,
            text,
        };

        let outcome = self.handler.handle(&message).await;
        if let Err(e) = &outcome {
            error!(
                queue = %self.queue,
                delivery_tag = delivery_tag,
                ack_mode = %self.ack_mode,
                error = %e,
                "orders_handler_failed"
            );
        }

        settle(self.ack_mode, &outcome)
    }

    async fn apply(&self, delivery: &Delivery, settlement: Settlement) {
        let delivery_tag = delivery.delivery_tag;
        let result = match settlement {
            Settlement::Nothing => return,
            Settlement::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
            Settlement::Requeue | Settlement::Discard => {
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: settlement == Settlement::Requeue,
                        ..Default::default()
                    })
                    .await
            }
        };

        match result {
            Ok(()) => debug!(
                delivery_tag = delivery_tag,
                settlement = ?settlement,
                "rabbitmq_delivery_settled"
            ),
            Err(e) => error!(
                delivery_tag = delivery_tag,
                settlement = ?settlement,
                error = %e,
                "rabbitmq_settle_failed"
            ),
        }
    }
}
