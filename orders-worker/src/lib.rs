//! Orders - durable queue handoff between an order sender and a consumer.
//!
//! This library provides shared modules for the two binaries:
//! - `orders-sender`: publishes messages to the `orders` queue
//! - `orders-consumer`: long-running service that prints every message
//!
//! ## Architecture
//!
//! ```text
//! orders-sender → RabbitMQ (default exchange, key "orders") → orders queue → orders-consumer
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod host;
pub mod queue;

// Re-export commonly used types
pub use config::Config;
pub use consumer::{AckMode, ConsumerState, Dispatch, OrdersConsumer};
pub use error::{ConsumerError, DecodeError, PublishError};
pub use handler::{HandlerError, MessageHandler, PrintHandler};
pub use host::{run_until, shutdown_signal, HookTimeouts};
pub use queue::{OrdersPublisher, QueueDefinition, ReceivedMessage, ORDERS_QUEUE};
