//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The `orders` queue definition both sides declare
//! - Payload encoding and decoding
//! - A connection-per-send publisher
//!
//! ## Architecture
//!
//! ```text
//! orders-sender → default exchange ("orders") → orders queue → orders-consumer
//! ```

pub(crate) mod broker;
pub mod codec;
pub mod publisher;
pub mod types;

pub use publisher::OrdersPublisher;
pub use types::{
    QueueDefinition, ReceivedMessage, DEFAULT_EXCHANGE, JSON_CONTENT_TYPE, ORDERS_QUEUE,
};
