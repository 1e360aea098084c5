//! Queue and message types shared by the sender and the consumer.

use lapin::options::QueueDeclareOptions;

/// Queue name both sides address.
pub const ORDERS_QUEUE: &str = "orders";

/// The default (unnamed) exchange; routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Content type stamped on every published message.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Attributes a queue is declared with.
///
/// The broker rejects a declaration whose flags differ from the existing
/// queue, so the sender and the consumer must build this the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueDefinition {
    /// The `orders` queue: durable, shared, never auto-deleted.
    pub fn orders() -> Self {
        Self::durable(ORDERS_QUEUE)
    }

    /// A durable, non-exclusive, non-auto-delete queue with the given name.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Same queue, transient. Only useful to provoke a mismatch.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Routing key that delivers to this queue through the default exchange.
    pub fn routing_key(&self) -> &str {
        &self.name
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }
}

impl Default for QueueDefinition {
    fn default() -> Self {
        Self::orders()
    }
}

/// A delivery after its payload was decoded as UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Queue the message was consumed from
    pub queue: String,
    /// Broker-assigned delivery tag, unique per channel
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    /// Payload text, exactly as published
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_queue_flags() {
        let queue = QueueDefinition::orders();
        assert_eq!(queue.name, "orders");
        assert!(queue.durable);
        assert!(!queue.exclusive);
        assert!(!queue.auto_delete);
        assert_eq!(queue.routing_key(), "orders");
    }

    #[test]
    fn test_declare_options_match_flags() {
        let options = QueueDefinition::orders().declare_options();
        assert!(options.durable);
        assert!(!options.exclusive);
        assert!(!options.auto_delete);
        assert!(!options.passive);
        assert!(!options.nowait);

        let transient = QueueDefinition::orders().transient().declare_options();
        assert!(!transient.durable);
    }

    #[test]
    fn test_custom_name_keeps_flags() {
        let queue = QueueDefinition::durable("orders-staging");
        assert_eq!(queue, QueueDefinition {
            name: "orders-staging".to_string(),
            ..QueueDefinition::orders()
        });
    }
}
