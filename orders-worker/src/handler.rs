//! Message handlers invoked by the consumer once per delivery.

use std::io::{self, Write};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::queue::ReceivedMessage;

/// Prefix of every line written by [`PrintHandler`].
pub const RECEIVED_PREFIX: &str = " [x] Received ";

/// Handles one decoded delivery.
///
/// The consumer calls `handle` exactly once per delivery. With serial
/// dispatch calls never overlap and arrive in delivery order; with concurrent
/// dispatch they may overlap and complete in any order.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &ReceivedMessage) -> Result<(), HandlerError>;
}

/// Handler failure. Only consulted in manual ack mode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth another attempt; the message is requeued.
    #[error("transient error (will requeue): {0}")]
    Transient(String),

    /// Never going to succeed; the message is dropped.
    #[error("permanent error (will not requeue): {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn requeue(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Writes ` [x] Received <text>` for every message.
pub struct PrintHandler<W> {
    out: Mutex<W>,
}

impl PrintHandler<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> PrintHandler<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Recover the writer, e.g. to inspect captured output.
    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl<W: Write + Send + 'static> MessageHandler for PrintHandler<W> {
    async fn handle(&self, message: &ReceivedMessage) -> Result<(), HandlerError> {
        {
            let mut out = self
                .out
                .lock()
                .map_err(|_| HandlerError::Permanent("output writer poisoned".to_string()))?;

            writeln!(out, "{}{}", RECEIVED_PREFIX, message.text)
                .and_then(|_| out.flush())
                .map_err(|e| HandlerError::Transient(e.to_string()))?;
        }

        info!(
            queue = %message.queue,
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
            body_length = message.text.len(),
            "orders_message_received"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> ReceivedMessage {
        ReceivedMessage {
            queue: "orders".to_string(),
            delivery_tag: 1,
            redelivered: false,
            text: text.to_string(),
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_print_handler_writes_one_line() {
        let handler = PrintHandler::new(Vec::new());
        handler.handle(&message("\"order-123\"")).await.unwrap();

        let output = String::from_utf8(handler.into_inner()).unwrap();
        assert_eq!(output, " [x] Received \"order-123\"\n");
    }

    #[tokio::test]
    async fn test_print_handler_keeps_order() {
        let handler = PrintHandler::new(Vec::new());
        for text in ["\"a\"", "\"b\"", "\"c\""] {
            handler.handle(&message(text)).await.unwrap();
        }

        let output = String::from_utf8(handler.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            vec![
                " [x] Received \"a\"",
                " [x] Received \"b\"",
                " [x] Received \"c\""
            ]
        );
    }

    #[tokio::test]
    async fn test_print_handler_write_failure_is_transient() {
        let handler = PrintHandler::new(BrokenPipe);
        let err = handler.handle(&message("x")).await.unwrap_err();
        assert!(err.requeue());
    }

    #[test]
    fn test_requeue_policy() {
        assert!(HandlerError::Transient("db down".into()).requeue());
        assert!(!HandlerError::Permanent("bad order".into()).requeue());
    }
}
