//! Error types for the publisher, the consumer and payload decoding.

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use thiserror::Error;

/// Failure of a single `OrdersPublisher::send` call.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to connect to broker")]
    ConnectionFailed(#[source] lapin::Error),

    #[error("queue `{queue}` exists with incompatible attributes")]
    QueueMismatch {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to declare queue `{queue}`")]
    DeclareFailed {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to encode message")]
    Encode(#[from] serde_json::Error),

    #[error("broker rejected message: {reason}")]
    PublishRejected {
        reason: String,
        #[source]
        source: Option<lapin::Error>,
    },
}

/// Failure of a consumer lifecycle transition.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer is already running")]
    AlreadyRunning,

    #[error("consumer is not running")]
    NotRunning,

    #[error("failed to connect to broker")]
    ConnectionFailed(#[source] lapin::Error),

    #[error("queue `{queue}` exists with incompatible attributes")]
    QueueMismatch {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to declare queue `{queue}`")]
    DeclareFailed {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to start consuming from `{queue}`")]
    ConsumeFailed {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("{operation} did not complete within {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

/// A delivered payload that could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("payload is not a JSON string")]
    InvalidJson(#[from] serde_json::Error),
}

/// Outcome of a failed queue declaration, before it is mapped onto the
/// caller's error type.
#[derive(Debug)]
pub(crate) enum DeclareFailure {
    Mismatch(lapin::Error),
    Other(lapin::Error),
}

impl DeclareFailure {
    /// Split broker replies that mean "the queue exists with other flags"
    /// (406 PRECONDITION_FAILED, or 405 RESOURCE_LOCKED for a queue held
    /// exclusively by another connection) from every other failure.
    pub(crate) fn classify(error: lapin::Error) -> Self {
        if is_queue_mismatch(&error) {
            DeclareFailure::Mismatch(error)
        } else {
            DeclareFailure::Other(error)
        }
    }
}

pub(crate) fn is_queue_mismatch(error: &lapin::Error) -> bool {
    match error {
        lapin::Error::ProtocolError(amqp) => matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                | AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED)
        ),
        _ => false,
    }
}

impl PublishError {
    pub(crate) fn from_declare(queue: &str, failure: DeclareFailure) -> Self {
        match failure {
            DeclareFailure::Mismatch(source) => PublishError::QueueMismatch {
                queue: queue.to_string(),
                source,
            },
            DeclareFailure::Other(source) => PublishError::DeclareFailed {
                queue: queue.to_string(),
                source,
            },
        }
    }
}

impl ConsumerError {
    pub(crate) fn from_declare(queue: &str, failure: DeclareFailure) -> Self {
        match failure {
            DeclareFailure::Mismatch(source) => ConsumerError::QueueMismatch {
                queue: queue.to_string(),
                source,
            },
            DeclareFailure::Other(source) => ConsumerError::DeclareFailed {
                queue: queue.to_string(),
                source,
            },
        }
    }
}
