//! Error handling module for StreamRelay
//!
//! This module defines the error types returned by the consumer runner and
//! the producer, together with the annotation helpers used to attach context
//! to an error without losing its identity.

use std::backtrace::{Backtrace, BacktraceStatus};

use thiserror::Error;

use crate::kafka::BrokerError;

/// Result type alias for StreamRelay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for StreamRelay
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, raised at construction time and never retried
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors reported by the broker client
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A send was attempted after the producer was closed
    #[error("producer is closed")]
    ProducerClosed,

    /// The caller's cancellation fired before the broker acknowledged the
    /// message. The message may still be delivered.
    #[error("send canceled before acknowledgement")]
    SendCanceled,

    /// The broker rejected or could not deliver a message
    #[error("send failed: {0}")]
    SendFailed(#[source] BrokerError),

    /// The owning component was stopped while the operation was pending
    #[error("operation canceled")]
    Canceled,

    /// The consumer gave up after the configured number of exhausted rounds
    #[error("consumer gave up after {rounds} exhausted retry rounds")]
    RetriesExhausted { rounds: u32 },

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error with additional context attached
    #[error("{context}: {source}")]
    Annotated {
        context: String,
        source: Box<Error>,
        trace: Box<Backtrace>,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Wrap this error with a context message.
    ///
    /// A backtrace is captured at the annotation site when enabled through
    /// `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`.
    pub fn annotate<S: Into<String>>(self, context: S) -> Self {
        Error::Annotated {
            context: context.into(),
            source: Box::new(self),
            trace: Box::new(Backtrace::capture()),
        }
    }

    /// The innermost error, skipping every annotation layer
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Annotated { source, .. } = current {
            current = source;
        }
        current
    }

    /// Backtrace captured by the outermost annotation, if one was recorded
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            Error::Annotated { trace, .. } if trace.status() == BacktraceStatus::Captured => {
                Some(&**trace)
            },
            _ => None,
        }
    }

    /// Check if this error is a construction-time configuration error
    pub fn is_config(&self) -> bool {
        matches!(self.root(), Error::Config(_))
    }

    /// Check if the consumer group was closed on purpose
    pub fn is_group_closed(&self) -> bool {
        matches!(self.root(), Error::Broker(BrokerError::GroupClosed))
    }

    /// Check if this error means the producer is closed
    pub fn is_producer_closed(&self) -> bool {
        matches!(self.root(), Error::ProducerClosed)
    }

    /// Check if the caller's cancellation ended a send
    pub fn is_send_canceled(&self) -> bool {
        matches!(self.root(), Error::SendCanceled)
    }

    /// Check if the broker failed to deliver a message
    pub fn is_send_failed(&self) -> bool {
        matches!(self.root(), Error::SendFailed(_))
    }

    /// Check if the owning component was canceled
    pub fn is_canceled(&self) -> bool {
        matches!(self.root(), Error::Canceled)
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Broker(BrokerError::GroupClosed) => false,
            Error::Broker(_) | Error::SendFailed(_) => true,
            _ => false,
        }
    }
}

/// Attach context to the error side of a result
pub trait Annotate<T> {
    fn annotate<S: Into<String>>(self, context: S) -> Result<T>;
}

impl<T, E> Annotate<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn annotate<S: Into<String>>(self, context: S) -> Result<T> {
        self.map_err(|e| e.into().annotate(context))
    }
}

/// Convert from envconfig::Error to our Error type
impl From<envconfig::Error> for Error {
    fn from(err: envconfig::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_preserves_identity() {
        let err = Error::ProducerClosed
            .annotate("send message")
            .annotate("publish order");

        assert!(err.is_producer_closed());
        assert!(!err.is_send_canceled());
        assert_eq!(
            err.to_string(),
            "publish order: send message: producer is closed"
        );
    }

    #[test]
    fn test_annotate_result() {
        let result: std::result::Result<(), BrokerError> = Err(BrokerError::GroupClosed);
        let err = result.annotate("consume message failed").unwrap_err();

        assert!(err.is_group_closed());
        assert!(!err.is_retryable());
        assert!(err.to_string().starts_with("consume message failed: "));
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::from(BrokerError::Transport("reset".into())).is_retryable());
        assert!(Error::SendFailed(BrokerError::Transport("reset".into())).is_retryable());
        assert!(!Error::config("brokers is empty").is_retryable());
        assert!(!Error::ProducerClosed.is_retryable());
        assert!(!Error::Canceled.annotate("wait").is_retryable());
    }

    #[test]
    fn test_root_of_plain_error_is_itself() {
        let err = Error::config("group ID is empty");
        assert!(matches!(err.root(), Error::Config(_)));
        assert!(err.is_config());
        assert!(err.backtrace().is_none());
    }
}
