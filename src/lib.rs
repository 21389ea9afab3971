//! StreamRelay Library
//!
//! A consumer group runner that retries broker failures with capped
//! exponential backoff and shuts down exactly once, and a producer with a
//! synchronous and an asynchronous send path behind one closed flag.

pub mod config;
pub mod error;
pub mod kafka;
pub mod logging;
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{Annotate, Error, Result};

pub use kafka::{
    BrokerError, ConsumerConfig, ConsumerRunner, Delivery, DrainStats, Envelope, GroupHandler,
    Producer, ProducerConfig, Record, RetryPolicy, RunnerState,
};
