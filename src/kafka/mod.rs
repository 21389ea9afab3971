//! Kafka integration module
//!
//! This module provides:
//! - A consumer-group runner with capped exponential retry and single-shot shutdown
//! - A producer with a synchronous and an asynchronous send path
//! - The broker collaborator contracts and their librdkafka implementations

mod client;
mod config;
mod consumer;
mod producer;
mod rdkafka_client;
mod retry;

pub use client::{
    AsyncPublisher, ChannelClaim, ClaimDispatcher, DeliveryResults, GroupClient, GroupHandler,
    GroupSession, PartitionClaim, SyncPublisher,
};
pub use config::{BrokerAddressSet, ConsumerConfig, GroupIdentity, ProducerConfig, TopicSet};
pub use consumer::{ConsumerRunner, ConsumerRunnerBuilder, RunnerState, RunnerStatus};
pub use producer::{DrainStats, Producer, ProducerBuilder};
pub use rdkafka_client::{RdKafkaAsyncPublisher, RdKafkaGroupClient, RdKafkaSyncPublisher};
pub use retry::{PolicyBackoff, RetryPolicy};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use thiserror::Error;

/// Errors reported by the broker collaborator
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("consumer group is closed")]
    GroupClosed,

    #[error("publisher is closed")]
    PublisherClosed,

    #[error("Kafka client error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handler error: {0}")]
    Handler(String),
}

impl BrokerError {
    /// Convert an error returned by a user handler
    pub fn handler(err: anyhow::Error) -> Self {
        BrokerError::Handler(format!("{err:#}"))
    }
}

/// One outbound message: the topic, key and value submitted to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

impl Envelope {
    /// Create an envelope. An empty key is sent as no key.
    pub fn new(
        topic: impl Into<String>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        let key = key.into();
        Self {
            topic: topic.into(),
            key: (!key.is_empty()).then_some(key),
            value: value.into(),
        }
    }
}

/// Broker acknowledgement for a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A message the broker could not deliver
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub envelope: Envelope,
    pub error: BrokerError,
}

/// A record consumed from a partition claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    /// Copy a record out of a librdkafka message
    pub fn from_message<M: Message>(message: &M) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        }
    }
}

/// Metadata describing a consumer group session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub group_id: String,
    pub generation: u64,
    /// Assigned partitions keyed by topic
    pub claims: BTreeMap<String, Vec<i32>>,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let partitions: usize = self.claims.values().map(Vec::len).sum();
        write!(
            f,
            "group {} generation {} ({} partitions)",
            self.group_id, self.generation, partitions
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{OwnedMessage, Timestamp};

    #[test]
    fn test_envelope_empty_key_is_none() {
        let envelope = Envelope::new("orders", Vec::new(), b"payload".to_vec());
        assert_eq!(envelope.key, None);

        let envelope = Envelope::new("orders", b"k1".to_vec(), b"payload".to_vec());
        assert_eq!(envelope.key.as_deref(), Some(&b"k1"[..]));
    }

    #[test]
    fn test_record_from_message() {
        let message = OwnedMessage::new(
            Some(b"value".to_vec()),
            Some(b"key".to_vec()),
            "events".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            3,
            42,
            None,
        );

        let record = Record::from_message(&message);
        assert_eq!(record.topic, "events");
        assert_eq!(record.partition, 3);
        assert_eq!(record.offset, 42);
        assert_eq!(record.key.as_deref(), Some(&b"key"[..]));
        assert_eq!(record.value.as_deref(), Some(&b"value"[..]));
        assert_eq!(
            record.timestamp.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_session_info_display() {
        let mut claims = BTreeMap::new();
        claims.insert("events".to_string(), vec![0, 1]);
        let info = SessionInfo {
            group_id: "billing".to_string(),
            generation: 4,
            claims,
        };
        assert_eq!(info.to_string(), "group billing generation 4 (2 partitions)");
    }
}
