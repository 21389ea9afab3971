//! Kafka configuration module

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::RetryPolicy;
use crate::error::{Error, Result};

/// Consumer runner configuration settings
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct ConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    #[serde(default = "default_brokers")]
    #[envconfig(from = "KAFKA_BROKERS", default = "localhost:9092")]
    pub brokers: String,

    /// Consumer group ID
    #[serde(default = "default_group_id")]
    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "streamrelay-consumer")]
    pub group_id: String,

    /// Topics to subscribe to (comma-separated)
    #[serde(default = "default_topics")]
    #[envconfig(from = "KAFKA_CONSUMER_TOPICS", default = "events")]
    pub topics: String,

    /// Where a new group starts reading: `newest` or `oldest`
    #[serde(default = "default_initial_offset")]
    #[envconfig(from = "KAFKA_INITIAL_OFFSET", default = "newest")]
    pub initial_offset: String,

    /// Broker version to assume when the broker cannot be asked (e.g. `2.8.0`)
    #[serde(default)]
    #[envconfig(from = "KAFKA_BROKER_VERSION")]
    pub broker_version: Option<String>,

    /// Group session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "20000")]
    pub session_timeout_ms: u64,

    /// Group heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    #[envconfig(from = "KAFKA_HEARTBEAT_INTERVAL_MS", default = "6000")]
    pub heartbeat_interval_ms: u64,

    /// How long a claim may take to accept a record before it is reported as slow
    #[serde(default = "default_max_processing_time_ms")]
    #[envconfig(from = "KAFKA_MAX_PROCESSING_TIME_MS", default = "500")]
    pub max_processing_time_ms: u64,

    /// Records buffered per partition claim
    #[serde(default = "default_claim_buffer")]
    #[envconfig(from = "KAFKA_CLAIM_BUFFER", default = "256")]
    pub claim_buffer: usize,

    /// Maximum retries per attach round
    #[serde(default = "default_max_retries")]
    #[envconfig(from = "KAFKA_MAX_RETRIES", default = "3")]
    pub max_retries: u32,

    /// First retry backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    #[envconfig(from = "KAFKA_INITIAL_BACKOFF_MS", default = "1000")]
    pub initial_backoff_ms: u64,

    /// Retry backoff cap in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    #[envconfig(from = "KAFKA_MAX_BACKOFF_MS", default = "30000")]
    pub max_backoff_ms: u64,

    /// Backoff growth factor
    #[serde(default = "default_backoff_factor")]
    #[envconfig(from = "KAFKA_BACKOFF_FACTOR", default = "2.0")]
    pub backoff_factor: f64,

    /// Give up after this many consecutive exhausted rounds (0 retries forever)
    #[serde(default)]
    #[envconfig(from = "KAFKA_MAX_EXHAUSTION_ROUNDS", default = "0")]
    pub max_exhaustion_rounds: u32,

    /// How long `stop` waits for the consume loop to exit, in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    #[envconfig(from = "KAFKA_SHUTDOWN_TIMEOUT_MS", default = "30000")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            topics: default_topics(),
            initial_offset: default_initial_offset(),
            broker_version: None,
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_processing_time_ms: default_max_processing_time_ms(),
            claim_buffer: default_claim_buffer(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_exhaustion_rounds: 0,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl ConsumerConfig {
    /// Create a new ConsumerConfig from environment variables
    pub fn from_env() -> std::result::Result<Self, envconfig::Error> {
        <Self as envconfig::Envconfig>::init_from_env()
    }

    /// Get max processing time as Duration
    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Build the validated retry policy
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_factor,
        )
    }

    /// librdkafka value for `auto.offset.reset`
    pub fn offset_reset(&self) -> Result<&'static str> {
        match self.initial_offset.trim().to_ascii_lowercase().as_str() {
            "newest" | "latest" => Ok("latest"),
            "oldest" | "earliest" => Ok("earliest"),
            other => Err(Error::config(format!("unknown initial offset '{}'", other))),
        }
    }

    /// Build rdkafka consumer configuration
    pub fn build_client_config(
        &self,
        brokers: &BrokerAddressSet,
        group: &GroupIdentity,
    ) -> Result<rdkafka::ClientConfig> {
        let mut config = rdkafka::ClientConfig::new();

        config
            .set("bootstrap.servers", brokers.bootstrap_servers())
            .set("group.id", group.as_str())
            .set("partition.assignment.strategy", "roundrobin")
            .set("auto.offset.reset", self.offset_reset()?)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", self.heartbeat_interval_ms.to_string())
            .set("enable.auto.commit", "true")
            // Offsets are stored only for records the handler marked
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");

        if let Some(version) = self.broker_version.as_deref().filter(|v| !v.trim().is_empty()) {
            config
                .set("api.version.request", "false")
                .set("broker.version.fallback", version.trim());
        }

        Ok(config)
    }
}

/// Producer configuration settings
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct ProducerConfig {
    /// Kafka broker addresses (comma-separated)
    #[serde(default = "default_brokers")]
    #[envconfig(from = "KAFKA_BROKERS", default = "localhost:9092")]
    pub brokers: String,

    /// Acknowledgement level: `all`, `1` or `0`
    #[serde(default = "default_required_acks")]
    #[envconfig(from = "KAFKA_REQUIRED_ACKS", default = "all")]
    pub required_acks: String,

    /// Broker-side send retries
    #[serde(default = "default_max_retries")]
    #[envconfig(from = "KAFKA_PRODUCER_RETRY_MAX", default = "3")]
    pub retry_max: u32,

    /// Delivery timeout in milliseconds
    #[serde(default = "default_producer_timeout_ms")]
    #[envconfig(from = "KAFKA_PRODUCER_TIMEOUT_MS", default = "10000")]
    pub timeout_ms: u64,

    /// Capacity of the asynchronous input queue
    #[serde(default = "default_claim_buffer")]
    #[envconfig(from = "KAFKA_PRODUCER_QUEUE_CAPACITY", default = "256")]
    pub queue_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            required_acks: default_required_acks(),
            retry_max: default_max_retries(),
            timeout_ms: default_producer_timeout_ms(),
            queue_capacity: default_claim_buffer(),
        }
    }
}

impl ProducerConfig {
    /// Create a new ProducerConfig from environment variables
    pub fn from_env() -> std::result::Result<Self, envconfig::Error> {
        <Self as envconfig::Envconfig>::init_from_env()
    }

    /// Get delivery timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// librdkafka value for `acks`
    pub fn acks(&self) -> Result<&'static str> {
        match self.required_acks.trim().to_ascii_lowercase().as_str() {
            "all" | "-1" => Ok("all"),
            "1" | "leader" => Ok("1"),
            "0" | "none" => Ok("0"),
            other => Err(Error::config(format!("unknown required acks '{}'", other))),
        }
    }

    /// Build rdkafka producer configuration
    pub fn build_client_config(&self, brokers: &BrokerAddressSet) -> Result<rdkafka::ClientConfig> {
        if self.queue_capacity == 0 {
            return Err(Error::config("producer queue capacity must be at least 1"));
        }

        let mut config = rdkafka::ClientConfig::new();

        config
            .set("bootstrap.servers", brokers.bootstrap_servers())
            .set("acks", self.acks()?)
            .set("retries", self.retry_max.to_string())
            .set("message.timeout.ms", self.timeout_ms.to_string());

        Ok(config)
    }
}

/// Ordered, non-empty list of broker endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddressSet(Vec<String>);

impl BrokerAddressSet {
    /// Parse a comma-separated broker list
    pub fn parse(brokers: &str) -> Result<Self> {
        Self::new(brokers.split(','))
    }

    pub fn new<I, S>(brokers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let brokers: Vec<String> = brokers
            .into_iter()
            .map(|b| b.as_ref().trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();

        if brokers.is_empty() {
            return Err(Error::config("brokers is empty"));
        }
        Ok(Self(brokers))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Comma-joined form used for `bootstrap.servers`
    pub fn bootstrap_servers(&self) -> String {
        self.0.join(",")
    }
}

impl fmt::Display for BrokerAddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bootstrap_servers())
    }
}

/// Non-empty consumer group name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupIdentity(String);

impl GroupIdentity {
    pub fn new(group_id: impl Into<String>) -> Result<Self> {
        let group_id = group_id.into();
        if group_id.trim().is_empty() {
            return Err(Error::config("group ID is empty"));
        }
        Ok(Self(group_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Non-empty set of topic names, in first-seen order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet(Vec<String>);

impl TopicSet {
    /// Parse a comma-separated topic list
    pub fn parse(topics: &str) -> Result<Self> {
        Self::new(topics.split(','))
    }

    pub fn new<I, S>(topics: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set: Vec<String> = Vec::new();
        for topic in topics {
            let topic = topic.as_ref().trim();
            if !topic.is_empty() && !set.iter().any(|t| t == topic) {
                set.push(topic.to_string());
            }
        }

        if set.is_empty() {
            return Err(Error::config("topics is empty"));
        }
        Ok(Self(set))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TopicSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

// Default value functions
fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_id() -> String {
    "streamrelay-consumer".to_string()
}

fn default_topics() -> String {
    "events".to_string()
}

fn default_initial_offset() -> String {
    "newest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    20000 // 20 seconds
}

fn default_heartbeat_interval_ms() -> u64 {
    6000
}

fn default_max_processing_time_ms() -> u64 {
    500
}

fn default_claim_buffer() -> usize {
    256
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_shutdown_timeout_ms() -> u64 {
    30000
}

fn default_required_acks() -> String {
    "all".to_string()
}

fn default_producer_timeout_ms() -> u64 {
    10000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_consumer_config() {
        let config = ConsumerConfig::default();
        assert_eq!(config.brokers, "localhost:9092");
        assert_eq!(config.group_id, "streamrelay-consumer");
        assert_eq!(config.offset_reset().unwrap(), "latest");
        assert_eq!(config.max_exhaustion_rounds, 0);
        assert_eq!(config.retry_policy().unwrap(), RetryPolicy::default());
    }

    #[test]
    fn test_duration_conversions() {
        let config = ConsumerConfig::default();
        assert_eq!(config.max_processing_time(), Duration::from_millis(500));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(ProducerConfig::default().timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_broker_address_set() {
        let brokers = BrokerAddressSet::parse("broker1:9092, broker2:9092,,broker3:9092").unwrap();
        assert_eq!(brokers.as_slice().len(), 3);
        assert_eq!(brokers.as_slice()[1], "broker2:9092");
        assert_eq!(brokers.bootstrap_servers(), "broker1:9092,broker2:9092,broker3:9092");

        let err = BrokerAddressSet::parse(" , ").unwrap_err();
        assert!(err.is_config());
        assert!(BrokerAddressSet::new(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_group_identity() {
        assert_eq!(GroupIdentity::new("billing").unwrap().as_str(), "billing");
        assert!(GroupIdentity::new("   ").unwrap_err().is_config());
    }

    #[test]
    fn test_topic_set_dedupes_in_order() {
        let topics = TopicSet::parse("orders, payments,orders").unwrap();
        assert_eq!(topics.iter().collect::<Vec<_>>(), vec!["orders", "payments"]);
        assert_eq!(topics.len(), 2);
        assert!(TopicSet::parse("").unwrap_err().is_config());
    }

    #[test]
    fn test_consumer_client_config() {
        let config = ConsumerConfig {
            initial_offset: "oldest".to_string(),
            broker_version: Some("2.8.0".to_string()),
            ..ConsumerConfig::default()
        };
        let brokers = BrokerAddressSet::parse("a:9092,b:9092").unwrap();
        let group = GroupIdentity::new("billing").unwrap();

        let client_config = config.build_client_config(&brokers, &group).unwrap();
        assert_eq!(client_config.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(client_config.get("group.id"), Some("billing"));
        assert_eq!(client_config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client_config.get("broker.version.fallback"), Some("2.8.0"));
        assert_eq!(client_config.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn test_unknown_initial_offset_is_rejected() {
        let config = ConsumerConfig {
            initial_offset: "middle".to_string(),
            ..ConsumerConfig::default()
        };
        assert!(config.offset_reset().unwrap_err().is_config());
    }

    #[test]
    fn test_producer_client_config() {
        let brokers = BrokerAddressSet::parse("localhost:9092").unwrap();
        let config = ProducerConfig {
            required_acks: "leader".to_string(),
            ..ProducerConfig::default()
        };

        let client_config = config.build_client_config(&brokers).unwrap();
        assert_eq!(client_config.get("acks"), Some("1"));
        assert_eq!(client_config.get("retries"), Some("3"));
        assert_eq!(client_config.get("message.timeout.ms"), Some("10000"));

        let bad = ProducerConfig {
            required_acks: "most".to_string(),
            ..ProducerConfig::default()
        };
        assert!(bad.build_client_config(&brokers).is_err());
    }
}
