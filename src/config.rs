//! Configuration module for StreamRelay
//!
//! This module handles loading and validating configuration from environment
//! variables. Validation builds the same immutable records the consumer runner
//! and the producer build themselves, so a bad value fails before anything
//! connects.

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kafka::{BrokerAddressSet, ConsumerConfig, GroupIdentity, ProducerConfig, TopicSet};

/// Main configuration structure for StreamRelay
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct Config {
    /// Logging configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub logging: LoggingConfig,

    /// Consumer runner configuration
    #[serde(default)]
    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    /// Producer configuration
    #[serde(default)]
    #[envconfig(nested = true)]
    pub producer: ProducerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct LoggingConfig {
    /// Log level
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Environment (development, staging, production)
    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,
}

impl LoggingConfig {
    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        Config::init_from_env().map_err(Error::from)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        BrokerAddressSet::parse(&self.consumer.brokers)?;
        GroupIdentity::new(self.consumer.group_id.clone())?;
        TopicSet::parse(&self.consumer.topics)?;
        self.consumer.offset_reset()?;
        self.consumer.retry_policy()?;

        BrokerAddressSet::parse(&self.producer.brokers)?;
        self.producer.acks()?;
        if self.producer.queue_capacity == 0 {
            return Err(Error::config("producer queue capacity must be at least 1"));
        }

        Ok(())
    }

    /// Log configuration
    pub fn log_config(&self) {
        tracing::info!(
            environment = %self.logging.environment,
            log_level = %self.logging.log_level,
            "Logging configuration"
        );

        tracing::info!(
            brokers = %self.consumer.brokers,
            group_id = %self.consumer.group_id,
            topics = %self.consumer.topics,
            initial_offset = %self.consumer.initial_offset,
            max_retries = self.consumer.max_retries,
            initial_backoff_ms = self.consumer.initial_backoff_ms,
            max_backoff_ms = self.consumer.max_backoff_ms,
            max_exhaustion_rounds = self.consumer.max_exhaustion_rounds,
            "Consumer configuration"
        );

        tracing::info!(
            brokers = %self.producer.brokers,
            required_acks = %self.producer.required_acks,
            retry_max = self.producer.retry_max,
            timeout_ms = self.producer.timeout_ms,
            "Producer configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            logging: LoggingConfig {
                log_level: "debug".to_string(),
                environment: "production".to_string(),
            },
            consumer: ConsumerConfig::default(),
            producer: ProducerConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = config();
        config.validate().unwrap();
        assert!(config.logging.is_production());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut bad_topics = config();
        bad_topics.consumer.topics = " ,, ".to_string();
        assert!(bad_topics.validate().unwrap_err().is_config());

        let mut bad_offset = config();
        bad_offset.consumer.initial_offset = "middle".to_string();
        assert!(bad_offset.validate().unwrap_err().is_config());

        let mut bad_factor = config();
        bad_factor.consumer.backoff_factor = 0.5;
        assert!(bad_factor.validate().unwrap_err().is_config());

        let mut bad_acks = config();
        bad_acks.producer.required_acks = "some".to_string();
        assert!(bad_acks.validate().unwrap_err().is_config());
    }
}
