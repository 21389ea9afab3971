//! Integration tests against a live Kafka broker, plus configuration loading

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use streamrelay::kafka::{
    ConsumerConfig, ConsumerRunner, GroupHandler, GroupSession, PartitionClaim, Producer,
    ProducerConfig, Record,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Test Kafka broker address
const TEST_KAFKA_BROKER: &str = "localhost:9092";

/// Create a test topic for integration testing
async fn create_test_topic(topic: &str, partitions: i32) -> Result<(), Box<dyn std::error::Error>> {
    let admin: AdminClient<DefaultClientContext> =
        ClientConfig::new().set("bootstrap.servers", TEST_KAFKA_BROKER).create()?;

    let topics = vec![NewTopic::new(topic, partitions, TopicReplication::Fixed(1))];
    let results = admin.create_topics(&topics, &AdminOptions::new()).await?;

    for result in results {
        match result {
            Ok(topic) => println!("Created topic: {}", topic),
            Err((topic, err)) => {
                // Ignore if topic already exists
                if !err.to_string().contains("already exists") {
                    return Err(format!("Failed to create topic {}: {}", topic, err).into());
                }
            },
        }
    }

    Ok(())
}

/// Forwards every claimed record to a channel
struct ForwardingHandler {
    records: mpsc::UnboundedSender<Record>,
}

#[async_trait]
impl GroupHandler for ForwardingHandler {
    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn PartitionClaim,
    ) -> anyhow::Result<()> {
        while let Some(record) = claim.next_record().await {
            session.mark_record(&record);
            self.records.send(record)?;
        }
        Ok(())
    }
}

fn producer_config() -> ProducerConfig {
    ProducerConfig {
        brokers: TEST_KAFKA_BROKER.to_string(),
        timeout_ms: 5000,
        ..ProducerConfig::default()
    }
}

#[tokio::test]
#[ignore] // Requires Kafka to be running
async fn test_round_trip_through_live_broker() {
    let topic = "streamrelay-test-round-trip";
    create_test_topic(topic, 2).await.expect("Failed to create topic");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer_config = ConsumerConfig {
        brokers: TEST_KAFKA_BROKER.to_string(),
        group_id: "streamrelay-test-round-trip".to_string(),
        topics: topic.to_string(),
        initial_offset: "oldest".to_string(),
        session_timeout_ms: 6000,
        heartbeat_interval_ms: 2000,
        ..ConsumerConfig::default()
    };
    let runner = Arc::new(
        ConsumerRunner::new(consumer_config, Arc::new(ForwardingHandler { records: tx }))
            .expect("Failed to create consumer runner"),
    );

    let producer = Producer::new(producer_config()).expect("Failed to create producer");
    producer
        .send_timeout(Duration::from_secs(5), topic, "sync-key", "sync-value")
        .await
        .expect("Failed to send message");
    for i in 0..10 {
        producer
            .send_async(topic, format!("async-{}", i), "async-value")
            .await
            .expect("Failed to enqueue message");
    }
    producer.close().await.expect("Failed to close producer");
    assert_eq!(producer.drain_stats().succeeded, 10);

    tokio::time::timeout(Duration::from_secs(30), runner.start())
        .await
        .expect("Consumer did not attach in time")
        .expect("Consumer failed to start");

    let mut received = 0;
    while received < 11 {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("Timed out waiting for records")
            .expect("Record channel closed");
        received += 1;
    }

    runner.stop().await.expect("Failed to stop consumer runner");
}

#[tokio::test]
#[ignore] // Requires Kafka to be running
async fn test_start_returns_on_empty_topic() {
    let topic = "streamrelay-test-empty";
    create_test_topic(topic, 1).await.expect("Failed to create topic");

    let (tx, _rx) = mpsc::unbounded_channel();
    let consumer_config = ConsumerConfig {
        brokers: TEST_KAFKA_BROKER.to_string(),
        group_id: "streamrelay-test-empty".to_string(),
        topics: topic.to_string(),
        session_timeout_ms: 6000,
        heartbeat_interval_ms: 2000,
        ..ConsumerConfig::default()
    };
    let runner = ConsumerRunner::new(consumer_config, Arc::new(ForwardingHandler { records: tx }))
        .expect("Failed to create consumer runner");

    // Readiness comes from the partition assignment, no record is needed
    tokio::time::timeout(Duration::from_secs(15), runner.start())
        .await
        .expect("Consumer did not attach on an idle topic")
        .expect("Consumer failed to start");
    assert!(runner.attachments() >= 1);

    runner.stop().await.expect("Failed to stop consumer runner");
}

#[tokio::test]
#[ignore] // Requires Kafka to be running
async fn test_send_with_cancelled_token() {
    let producer = Producer::new(producer_config()).expect("Failed to create producer");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = producer
        .send(&cancel, "streamrelay-test-cancel", "k", "v")
        .await
        .unwrap_err();
    assert!(err.is_send_canceled());

    producer.close().await.expect("Failed to close producer");
}

#[test]
fn test_consumer_config_defaults() {
    let config = ConsumerConfig::default();

    assert_eq!(config.brokers, "localhost:9092");
    assert_eq!(config.group_id, "streamrelay-consumer");
    assert_eq!(config.topics, "events");
    assert_eq!(config.initial_offset, "newest");
    assert_eq!(config.session_timeout_ms, 20000);
    assert_eq!(config.max_exhaustion_rounds, 0);

    let policy = config.retry_policy().unwrap();
    assert_eq!(policy.max_retries(), 3);
    assert_eq!(policy.initial_backoff(), Duration::from_secs(1));
    assert_eq!(policy.max_backoff(), Duration::from_secs(30));
}

#[test]
fn test_consumer_config_from_env() {
    // Set environment variables
    std::env::set_var("KAFKA_BROKERS", "broker1:9092,broker2:9092");
    std::env::set_var("KAFKA_CONSUMER_GROUP", "test-group");
    std::env::set_var("KAFKA_CONSUMER_TOPICS", "orders,payments");
    std::env::set_var("KAFKA_INITIAL_OFFSET", "oldest");
    std::env::set_var("KAFKA_MAX_RETRIES", "5");
    std::env::set_var("KAFKA_MAX_EXHAUSTION_ROUNDS", "2");

    let config = ConsumerConfig::from_env().expect("Failed to load config from env");

    assert_eq!(config.brokers, "broker1:9092,broker2:9092");
    assert_eq!(config.group_id, "test-group");
    assert_eq!(config.topics, "orders,payments");
    assert_eq!(config.offset_reset().unwrap(), "earliest");
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.max_exhaustion_rounds, 2);

    // Cleanup
    std::env::remove_var("KAFKA_BROKERS");
    std::env::remove_var("KAFKA_CONSUMER_GROUP");
    std::env::remove_var("KAFKA_CONSUMER_TOPICS");
    std::env::remove_var("KAFKA_INITIAL_OFFSET");
    std::env::remove_var("KAFKA_MAX_RETRIES");
    std::env::remove_var("KAFKA_MAX_EXHAUSTION_ROUNDS");
}
