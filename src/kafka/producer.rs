//! Producer with a synchronous and an asynchronous send path

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

use super::client::{AsyncPublisher, DeliveryResults, SyncPublisher};
use super::{
    BrokerAddressSet, BrokerError, Delivery, Envelope, ProducerConfig, RdKafkaAsyncPublisher,
    RdKafkaSyncPublisher,
};
use crate::error::{Annotate, Error, Result};
use crate::logging::{current_dispatch, Timer};

/// Outcomes observed by the asynchronous result drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub succeeded: u64,
    pub failed: u64,
}

impl DrainStats {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}

#[derive(Default)]
struct DrainCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl DrainCounters {
    fn snapshot(&self) -> DrainStats {
        DrainStats {
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

async fn drain_results(results: DeliveryResults, counters: Arc<DrainCounters>) -> DrainStats {
    let DeliveryResults {
        mut successes,
        mut errors,
    } = results;
    let mut successes_open = true;
    let mut errors_open = true;

    while successes_open || errors_open {
        tokio::select! {
            delivery = successes.recv(), if successes_open => match delivery {
                Some(delivery) => {
                    counters.succeeded.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "Message delivered"
                    );
                },
                None => successes_open = false,
            },
            failure = errors.recv(), if errors_open => match failure {
                Some(failure) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    let err = Error::SendFailed(failure.error).annotate("async send message");
                    error!(topic = %failure.envelope.topic, error = %err, "Failed to deliver message");
                },
                None => errors_open = false,
            },
        }
    }

    let stats = counters.snapshot();
    debug!(succeeded = stats.succeeded, failed = stats.failed, "Result drain finished");
    stats
}

/// Builder for [`Producer`]
pub struct ProducerBuilder {
    config: ProducerConfig,
    sync_publisher: Option<Arc<dyn SyncPublisher>>,
    async_publisher: Option<Arc<dyn AsyncPublisher>>,
    dispatch: Option<Dispatch>,
}

impl ProducerBuilder {
    /// Use this publisher for `send` instead of librdkafka
    pub fn sync_publisher(mut self, publisher: Arc<dyn SyncPublisher>) -> Self {
        self.sync_publisher = Some(publisher);
        self
    }

    /// Use this publisher for `send_async` instead of librdkafka
    pub fn async_publisher(mut self, publisher: Arc<dyn AsyncPublisher>) -> Self {
        self.async_publisher = Some(publisher);
        self
    }

    /// Log through this dispatcher instead of the one current at build time
    pub fn log_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Validate the configuration, open both send paths and start the result
    /// drain. Must be called within a Tokio runtime.
    pub fn build(self) -> Result<Producer> {
        let brokers = BrokerAddressSet::parse(&self.config.brokers)?;
        self.config.acks()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::internal(format!("producer needs a runtime: {}", e)))?;

        let sync_publisher: Arc<dyn SyncPublisher> = match self.sync_publisher {
            Some(publisher) => publisher,
            None => Arc::new(RdKafkaSyncPublisher::new(&brokers, &self.config)?),
        };
        // A failure here drops the sync publisher, which releases its client
        let async_publisher: Arc<dyn AsyncPublisher> = match self.async_publisher {
            Some(publisher) => publisher,
            None => Arc::new(RdKafkaAsyncPublisher::new(&brokers, &self.config)?),
        };

        let results = async_publisher
            .take_results()
            .ok_or_else(|| Error::internal("async publisher results were already taken"))?;

        let dispatch = self.dispatch.unwrap_or_else(current_dispatch);
        let counters = Arc::new(DrainCounters::default());
        let drain = runtime.spawn(
            drain_results(results, Arc::clone(&counters)).with_subscriber(dispatch.clone()),
        );

        info!(brokers = %brokers, "Producer created");

        Ok(Producer {
            closed: RwLock::new(false),
            sync_publisher,
            async_publisher,
            drain: Mutex::new(Some(drain)),
            counters,
            drain_timeout: self.config.timeout(),
            dispatch,
        })
    }
}

/// Producer with two send paths sharing one closed flag.
///
/// `send` waits for the broker acknowledgement, bounded by a caller-owned
/// cancellation. `send_async` only enqueues; outcomes are counted and logged
/// by a background drain task.
///
/// A `send` that returns [`Error::SendCanceled`] is not withdrawn: the
/// message may still be delivered after the call returned.
pub struct Producer {
    closed: RwLock<bool>,
    sync_publisher: Arc<dyn SyncPublisher>,
    async_publisher: Arc<dyn AsyncPublisher>,
    drain: Mutex<Option<JoinHandle<DrainStats>>>,
    counters: Arc<DrainCounters>,
    drain_timeout: Duration,
    dispatch: Dispatch,
}

impl Producer {
    pub fn builder(config: ProducerConfig) -> ProducerBuilder {
        ProducerBuilder {
            config,
            sync_publisher: None,
            async_publisher: None,
            dispatch: None,
        }
    }

    /// Build a producer connected through librdkafka
    pub fn new(config: ProducerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Send a message and wait for its acknowledgement or for `cancel`,
    /// whichever comes first
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Delivery> {
        self.send_until(cancel.cancelled(), Envelope::new(topic, key, value))
            .await
    }

    /// Send a message and wait at most `timeout` for its acknowledgement
    pub async fn send_timeout(
        &self,
        timeout: Duration,
        topic: &str,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Delivery> {
        self.send_until(tokio::time::sleep(timeout), Envelope::new(topic, key, value))
            .await
    }

    async fn send_until<F>(&self, canceled: F, envelope: Envelope) -> Result<Delivery>
    where
        F: Future<Output = ()>,
    {
        let closed = self.closed.read().await;
        if *closed {
            return Err(Error::ProducerClosed);
        }

        let topic = envelope.topic.clone();
        let publisher = Arc::clone(&self.sync_publisher);
        let worker = tokio::spawn(
            async move { publisher.send(envelope).await }.with_subscriber(self.dispatch.clone()),
        );

        let result = tokio::select! {
            biased;
            _ = canceled => {
                debug!(%topic, "Send canceled before acknowledgement");
                Err(Error::SendCanceled)
            },
            joined = worker => match joined {
                Ok(Ok(delivery)) => Ok(delivery),
                Ok(Err(e)) => Err(Error::SendFailed(e).annotate("send message")),
                Err(e) => Err(Error::internal(format!("send worker failed: {}", e))),
            },
        };
        drop(closed);
        result
    }

    /// Enqueue a message without waiting for its acknowledgement
    pub async fn send_async(
        &self,
        topic: &str,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(Error::ProducerClosed);
        }

        self.async_publisher
            .enqueue(Envelope::new(topic, key, value))
            .await
            .map_err(|e| match e {
                BrokerError::PublisherClosed => Error::ProducerClosed,
                e => Error::SendFailed(e),
            })
            .annotate("enqueue message")
    }

    /// Close both send paths. Only the first call does any work.
    ///
    /// Both paths are closed even when the first close fails; the first
    /// failure is returned. The result drain has observed every outcome by
    /// the time this returns.
    pub async fn close(&self) -> Result<()> {
        let mut closed = self.closed.write().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        let timer = Timer::start("close producer");
        info!("Closing producer");

        let async_closed = self.async_publisher.close().await.annotate("close async producer");
        if let Err(e) = &async_closed {
            warn!(error = %e, "Failed to close async producer");
        }

        let drain = self.drain.lock().await.take();
        if let Some(drain) = drain {
            match tokio::time::timeout(self.drain_timeout, drain).await {
                Ok(Ok(stats)) => info!(
                    succeeded = stats.succeeded,
                    failed = stats.failed,
                    "Async results drained"
                ),
                Ok(Err(e)) => error!(error = %e, "Result drain task failed"),
                Err(_) => warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "Result drain did not finish in time"
                ),
            }
        }

        let sync_closed = self.sync_publisher.close().await.annotate("close sync producer");
        if let Err(e) = &sync_closed {
            warn!(error = %e, "Failed to close sync producer");
        }

        timer.stop();
        async_closed.and(sync_closed)
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    /// Outcomes observed by the result drain so far
    pub fn drain_stats(&self) -> DrainStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockAsyncPublisher, MockSyncPublisher};

    fn producer(
        sync_publisher: Arc<MockSyncPublisher>,
        async_publisher: Arc<MockAsyncPublisher>,
    ) -> Producer {
        Producer::builder(ProducerConfig::default())
            .sync_publisher(sync_publisher)
            .async_publisher(async_publisher)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_rejects_empty_brokers() {
        let config = ProducerConfig {
            brokers: " ".to_string(),
            ..ProducerConfig::default()
        };
        let err = Producer::builder(config)
            .sync_publisher(Arc::new(MockSyncPublisher::new()))
            .async_publisher(Arc::new(MockAsyncPublisher::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let err = Producer::builder(ProducerConfig::default())
            .sync_publisher(Arc::new(MockSyncPublisher::new()))
            .async_publisher(Arc::new(MockAsyncPublisher::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_send_returns_delivery() {
        let sync_publisher = Arc::new(MockSyncPublisher::new());
        let producer = producer(sync_publisher.clone(), Arc::new(MockAsyncPublisher::new()));

        let delivery = producer
            .send(&CancellationToken::new(), "orders", "k1", "v1")
            .await
            .unwrap();
        assert_eq!(delivery.topic, "orders");
        assert_eq!(sync_publisher.send_calls(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_is_send_failed() {
        let sync_publisher = Arc::new(
            MockSyncPublisher::new().failing(BrokerError::Transport("leader not available".into())),
        );
        let producer = producer(sync_publisher, Arc::new(MockAsyncPublisher::new()));

        let err = producer
            .send(&CancellationToken::new(), "orders", "k1", "v1")
            .await
            .unwrap_err();
        assert!(err.is_send_failed());
        assert!(err.to_string().starts_with("send message: "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_cancels_before_ack() {
        let sync_publisher =
            Arc::new(MockSyncPublisher::new().with_delay(Duration::from_millis(50)));
        let producer = producer(sync_publisher.clone(), Arc::new(MockAsyncPublisher::new()));

        let started = tokio::time::Instant::now();
        let err = producer
            .send_timeout(Duration::from_millis(10), "topic", "key", "value")
            .await
            .unwrap_err();

        assert!(err.is_send_canceled());
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(sync_publisher.completed().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sync_publisher.completed().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_token_wins_over_fast_send() {
        let sync_publisher = Arc::new(MockSyncPublisher::new());
        let producer = producer(sync_publisher.clone(), Arc::new(MockAsyncPublisher::new()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        for _ in 0..20 {
            let err = producer.send(&cancel, "orders", "k", "v").await.unwrap_err();
            assert!(err.is_send_canceled());
        }

        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_producer_rejects_sends() {
        let sync_publisher = Arc::new(MockSyncPublisher::new());
        let async_publisher = Arc::new(MockAsyncPublisher::new());
        let producer = producer(sync_publisher.clone(), async_publisher.clone());

        producer.close().await.unwrap();
        assert!(producer.is_closed().await);

        let err = producer
            .send(&CancellationToken::new(), "orders", "k", "v")
            .await
            .unwrap_err();
        assert!(err.is_producer_closed());
        let err = producer.send_async("orders", "k", "v").await.unwrap_err();
        assert!(err.is_producer_closed());

        assert_eq!(sync_publisher.send_calls(), 0);
        assert_eq!(async_publisher.enqueue_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let sync_publisher = Arc::new(MockSyncPublisher::new());
        let async_publisher = Arc::new(MockAsyncPublisher::new());
        let producer = producer(sync_publisher.clone(), async_publisher.clone());

        producer.close().await.unwrap();
        producer.close().await.unwrap();

        assert_eq!(sync_publisher.close_calls(), 1);
        assert_eq!(async_publisher.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_attempts_both_paths() {
        let sync_publisher = Arc::new(MockSyncPublisher::new());
        let async_publisher = Arc::new(
            MockAsyncPublisher::new().with_close_error(BrokerError::Transport("flush".into())),
        );
        let producer = producer(sync_publisher.clone(), async_publisher.clone());

        let err = producer.close().await.unwrap_err();
        assert!(err.to_string().starts_with("close async producer: "));
        assert_eq!(sync_publisher.close_calls(), 1);
        assert_eq!(async_publisher.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_drain_counts_failures() {
        let async_publisher = Arc::new(MockAsyncPublisher::new().failing_every(4));
        let producer = producer(Arc::new(MockSyncPublisher::new()), async_publisher);

        for i in 0..8 {
            producer.send_async("orders", "", format!("m{}", i)).await.unwrap();
        }
        producer.close().await.unwrap();

        assert_eq!(
            producer.drain_stats(),
            DrainStats {
                succeeded: 6,
                failed: 2
            }
        );
    }
}
