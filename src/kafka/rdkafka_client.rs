//! librdkafka implementations of the broker collaborator traits

use async_trait::async_trait;
use futures::channel::oneshot::Canceled;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::future_producer::OwnedDeliveryResult;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

use super::client::{
    AsyncPublisher, ClaimDispatcher, DeliveryResults, GroupClient, GroupHandler, GroupSession,
    SyncPublisher,
};
use super::{
    BrokerAddressSet, BrokerError, ConsumerConfig, Delivery, DeliveryFailure, Envelope,
    GroupIdentity, ProducerConfig, Record, SessionInfo, TopicSet,
};
use crate::error::{Annotate, Error, Result};

/// Consumer context that counts group generations
struct GroupContext {
    generation: watch::Sender<u64>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "Partitions assigned");
                self.generation.send_modify(|generation| *generation += 1);
            },
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "Partitions revoked");
                self.generation.send_modify(|generation| *generation += 1);
            },
            Rebalance::Error(e) => warn!(error = %e, "Rebalance failed"),
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

/// Consumer group client backed by an rdkafka [`StreamConsumer`].
///
/// Every call to `consume` is one session. It opens when partitions are
/// assigned and lasts until the next rebalance or until it is cancelled or closed.
pub struct RdKafkaGroupClient {
    consumer: Arc<GroupConsumer>,
    group: GroupIdentity,
    subscribed: Mutex<Option<TopicSet>>,
    closed: CancellationToken,
    claim_buffer: usize,
    slow_claim_after: Duration,
}

impl RdKafkaGroupClient {
    /// Create the consumer. The group is joined on the first `consume` call.
    pub fn connect(
        brokers: &BrokerAddressSet,
        group: &GroupIdentity,
        config: &ConsumerConfig,
    ) -> Result<Self> {
        let (generation, _) = watch::channel(0);
        let consumer: GroupConsumer = config
            .build_client_config(brokers, group)?
            .create_with_context(GroupContext { generation })
            .map_err(BrokerError::from)
            .annotate("create consumer group client")?;

        info!(brokers = %brokers, group = %group, "Created consumer group client");

        Ok(Self {
            consumer: Arc::new(consumer),
            group: group.clone(),
            subscribed: Mutex::new(None),
            closed: CancellationToken::new(),
            claim_buffer: config.claim_buffer,
            slow_claim_after: config.max_processing_time(),
        })
    }

    fn ensure_subscribed(&self, topics: &TopicSet) -> std::result::Result<(), BrokerError> {
        let mut subscribed = self.subscribed.lock().unwrap_or_else(PoisonError::into_inner);
        if subscribed.as_ref() != Some(topics) {
            let names: Vec<&str> = topics.iter().collect();
            self.consumer.subscribe(&names)?;
            info!(topics = %topics, "Subscribed to topics");
            *subscribed = Some(topics.clone());
        }
        Ok(())
    }

    /// Copy the next message out of the consumer
    async fn next_record(&self) -> std::result::Result<Record, BrokerError> {
        let message = self.consumer.recv().await?;
        Ok(Record::from_message(&message))
    }

    fn has_assignment(&self) -> bool {
        self.consumer
            .assignment()
            .map(|assignment| assignment.count() > 0)
            .unwrap_or(false)
    }

    fn session_info(&self, generation: u64) -> SessionInfo {
        let mut claims: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        match self.consumer.assignment() {
            Ok(assignment) => {
                for element in assignment.elements() {
                    claims
                        .entry(element.topic().to_string())
                        .or_default()
                        .push(element.partition());
                }
            },
            Err(e) => warn!(error = %e, "Failed to read partition assignment"),
        }

        SessionInfo {
            group_id: self.group.to_string(),
            generation,
            claims,
        }
    }
}

#[async_trait]
impl GroupClient for RdKafkaGroupClient {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &TopicSet,
        handler: Arc<dyn GroupHandler>,
    ) -> std::result::Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::GroupClosed);
        }
        self.ensure_subscribed(topics)?;

        let mut generation = self.consumer.context().generation.subscribe();

        // Joining happens while polling. The session opens once partitions
        // are assigned, or earlier if a record shows up first.
        let mut first = None;
        while !self.has_assignment() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.closed.cancelled() => return Err(BrokerError::GroupClosed),
                changed = generation.changed() => {
                    if changed.is_err() {
                        return Err(BrokerError::GroupClosed);
                    }
                },
                received = self.next_record() => {
                    first = Some(received?);
                    break;
                },
            }
        }

        let info = self.session_info(*generation.borrow_and_update());
        info!(session = %info, "Consumer group session started");

        let session_cancel = cancel.child_token();
        let session = Arc::new(RdKafkaSession {
            info,
            consumer: Arc::clone(&self.consumer),
            cancel: session_cancel.clone(),
        });

        handler
            .setup(session.as_ref())
            .await
            .map_err(BrokerError::handler)?;

        let mut dispatcher = ClaimDispatcher::new(
            Arc::clone(&handler),
            session.clone(),
            self.claim_buffer,
            self.slow_claim_after,
        );

        let mut outcome = match first {
            Some(record) => dispatcher.dispatch(record).await,
            None => Ok(()),
        };
        while outcome.is_ok() {
            tokio::select! {
                _ = session_cancel.cancelled() => break,
                _ = self.closed.cancelled() => outcome = Err(BrokerError::GroupClosed),
                _ = generation.changed() => {
                    info!("Group rebalanced, ending session");
                    break;
                },
                Some(finished) = dispatcher.next_finished() => {
                    // A claim ending on its own ends the session
                    outcome = finished;
                    break;
                },
                received = self.next_record() => {
                    outcome = match received {
                        Ok(record) => dispatcher.dispatch(record).await,
                        Err(e) => Err(e),
                    };
                },
            }
        }

        session_cancel.cancel();
        let drained = dispatcher.finish().await;
        let cleaned = handler
            .cleanup(session.as_ref())
            .await
            .map_err(BrokerError::handler);

        debug!(session = %session.info, ok = outcome.is_ok(), "Consumer group session ended");
        outcome.and(drained).and(cleaned)
    }

    async fn close(&self) -> std::result::Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        let committed = match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(BrokerError::from(e)),
        };
        self.consumer.unsubscribe();

        info!(group = %self.group, "Closed consumer group client");
        committed
    }
}

/// Session handed to the group handler by [`RdKafkaGroupClient`]
struct RdKafkaSession {
    info: SessionInfo,
    consumer: Arc<GroupConsumer>,
    cancel: CancellationToken,
}

impl GroupSession for RdKafkaSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    fn mark_record(&self, record: &Record) {
        // The committed offset is the next one to read
        if let Err(e) = self
            .consumer
            .store_offset(&record.topic, record.partition, record.offset + 1)
        {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to store offset"
            );
        }
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

fn create_producer(brokers: &BrokerAddressSet, config: &ProducerConfig) -> Result<FutureProducer> {
    config
        .build_client_config(brokers)?
        .create()
        .map_err(BrokerError::from)
        .annotate("create producer")
}

async fn flush(producer: &FutureProducer, timeout: Duration) -> std::result::Result<(), BrokerError> {
    let producer = producer.clone();
    tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
        .await
        .map_err(|e| BrokerError::Transport(format!("flush task failed: {}", e)))?
        .map_err(BrokerError::from)
}

/// Publisher that awaits every delivery report
pub struct RdKafkaSyncPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl RdKafkaSyncPublisher {
    pub fn new(brokers: &BrokerAddressSet, config: &ProducerConfig) -> Result<Self> {
        Ok(Self {
            producer: create_producer(brokers, config)?,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl SyncPublisher for RdKafkaSyncPublisher {
    async fn send(&self, envelope: Envelope) -> std::result::Result<Delivery, BrokerError> {
        let mut record: FutureRecord<'_, Vec<u8>, Vec<u8>> =
            FutureRecord::to(&envelope.topic).payload(&envelope.value);
        if let Some(key) = envelope.key.as_ref() {
            record = record.key(key);
        }

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => Ok(Delivery {
                topic: envelope.topic.clone(),
                partition,
                offset,
            }),
            Err((e, _)) => Err(e.into()),
        }
    }

    async fn close(&self) -> std::result::Result<(), BrokerError> {
        flush(&self.producer, self.timeout).await
    }
}

/// Publisher with a bounded input queue and unbounded result queues.
///
/// A pump task takes envelopes off the input queue, submits them and
/// forwards every delivery report, in completion order.
pub struct RdKafkaAsyncPublisher {
    producer: FutureProducer,
    timeout: Duration,
    input: RwLock<Option<mpsc::Sender<Envelope>>>,
    results: Mutex<Option<DeliveryResults>>,
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RdKafkaAsyncPublisher {
    /// Create the publisher and start its pump. Must be called within a
    /// Tokio runtime.
    pub fn new(brokers: &BrokerAddressSet, config: &ProducerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::internal(format!("async producer needs a runtime: {}", e)))?;
        let producer = create_producer(brokers, config)?;

        let (input_tx, input_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (success_tx, successes) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();

        let pump = runtime.spawn(
            pump_deliveries(producer.clone(), input_rx, success_tx, error_tx)
                .with_current_subscriber(),
        );

        Ok(Self {
            producer,
            timeout: config.timeout(),
            input: RwLock::new(Some(input_tx)),
            results: Mutex::new(Some(DeliveryResults { successes, errors })),
            pump: tokio::sync::Mutex::new(Some(pump)),
        })
    }
}

type InFlight = BoxFuture<'static, (Envelope, std::result::Result<OwnedDeliveryResult, Canceled>)>;

async fn pump_deliveries(
    producer: FutureProducer,
    mut input: mpsc::Receiver<Envelope>,
    successes: mpsc::UnboundedSender<Delivery>,
    errors: mpsc::UnboundedSender<DeliveryFailure>,
) {
    let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();
    let mut input_open = true;

    while input_open || !in_flight.is_empty() {
        tokio::select! {
            received = input.recv(), if input_open => {
                let Some(envelope) = received else {
                    input_open = false;
                    continue;
                };

                let mut record: FutureRecord<'_, Vec<u8>, Vec<u8>> =
                    FutureRecord::to(&envelope.topic).payload(&envelope.value);
                if let Some(key) = envelope.key.as_ref() {
                    record = record.key(key);
                }

                match producer.send_result(record).map_err(|(e, _)| e) {
                    Ok(delivery) => in_flight.push(Box::pin(async move { (envelope, delivery.await) })),
                    Err(e) => {
                        let _ = errors.send(DeliveryFailure { envelope, error: e.into() });
                    },
                }
            },
            Some((envelope, report)) = in_flight.next() => {
                match report {
                    Ok(Ok((partition, offset))) => {
                        let _ = successes.send(Delivery {
                            topic: envelope.topic,
                            partition,
                            offset,
                        });
                    },
                    Ok(Err((e, _))) => {
                        let _ = errors.send(DeliveryFailure { envelope, error: e.into() });
                    },
                    Err(_) => {
                        let _ = errors.send(DeliveryFailure {
                            envelope,
                            error: BrokerError::Transport("delivery report dropped".to_string()),
                        });
                    },
                }
            },
        }
    }

    debug!("Delivery pump stopped");
}

#[async_trait]
impl AsyncPublisher for RdKafkaAsyncPublisher {
    async fn enqueue(&self, envelope: Envelope) -> std::result::Result<(), BrokerError> {
        let sender = self
            .input
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::PublisherClosed)?;

        sender
            .send(envelope)
            .await
            .map_err(|_| BrokerError::PublisherClosed)
    }

    fn take_results(&self) -> Option<DeliveryResults> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    async fn close(&self) -> std::result::Result<(), BrokerError> {
        let input = self.input.write().unwrap_or_else(PoisonError::into_inner).take();
        drop(input);

        let pump = self.pump.lock().await.take();
        if let Some(pump) = pump {
            pump.await
                .map_err(|e| BrokerError::Transport(format!("delivery pump failed: {}", e)))?;
        }

        flush(&self.producer, self.timeout).await
    }
}
