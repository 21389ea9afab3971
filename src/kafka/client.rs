//! Broker collaborator contracts
//!
//! The runner and the producer drive the broker only through these traits.
//! `rdkafka_client` implements them on top of librdkafka; tests use the
//! in-memory doubles from `test_utils`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn, Instrument};

use super::{BrokerError, Delivery, DeliveryFailure, Envelope, Record, SessionInfo, TopicSet};

/// Caller-supplied record processing for a consumer group.
///
/// `consume_claim` is invoked once per partition claim. It must process the
/// claim's records in delivery order (no fan-out to concurrent tasks) and
/// mark each processed record through the session before returning.
#[async_trait]
pub trait GroupHandler: Send + Sync {
    /// Called once a session is established, before any claim is consumed
    async fn setup(&self, _session: &dyn GroupSession) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after every claim of the session has finished
    async fn cleanup(&self, _session: &dyn GroupSession) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process the records of one partition claim
    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn PartitionClaim,
    ) -> anyhow::Result<()>;
}

/// One generation of group membership
pub trait GroupSession: Send + Sync {
    fn info(&self) -> &SessionInfo;

    /// Mark a record as processed so its offset is committed
    fn mark_record(&self, record: &Record);

    /// Cancelled when the session ends (rebalance, stop, or failure)
    fn cancellation(&self) -> &CancellationToken;
}

/// Ownership of one topic-partition for the duration of a session
#[async_trait]
pub trait PartitionClaim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Offset of the first record delivered to this claim
    fn initial_offset(&self) -> i64;

    /// Next record in delivery order, `None` once the claim is revoked
    async fn next_record(&mut self) -> Option<Record>;
}

/// Consumer group client
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Join the group and run one session, blocking until it ends.
    ///
    /// Returns `Ok(())` when the session ended normally (rebalance or
    /// cancellation) and must then be called again to rejoin. Returns
    /// [`BrokerError::GroupClosed`] once the client has been closed.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &TopicSet,
        handler: Arc<dyn GroupHandler>,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Publisher that waits for the broker acknowledgement of every message
#[async_trait]
pub trait SyncPublisher: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<Delivery, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Result queues of an [`AsyncPublisher`]. Both close once the publisher
/// is closed and every in-flight message has been reported.
#[derive(Debug)]
pub struct DeliveryResults {
    pub successes: mpsc::UnboundedReceiver<Delivery>,
    pub errors: mpsc::UnboundedReceiver<DeliveryFailure>,
}

/// Publisher that accepts messages into an input queue and reports
/// outcomes on [`DeliveryResults`]
#[async_trait]
pub trait AsyncPublisher: Send + Sync {
    /// Enqueue a message without waiting for its acknowledgement
    async fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError>;

    /// Hand out the result queues. Returns `None` after the first call.
    fn take_results(&self) -> Option<DeliveryResults>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A partition claim fed through a bounded channel
pub struct ChannelClaim {
    topic: String,
    partition: i32,
    initial_offset: i64,
    records: mpsc::Receiver<Record>,
}

impl ChannelClaim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: i64,
        records: mpsc::Receiver<Record>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            initial_offset,
            records,
        }
    }
}

#[async_trait]
impl PartitionClaim for ChannelClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    async fn next_record(&mut self) -> Option<Record> {
        self.records.recv().await
    }
}

type ClaimKey = (String, i32);

/// Routes records of a session to one worker per partition claim.
///
/// Each claim gets a single task running [`GroupHandler::consume_claim`], so
/// records of one partition are handled strictly in the order they were
/// dispatched.
pub struct ClaimDispatcher {
    handler: Arc<dyn GroupHandler>,
    session: Arc<dyn GroupSession>,
    buffer: usize,
    slow_claim_after: Duration,
    claims: HashMap<ClaimKey, mpsc::Sender<Record>>,
    workers: JoinSet<(ClaimKey, Result<(), BrokerError>)>,
}

impl ClaimDispatcher {
    pub fn new(
        handler: Arc<dyn GroupHandler>,
        session: Arc<dyn GroupSession>,
        buffer: usize,
        slow_claim_after: Duration,
    ) -> Self {
        Self {
            handler,
            session,
            buffer: buffer.max(1),
            slow_claim_after,
            claims: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    /// Number of claims opened so far in this session
    pub fn claims(&self) -> usize {
        self.claims.len()
    }

    /// Hand a record to the worker owning its partition, opening the claim on
    /// first sight. Waits while the claim's buffer is full.
    pub async fn dispatch(&mut self, record: Record) -> Result<(), BrokerError> {
        let key = (record.topic.clone(), record.partition);
        let sender = match self.claims.get(&key) {
            Some(sender) => sender.clone(),
            None => self.open_claim(key.clone(), record.offset),
        };

        let permit = loop {
            tokio::select! {
                _ = self.session.cancellation().cancelled() => return Ok(()),
                reserved = tokio::time::timeout(self.slow_claim_after, sender.reserve()) => {
                    match reserved {
                        Ok(Ok(permit)) => break permit,
                        Ok(Err(_)) => {
                            return Err(BrokerError::Handler(format!(
                                "claim {}/{} stopped accepting records",
                                key.0, key.1
                            )));
                        },
                        Err(_) => warn!(
                            topic = %key.0,
                            partition = key.1,
                            "Partition claim is slow to accept records"
                        ),
                    }
                }
            }
        };

        permit.send(record);
        Ok(())
    }

    fn open_claim(&mut self, key: ClaimKey, initial_offset: i64) -> mpsc::Sender<Record> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut claim = ChannelClaim::new(key.0.clone(), key.1, initial_offset, rx);
        let handler = Arc::clone(&self.handler);
        let session = Arc::clone(&self.session);
        let span = crate::claim_span!(key.0.as_str(), key.1);

        debug!(topic = %key.0, partition = key.1, initial_offset, "Opening partition claim");

        let worker_key = key.clone();
        self.workers.spawn(
            async move {
                let result = handler
                    .consume_claim(session.as_ref(), &mut claim)
                    .await
                    .map_err(BrokerError::handler);
                (worker_key, result)
            }
            .instrument(span)
            .with_current_subscriber(),
        );

        self.claims.insert(key, tx.clone());
        tx
    }

    /// Wait for the next claim worker to finish. Resolves to `None` when no
    /// worker is running.
    pub async fn next_finished(&mut self) -> Option<Result<(), BrokerError>> {
        let joined = self.workers.join_next().await?;
        Some(match joined {
            Ok(((topic, partition), result)) => {
                debug!(%topic, partition, ok = result.is_ok(), "Partition claim finished");
                result
            },
            Err(e) => Err(BrokerError::Handler(format!("claim worker failed: {}", e))),
        })
    }

    /// Close every claim and wait for the workers to drain. Returns the first
    /// worker error.
    pub async fn finish(mut self) -> Result<(), BrokerError> {
        self.claims.clear();

        let mut outcome = Ok(());
        while let Some(result) = self.next_finished().await {
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{record, MockSession, RecordingHandler};

    #[tokio::test]
    async fn test_dispatcher_keeps_partition_order() {
        let handler = Arc::new(RecordingHandler::new());
        let session = Arc::new(MockSession::new("billing", 1));
        let mut dispatcher =
            ClaimDispatcher::new(handler.clone(), session.clone(), 2, Duration::from_secs(1));

        for offset in 0..20 {
            dispatcher.dispatch(record("orders", (offset % 2) as i32, offset)).await.unwrap();
        }
        assert_eq!(dispatcher.claims(), 2);
        dispatcher.finish().await.unwrap();

        for partition in 0..2 {
            let offsets = handler.offsets_for("orders", partition);
            assert_eq!(offsets.len(), 10);
            assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(session.marked().len(), 20);
        assert_eq!(handler.max_concurrent_per_claim(), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_reports_handler_error() {
        let handler = Arc::new(RecordingHandler::new().fail_on_offset(3));
        let session = Arc::new(MockSession::new("billing", 1));
        let mut dispatcher =
            ClaimDispatcher::new(handler.clone(), session, 8, Duration::from_secs(1));

        for offset in 0..5 {
            // Dispatching past the failed record may already see the claim gone
            let _ = dispatcher.dispatch(record("orders", 0, offset)).await;
        }

        let finished = dispatcher.next_finished().await.unwrap();
        assert!(matches!(finished, Err(BrokerError::Handler(_))));
        assert_eq!(handler.offsets_for("orders", 0), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_dispatch_after_session_cancel_is_dropped() {
        let handler = Arc::new(RecordingHandler::new());
        let session = Arc::new(MockSession::new("billing", 1));
        let mut dispatcher =
            ClaimDispatcher::new(handler.clone(), session.clone(), 1, Duration::from_millis(10));

        session.cancellation().cancel();
        dispatcher.dispatch(record("orders", 0, 0)).await.unwrap();
        dispatcher.finish().await.unwrap();
    }
}
