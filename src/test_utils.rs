//! Test utilities for StreamRelay
//!
//! This module provides in-memory broker doubles and helpers for testing the
//! consumer runner and the producer without a running broker.

use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::kafka::{
    AsyncPublisher, BrokerError, ClaimDispatcher, Delivery, DeliveryFailure, DeliveryResults,
    Envelope, GroupClient, GroupHandler, GroupSession, PartitionClaim, Record, SessionInfo,
    SyncPublisher, TopicSet,
};

/// Build a record with a small payload derived from its position
pub fn record(topic: &str, partition: i32, offset: i64) -> Record {
    Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: Some(format!("key-{}", offset).into_bytes()),
        value: Some(format!("value-{}-{}", partition, offset).into_bytes()),
        timestamp: None,
    }
}

/// Build `count` records spread round-robin over `partitions`
pub fn records(topic: &str, partitions: i32, count: i64) -> Vec<Record> {
    (0..count)
        .map(|offset| record(topic, (offset % i64::from(partitions)) as i32, offset))
        .collect()
}

/// Session double that remembers every marked record
pub struct MockSession {
    info: SessionInfo,
    marked: Mutex<Vec<(String, i32, i64)>>,
    cancel: CancellationToken,
}

impl MockSession {
    pub fn new(group: &str, generation: u64) -> Self {
        Self::with_cancel(group, generation, BTreeMap::new(), CancellationToken::new())
    }

    pub fn with_cancel(
        group: &str,
        generation: u64,
        claims: BTreeMap<String, Vec<i32>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            info: SessionInfo {
                group_id: group.to_string(),
                generation,
                claims,
            },
            marked: Mutex::new(Vec::new()),
            cancel,
        }
    }

    /// Marked (topic, partition, offset) triples in marking order
    pub fn marked(&self) -> Vec<(String, i32, i64)> {
        self.marked.lock().unwrap().clone()
    }
}

impl GroupSession for MockSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    fn mark_record(&self, record: &Record) {
        self.marked
            .lock()
            .unwrap()
            .push((record.topic.clone(), record.partition, record.offset));
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One scripted outcome of [`MockGroupClient::consume`]
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Fail the call before joining
    Fail(BrokerError),
    /// Join, deliver the records, then end the session normally
    Session(Vec<Record>),
    /// Join and hold the session until cancellation or close
    Hold,
}

/// Consumer group double driven by a script of [`MockStep`]s.
///
/// Once the script runs out, every call repeats `fallback` (by default
/// [`MockStep::Hold`]).
pub struct MockGroupClient {
    group: String,
    script: Mutex<VecDeque<MockStep>>,
    fallback: MockStep,
    close_error: Option<BrokerError>,
    closed: CancellationToken,
    consume_calls: AtomicUsize,
    close_calls: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    generation: AtomicUsize,
}

impl Default for MockGroupClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGroupClient {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(steps: Vec<MockStep>) -> Self {
        Self {
            group: "test-group".to_string(),
            script: Mutex::new(steps.into()),
            fallback: MockStep::Hold,
            close_error: None,
            closed: CancellationToken::new(),
            consume_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            generation: AtomicUsize::new(0),
        }
    }

    /// A client whose every consume call fails with `error`
    pub fn failing(error: BrokerError) -> Self {
        let mut client = Self::new();
        client.fallback = MockStep::Fail(error);
        client
    }

    /// Make `close` report `error`
    pub fn with_close_error(mut self, error: BrokerError) -> Self {
        self.close_error = Some(error);
        self
    }

    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// When each consume call started
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    async fn run_session(
        &self,
        cancel: &CancellationToken,
        handler: Arc<dyn GroupHandler>,
        records: Vec<Record>,
        hold: bool,
    ) -> Result<(), BrokerError> {
        let mut claims: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for record in &records {
            let partitions = claims.entry(record.topic.clone()).or_default();
            if !partitions.contains(&record.partition) {
                partitions.push(record.partition);
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let session_cancel = cancel.child_token();
        let session = Arc::new(MockSession::with_cancel(
            &self.group,
            generation,
            claims,
            session_cancel.clone(),
        ));

        handler
            .setup(session.as_ref())
            .await
            .map_err(BrokerError::handler)?;

        let mut dispatcher = ClaimDispatcher::new(
            Arc::clone(&handler),
            session.clone(),
            16,
            Duration::from_secs(1),
        );

        let mut outcome = Ok(());
        for record in records {
            outcome = dispatcher.dispatch(record).await;
            if outcome.is_err() {
                break;
            }
        }

        if outcome.is_ok() && hold {
            tokio::select! {
                _ = session_cancel.cancelled() => {},
                _ = self.closed.cancelled() => outcome = Err(BrokerError::GroupClosed),
                Some(finished) = dispatcher.next_finished() => outcome = finished,
            }
        }

        session_cancel.cancel();
        let drained = dispatcher.finish().await;
        let cleaned = handler
            .cleanup(session.as_ref())
            .await
            .map_err(BrokerError::handler);
        outcome.and(drained).and(cleaned)
    }
}

#[async_trait]
impl GroupClient for MockGroupClient {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        _topics: &TopicSet,
        handler: Arc<dyn GroupHandler>,
    ) -> Result<(), BrokerError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());

        if self.closed.is_cancelled() {
            return Err(BrokerError::GroupClosed);
        }

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            MockStep::Fail(error) => Err(error),
            MockStep::Session(records) => self.run_session(cancel, handler, records, false).await,
            MockStep::Hold => self.run_session(cancel, handler, Vec::new(), true).await,
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        match &self.close_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Handler that records what it processed and marks every record
#[derive(Default)]
pub struct RecordingHandler {
    processed: Mutex<Vec<Record>>,
    fail_on_offset: Option<i64>,
    delay: Duration,
    active: Mutex<HashMap<(String, i32), usize>>,
    max_concurrent: AtomicUsize,
    setups: AtomicUsize,
    cleanups: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the claim when the record at `offset` arrives
    pub fn fail_on_offset(mut self, offset: i64) -> Self {
        self.fail_on_offset = Some(offset);
        self
    }

    /// Spend `delay` on every record
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn processed(&self) -> Vec<Record> {
        self.processed.lock().unwrap().clone()
    }

    /// Offsets processed for one partition, in processing order
    pub fn offsets_for(&self, topic: &str, partition: i32) -> Vec<i64> {
        self.processed
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.topic == topic && r.partition == partition)
            .map(|r| r.offset)
            .collect()
    }

    /// Highest number of records of one claim ever handled at the same time
    pub fn max_concurrent_per_claim(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    fn enter(&self, key: &(String, i32)) {
        let mut active = self.active.lock().unwrap();
        let count = active.entry(key.clone()).or_default();
        *count += 1;
        self.max_concurrent.fetch_max(*count, Ordering::SeqCst);
    }

    fn exit(&self, key: &(String, i32)) {
        if let Some(count) = self.active.lock().unwrap().get_mut(key) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl GroupHandler for RecordingHandler {
    async fn setup(&self, _session: &dyn GroupSession) -> anyhow::Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self, _session: &dyn GroupSession) -> anyhow::Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn PartitionClaim,
    ) -> anyhow::Result<()> {
        let key = (claim.topic().to_string(), claim.partition());

        while let Some(record) = claim.next_record().await {
            if self.fail_on_offset == Some(record.offset) {
                return Err(anyhow!(
                    "cannot process {}/{} at offset {}",
                    record.topic,
                    record.partition,
                    record.offset
                ));
            }

            self.enter(&key);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            session.mark_record(&record);
            self.processed.lock().unwrap().push(record);
            self.exit(&key);
        }
        Ok(())
    }
}

/// Synchronous publisher double
#[derive(Default)]
pub struct MockSyncPublisher {
    delay: Duration,
    fail_with: Option<BrokerError>,
    close_error: Option<BrokerError>,
    send_calls: AtomicUsize,
    close_calls: AtomicUsize,
    completed: Mutex<Vec<Envelope>>,
    next_offset: AtomicI64,
}

impl MockSyncPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `delay` to acknowledge every send
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject every send with `error`
    pub fn failing(mut self, error: BrokerError) -> Self {
        self.fail_with = Some(error);
        self
    }

    /// Make `close` report `error`
    pub fn with_close_error(mut self, error: BrokerError) -> Self {
        self.close_error = Some(error);
        self
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Envelopes whose send ran to completion
    pub fn completed(&self) -> Vec<Envelope> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncPublisher for MockSyncPublisher {
    async fn send(&self, envelope: Envelope) -> Result<Delivery, BrokerError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.completed.lock().unwrap().push(envelope.clone());
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }

        Ok(Delivery {
            topic: envelope.topic,
            partition: 0,
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        match &self.close_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

struct ResultSenders {
    successes: mpsc::UnboundedSender<Delivery>,
    errors: mpsc::UnboundedSender<DeliveryFailure>,
}

/// Asynchronous publisher double that reports every enqueued envelope right
/// away. Every `fail_every`-th envelope is reported as failed.
pub struct MockAsyncPublisher {
    senders: Mutex<Option<ResultSenders>>,
    results: Mutex<Option<DeliveryResults>>,
    fail_every: Option<usize>,
    close_error: Option<BrokerError>,
    closed: AtomicBool,
    enqueue_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl Default for MockAsyncPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAsyncPublisher {
    pub fn new() -> Self {
        let (success_tx, successes) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        Self {
            senders: Mutex::new(Some(ResultSenders {
                successes: success_tx,
                errors: error_tx,
            })),
            results: Mutex::new(Some(DeliveryResults { successes, errors })),
            fail_every: None,
            close_error: None,
            closed: AtomicBool::new(false),
            enqueue_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// Make `close` report `error`
    pub fn with_close_error(mut self, error: BrokerError) -> Self {
        self.close_error = Some(error);
        self
    }

    pub fn enqueue_calls(&self) -> usize {
        self.enqueue_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsyncPublisher for MockAsyncPublisher {
    async fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::PublisherClosed);
        }
        let n = self.enqueue_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let senders = self.senders.lock().unwrap();
        let senders = senders.as_ref().ok_or(BrokerError::PublisherClosed)?;
        if self.fail_every.is_some_and(|every| n % every == 0) {
            let _ = senders.errors.send(DeliveryFailure {
                envelope,
                error: BrokerError::Transport("message rejected".to_string()),
            });
        } else {
            let _ = senders.successes.send(Delivery {
                topic: envelope.topic,
                partition: 0,
                offset: n as i64 - 1,
            });
        }
        Ok(())
    }

    fn take_results(&self) -> Option<DeliveryResults> {
        self.results.lock().unwrap().take()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.senders.lock().unwrap().take();
        match &self.close_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_round_robin() {
        let records = records("orders", 3, 7);
        assert_eq!(records.len(), 7);
        assert_eq!(records[4].partition, 1);
        assert_eq!(records[4].offset, 4);
    }

    #[tokio::test]
    async fn test_mock_async_publisher_reports_outcomes() {
        let publisher = MockAsyncPublisher::new().failing_every(2);
        let mut results = publisher.take_results().unwrap();
        assert!(publisher.take_results().is_none());

        for i in 0..4 {
            publisher
                .enqueue(Envelope::new("orders", Vec::new(), format!("m{}", i)))
                .await
                .unwrap();
        }
        publisher.close().await.unwrap();

        let mut ok = 0;
        while results.successes.recv().await.is_some() {
            ok += 1;
        }
        let mut failed = 0;
        while results.errors.recv().await.is_some() {
            failed += 1;
        }
        assert_eq!((ok, failed), (2, 2));

        let err = publisher
            .enqueue(Envelope::new("orders", Vec::new(), "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PublisherClosed));
    }
}
