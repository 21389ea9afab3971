//! Consumer group runner with capped exponential retry and single-shot shutdown

use async_trait::async_trait;
use backoff::backoff::Backoff;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn, Dispatch, Instrument};

use super::client::{GroupClient, GroupHandler, GroupSession, PartitionClaim};
use super::{
    BrokerAddressSet, BrokerError, ConsumerConfig, GroupIdentity, RdKafkaGroupClient, RetryPolicy,
    TopicSet,
};
use crate::error::{Annotate, Error, Result};
use crate::logging::{current_dispatch, Timer};

/// Lifecycle of a [`ConsumerRunner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Built, `start` not called yet
    Created,
    /// Joining the consumer group
    Attaching,
    /// Session set up, no claim consumed yet
    Ready,
    /// Claims are being consumed
    Running,
    /// Waiting out a backoff delay
    Retrying,
    Stopped,
    /// Gave up after the configured number of exhausted retry rounds
    Failed,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerState::Stopped | RunnerState::Failed)
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerState::Created => "created",
            RunnerState::Attaching => "attaching",
            RunnerState::Ready => "ready",
            RunnerState::Running => "running",
            RunnerState::Retrying => "retrying",
            RunnerState::Stopped => "stopped",
            RunnerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the runner published to `start` and status readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerStatus {
    pub state: RunnerState,
    /// Successful group attachments since the runner was built
    pub attachments: u64,
}

type StatusSender = Arc<watch::Sender<RunnerStatus>>;

fn set_state(status: &StatusSender, state: RunnerState) {
    status.send_if_modified(|current| {
        if current.state.is_terminal() || current.state == state {
            return false;
        }
        current.state = state;
        true
    });
}

/// Wraps the caller's handler so that session setup releases readiness
struct ReadinessHandler {
    inner: Arc<dyn GroupHandler>,
    status: StatusSender,
}

#[async_trait]
impl GroupHandler for ReadinessHandler {
    async fn setup(&self, session: &dyn GroupSession) -> anyhow::Result<()> {
        self.inner.setup(session).await?;

        self.status.send_modify(|status| {
            status.attachments += 1;
            if !status.state.is_terminal() {
                status.state = RunnerState::Ready;
            }
        });
        info!(session = %session.info(), "Consumer group session ready");
        Ok(())
    }

    async fn cleanup(&self, session: &dyn GroupSession) -> anyhow::Result<()> {
        self.inner.cleanup(session).await
    }

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn PartitionClaim,
    ) -> anyhow::Result<()> {
        self.status.send_if_modified(|status| {
            if status.state != RunnerState::Ready {
                return false;
            }
            status.state = RunnerState::Running;
            true
        });
        self.inner.consume_claim(session, claim).await
    }
}

/// State shared between the runner handle and its background loop
struct Shared {
    client: Arc<dyn GroupClient>,
    handler: Arc<dyn GroupHandler>,
    group: GroupIdentity,
    topics: TopicSet,
    policy: RetryPolicy,
    max_exhaustion_rounds: u32,
    cancel: CancellationToken,
    status: StatusSender,
}

impl Shared {
    fn attachments(&self) -> u64 {
        self.status.borrow().attachments
    }

    async fn run(self: Arc<Self>) {
        info!("Consumer runner started");
        let mut failed_rounds: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let attachments = self.attachments();
            match self.consume_with_retry().await {
                Ok(()) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    failed_rounds = 0;
                    set_state(&self.status, RunnerState::Attaching);
                },
                Err(e) if e.is_group_closed() || e.is_canceled() => {
                    info!(reason = %e, "Consumer loop exiting");
                    break;
                },
                Err(e) => {
                    if self.attachments() != attachments {
                        failed_rounds = 0;
                    }
                    failed_rounds += 1;

                    let e = e.annotate("consumer retry failed");
                    error!(error = %e, round = failed_rounds, "Consumer retries exhausted");

                    if self.max_exhaustion_rounds > 0 && failed_rounds >= self.max_exhaustion_rounds
                    {
                        error!(
                            rounds = failed_rounds,
                            "Consumer runner giving up after exhausted retry rounds"
                        );
                        set_state(&self.status, RunnerState::Failed);
                        return;
                    }
                    set_state(&self.status, RunnerState::Attaching);
                    // Without a backoff wait a new round could start without yielding
                    tokio::task::yield_now().await;
                },
            }
        }

        set_state(&self.status, RunnerState::Stopped);
        info!("Consumer runner stopped");
    }

    /// One attach round: consume, retrying failures per the policy until a
    /// session ends normally or the retries run out
    async fn consume_with_retry(&self) -> Result<()> {
        let mut backoff = self.policy.backoff();

        loop {
            let attachments = self.attachments();
            let err = match self
                .client
                .consume(&self.cancel, &self.topics, Arc::clone(&self.handler))
                .await
            {
                Ok(()) => return Ok(()),
                Err(BrokerError::GroupClosed) => return Err(BrokerError::GroupClosed.into()),
                Err(e) => Error::from(e),
            };

            // A session that got attached counts as progress
            if self.attachments() != attachments {
                backoff.reset();
            }

            let Some(delay) = backoff.next_backoff() else {
                return Err(err.annotate("max retries reached"));
            };

            set_state(&self.status, RunnerState::Retrying);
            warn!(
                error = %err,
                attempt = backoff.attempts(),
                max_retries = self.policy.max_retries(),
                delay_ms = delay.as_millis() as u64,
                "Consume failed, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Canceled.annotate("waiting to retry consume"));
                },
                _ = tokio::time::sleep(delay) => {},
            }
            set_state(&self.status, RunnerState::Attaching);
        }
    }
}

/// Builder for [`ConsumerRunner`]
pub struct ConsumerRunnerBuilder {
    config: ConsumerConfig,
    handler: Option<Arc<dyn GroupHandler>>,
    client: Option<Arc<dyn GroupClient>>,
    dispatch: Option<Dispatch>,
}

impl ConsumerRunnerBuilder {
    /// Handler invoked for every session and partition claim
    pub fn handler(mut self, handler: Arc<dyn GroupHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Use this group client instead of connecting through librdkafka
    pub fn client(mut self, client: Arc<dyn GroupClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Log through this dispatcher instead of the one current at build time
    pub fn log_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Validate the configuration and create the runner. Nothing runs until
    /// [`ConsumerRunner::start`].
    pub fn build(self) -> Result<ConsumerRunner> {
        let brokers = BrokerAddressSet::parse(&self.config.brokers)?;
        let group = GroupIdentity::new(self.config.group_id.clone())?;
        let topics = TopicSet::parse(&self.config.topics)?;
        let handler = self
            .handler
            .ok_or_else(|| Error::config("consumer handler is missing"))?;
        let policy = self.config.retry_policy()?;

        let client: Arc<dyn GroupClient> = match self.client {
            Some(client) => client,
            None => Arc::new(RdKafkaGroupClient::connect(&brokers, &group, &self.config)?),
        };

        let (status, _) = watch::channel(RunnerStatus {
            state: RunnerState::Created,
            attachments: 0,
        });
        let status = Arc::new(status);
        let handler: Arc<dyn GroupHandler> = Arc::new(ReadinessHandler {
            inner: handler,
            status: Arc::clone(&status),
        });

        Ok(ConsumerRunner {
            shared: Arc::new(Shared {
                client,
                handler,
                group,
                topics,
                policy,
                max_exhaustion_rounds: self.config.max_exhaustion_rounds,
                cancel: CancellationToken::new(),
                status,
            }),
            task: Mutex::new(None),
            stopped: OnceCell::new(),
            shutdown_timeout: self.config.shutdown_timeout(),
            dispatch: self.dispatch.unwrap_or_else(current_dispatch),
        })
    }
}

/// Runs one consumer-group consumption loop in the background.
///
/// The loop attaches to the group, hands every partition claim to the
/// handler and retries failures with capped exponential backoff. After
/// `max_retries` failed attempts the round is logged and a new round begins;
/// with `max_exhaustion_rounds` set the runner gives up after that many
/// consecutive failed rounds instead of retrying forever.
pub struct ConsumerRunner {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: OnceCell<std::result::Result<(), BrokerError>>,
    shutdown_timeout: Duration,
    dispatch: Dispatch,
}

impl ConsumerRunner {
    pub fn builder(config: ConsumerConfig) -> ConsumerRunnerBuilder {
        ConsumerRunnerBuilder {
            config,
            handler: None,
            client: None,
            dispatch: None,
        }
    }

    /// Build a runner connected through librdkafka
    pub fn new(config: ConsumerConfig, handler: Arc<dyn GroupHandler>) -> Result<Self> {
        Self::builder(config).handler(handler).build()
    }

    /// Start the background loop and wait until the group was attached once.
    ///
    /// Returns right away when the runner is already stopped. Returns
    /// [`Error::RetriesExhausted`] when the runner gave up before attaching.
    /// Calling `start` again only waits for the same readiness.
    pub async fn start(&self) -> Result<()> {
        self.spawn_once();

        let mut status = self.shared.status.subscribe();
        let status = *status
            .wait_for(|s| s.attachments > 0 || s.state.is_terminal())
            .await
            .map_err(|_| Error::internal("consumer runner status closed"))?;

        match status.state {
            RunnerState::Failed => Err(Error::RetriesExhausted {
                rounds: self.shared.max_exhaustion_rounds,
            }),
            _ => Ok(()),
        }
    }

    fn spawn_once(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.shared.cancel.is_cancelled() {
            return;
        }

        set_state(&self.shared.status, RunnerState::Attaching);
        let shared = Arc::clone(&self.shared);
        let span = crate::runner_span!(shared.group, shared.topics);
        *task = Some(tokio::spawn(
            async move { shared.run().instrument(span).await }.with_subscriber(self.dispatch.clone()),
        ));
    }

    /// Stop the loop and close the group client.
    ///
    /// Only the first call does the work; every call, concurrent or later,
    /// returns that call's result.
    pub async fn stop(&self) -> Result<()> {
        self.stopped
            .get_or_init(|| self.shutdown().with_subscriber(self.dispatch.clone()))
            .await
            .clone()
            .annotate("close consumer group")
    }

    async fn shutdown(&self) -> std::result::Result<(), BrokerError> {
        let timer = Timer::start("stop consumer runner");
        info!(group = %self.shared.group, "Stopping consumer runner");

        self.shared.cancel.cancel();
        let closed = self.shared.client.close().await;
        if let Err(e) = &closed {
            warn!(error = %e, "Failed to close consumer group client");
        }

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            match tokio::time::timeout(self.shutdown_timeout, task).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => error!(error = %e, "Consumer loop panicked"),
                Err(_) => warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Consumer loop did not exit within the shutdown timeout"
                ),
            }
        }

        self.shared.status.send_modify(|status| status.state = RunnerState::Stopped);
        timer.stop();
        closed
    }

    pub fn state(&self) -> RunnerState {
        self.shared.status.borrow().state
    }

    pub fn status(&self) -> RunnerStatus {
        *self.shared.status.borrow()
    }

    pub fn attachments(&self) -> u64 {
        self.shared.attachments()
    }

    /// Whether a session is currently attached
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), RunnerState::Ready | RunnerState::Running)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }
}

impl Drop for ConsumerRunner {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
