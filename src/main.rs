//! StreamRelay - a resilient Kafka consumer group runner
//!
//! This application joins the configured consumer group, logs every record
//! it is handed and marks it as processed, until it receives CTRL+C or
//! SIGTERM.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use streamrelay::kafka::{ConsumerRunner, GroupHandler, GroupSession, PartitionClaim};
use streamrelay::{logging, Config, Result};

/// Handler that logs every record of a claim
struct LoggingHandler;

#[async_trait]
impl GroupHandler for LoggingHandler {
    async fn setup(&self, session: &dyn GroupSession) -> anyhow::Result<()> {
        info!(session = %session.info(), "Session set up");
        Ok(())
    }

    async fn cleanup(&self, session: &dyn GroupSession) -> anyhow::Result<()> {
        info!(session = %session.info(), "Session cleaned up");
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn PartitionClaim,
    ) -> anyhow::Result<()> {
        while let Some(record) = claim.next_record().await {
            info!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                key = %String::from_utf8_lossy(record.key.as_deref().unwrap_or_default()),
                value = %String::from_utf8_lossy(record.value.as_deref().unwrap_or_default()),
                timestamp = ?record.timestamp,
                "Message claimed"
            );
            session.mark_record(&record);
        }
        Ok(())
    }
}

/// Shutdown signal handler
///
/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C, stopping consumer");
        },
        _ = terminate => {
            info!("Received SIGTERM, stopping consumer");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env()?;

    // Validate configuration
    config.validate()?;

    // Initialize logging/tracing
    logging::init_tracing(&config.logging.log_level, &config.logging.environment)?;

    config.log_config();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting StreamRelay");

    let runner = ConsumerRunner::new(config.consumer.clone(), Arc::new(LoggingHandler))?;

    let interrupted = tokio::select! {
        started = runner.start() => {
            started?;
            false
        },
        _ = shutdown_signal() => true,
    };

    if !interrupted {
        info!(group = %config.consumer.group_id, "Consumer group attached");
        shutdown_signal().await;
    }

    runner.stop().await?;

    info!("StreamRelay shutdown complete");
    Ok(())
}
