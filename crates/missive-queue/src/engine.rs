//! Queue engine: owns the delivery worker, the bulk expander and the lease
//! reaper, and supervises their background tasks.
//!
//! The three loops share one cancellation token and one stats handle.
//! `shutdown` cancels the token and waits, bounded by `shutdown_timeout`,
//! for every loop to finish its current unit of work.

use std::{sync::Arc, time::Duration};

use missive_core::{storage::Storage, Clock};
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::{ClientConfig, SenderClient},
    error::{DeliveryError, Result},
    expander::{BulkExpander, ExpansionReport},
    pacing::PacingSchedule,
    reaper::{LeaseReaper, ReapReport},
    retry::RetryPolicy,
    storage::{PostgresQueueStorage, QueueStorage},
    worker::{DeliveryReport, DeliveryWorker},
};

/// Configuration for the queue engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum messages claimed per delivery cycle.
    pub delivery_batch_size: usize,

    /// Delay between delivery cycles.
    pub delivery_poll_interval: Duration,

    /// Maximum envelopes in flight in the expander.
    pub bulk_batch_size: usize,

    /// Delay between expander ticks.
    pub bulk_poll_interval: Duration,

    /// Spacing of expanded messages.
    pub pacing: PacingSchedule,

    /// Fixed seed for pacing jitter; random per envelope when absent.
    pub pacing_seed: Option<u64>,

    /// Age after which a claim is considered abandoned.
    pub lease_timeout: Duration,

    /// Delay between lease reaper passes.
    pub reap_interval: Duration,

    /// Sender API client configuration.
    pub client_config: ClientConfig,

    /// Retry policy for failed deliveries.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for the loops to stop.
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            delivery_batch_size: crate::DEFAULT_DELIVERY_BATCH_SIZE,
            delivery_poll_interval: Duration::from_secs(5),
            bulk_batch_size: crate::DEFAULT_BULK_BATCH_SIZE,
            bulk_poll_interval: Duration::from_secs(10),
            pacing: PacingSchedule::default(),
            pacing_seed: None,
            lease_timeout: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Rejects values the loops cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.delivery_batch_size == 0 {
            return Err(DeliveryError::configuration("delivery_batch_size must be at least 1"));
        }
        if self.bulk_batch_size == 0 {
            return Err(DeliveryError::configuration("bulk_batch_size must be at least 1"));
        }
        for (name, interval) in [
            ("delivery_poll_interval", self.delivery_poll_interval),
            ("bulk_poll_interval", self.bulk_poll_interval),
            ("reap_interval", self.reap_interval),
            ("lease_timeout", self.lease_timeout),
        ] {
            if interval.is_zero() {
                return Err(DeliveryError::configuration(format!("{name} must be non-zero")));
            }
        }
        if self.pacing.max_rate_per_minute == 0 {
            return Err(DeliveryError::configuration("max_rate_per_minute must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter_factor) {
            return Err(DeliveryError::configuration("jitter_factor must be within [0, 1]"));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }

        // A batch is delivered sequentially, so its last outcome can land up
        // to one full request timeout per message after the claim.
        let batch_span = self
            .client_config
            .timeout
            .saturating_mul(u32::try_from(self.delivery_batch_size).unwrap_or(u32::MAX));
        if self.lease_timeout <= batch_span {
            return Err(DeliveryError::configuration(format!(
                "lease_timeout ({}s) must exceed delivery_batch_size x request timeout ({}s)",
                self.lease_timeout.as_secs(),
                batch_span.as_secs()
            )));
        }
        Ok(())
    }
}

/// Counters accumulated by the engine's loops since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Delivery cycles run, including empty ones.
    pub delivery_cycles: u64,
    /// Messages marked SENT.
    pub messages_sent: u64,
    /// Messages marked FAILED.
    pub messages_failed: u64,
    /// Messages sent back to PENDING for another attempt.
    pub messages_retried: u64,
    /// Claims released during shutdown.
    pub claims_released: u64,
    /// Envelopes marked DONE.
    pub envelopes_done: u64,
    /// Envelopes marked FAILED.
    pub envelopes_failed: u64,
    /// Messages created by expansion.
    pub messages_expanded: u64,
    /// Recipients skipped after insert failures.
    pub recipients_skipped: u64,
    /// Messages and envelopes requeued after lease expiry.
    pub leases_reaped: u64,
    /// Delivery attempts whose outcome could not be stored.
    pub outcomes_unrecorded: u64,
}

/// Coordinates the background loops of the queue.
pub struct QueueEngine {
    config: QueueConfig,
    worker: Arc<DeliveryWorker>,
    expander: Arc<BulkExpander>,
    reaper: Arc<LeaseReaper>,
    stats: Arc<RwLock<QueueStats>>,
    cancellation_token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl QueueEngine {
    /// Creates an engine over any `QueueStorage`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid or the sender client cannot be built.
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let client = SenderClient::new(config.client_config.clone())?;
        let stats = Arc::new(RwLock::new(QueueStats::default()));
        let cancellation_token = CancellationToken::new();

        let worker = Arc::new(DeliveryWorker::new(
            storage.clone(),
            client,
            config.retry_policy.clone(),
            config.delivery_batch_size,
            config.delivery_poll_interval,
            stats.clone(),
            cancellation_token.clone(),
            clock.clone(),
        ));
        let expander = Arc::new(BulkExpander::new(
            storage.clone(),
            config.pacing.clone(),
            config.pacing_seed,
            config.bulk_batch_size,
            config.bulk_poll_interval,
            stats.clone(),
            cancellation_token.clone(),
            clock.clone(),
        ));
        let reaper = Arc::new(LeaseReaper::new(
            storage,
            config.lease_timeout,
            config.reap_interval,
            stats.clone(),
            cancellation_token.clone(),
            clock,
        ));

        Ok(Self {
            config,
            worker,
            expander,
            reaper,
            stats,
            cancellation_token,
            handles: Vec::new(),
        })
    }

    /// Creates an engine backed by PostgreSQL.
    ///
    /// # Errors
    ///
    /// Same as [`QueueEngine::new`].
    pub fn with_postgres(
        storage: Storage,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let storage: Arc<dyn QueueStorage> =
            Arc::new(PostgresQueueStorage::new(Arc::new(storage)));
        Self::new(storage, config, clock)
    }

    /// Spawns the delivery, expansion and reaper loops.
    ///
    /// Returns immediately. Use `shutdown()` to stop gracefully.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InternalError` if the engine was already
    /// started or has been cancelled.
    pub fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(DeliveryError::internal("queue engine already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::internal("queue engine has been cancelled"));
        }

        info!(
            delivery_batch_size = self.config.delivery_batch_size,
            bulk_batch_size = self.config.bulk_batch_size,
            "starting queue engine"
        );

        self.handles.push(("delivery", tokio::spawn(self.worker.clone().run())));
        self.handles.push(("expander", tokio::spawn(self.expander.clone().run())));
        self.handles.push(("reaper", tokio::spawn(self.reaper.clone().run())));

        info!(tasks = self.handles.len(), "queue engine started");
        Ok(())
    }

    /// Stops the loops and waits for in-flight work.
    ///
    /// The delivery worker finishes the message it is sending and releases
    /// the rest of its batch; the expander drains running expansions.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the loops do not stop in
    /// time, or `DeliveryError::WorkerPanic` if one of them panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(
            tasks = self.handles.len(),
            timeout_seconds = self.config.shutdown_timeout.as_secs(),
            "shutting down queue engine"
        );

        self.cancellation_token.cancel();

        if self.handles.is_empty() {
            info!("queue engine was not started, shutdown completed immediately");
            return Ok(());
        }

        let handles = std::mem::take(&mut self.handles);
        let join_all = async {
            let mut first_panic = None;
            for (name, handle) in handles {
                if let Err(join_error) = handle.await {
                    error!(task = name, error = %join_error, "queue task panicked during shutdown");
                    first_panic
                        .get_or_insert_with(|| DeliveryError::worker_panic(name, join_error.to_string()));
                }
            }
            first_panic
        };

        match tokio::time::timeout(self.config.shutdown_timeout, join_all).await {
            Ok(None) => {
                info!("queue engine shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                warn!(
                    timeout_seconds = self.config.shutdown_timeout.as_secs(),
                    "queue engine shutdown timed out, some tasks may still be running"
                );
                Err(DeliveryError::ShutdownTimeout {
                    timeout_seconds: self.config.shutdown_timeout.as_secs(),
                })
            },
        }
    }

    /// Runs one delivery cycle in the caller's task.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the claim fails.
    pub async fn process_delivery_cycle(&self) -> Result<DeliveryReport> {
        self.worker.process_cycle().await
    }

    /// Runs one expansion cycle and waits for every claimed envelope.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the claim fails.
    pub async fn process_expansion_cycle(&self) -> Result<ExpansionReport> {
        self.expander.process_cycle().await
    }

    /// Runs one lease reaper pass.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if a requeue fails.
    pub async fn reap_once(&self) -> Result<ReapReport> {
        self.reaper.reap_once().await
    }

    /// Returns a snapshot of the counters.
    pub async fn stats(&self) -> QueueStats {
        self.stats.read().await.clone()
    }

    /// Returns `true` while background loops are running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Returns the engine's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl Drop for QueueEngine {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use missive_core::RealClock;

    use super::*;
    use crate::storage::mock::MockQueueStorage;

    fn engine(config: QueueConfig) -> Result<QueueEngine> {
        QueueEngine::new(Arc::new(MockQueueStorage::new()), config, Arc::new(RealClock::new()))
    }

    #[test]
    fn default_config_is_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery_batch_size, 10);
        assert_eq!(config.bulk_batch_size, 5);
        assert_eq!(config.delivery_poll_interval, Duration::from_secs(5));
        assert_eq!(config.bulk_poll_interval, Duration::from_secs(10));
        assert_eq!(config.retry_policy.max_attempts, 1);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = QueueConfig { delivery_batch_size: 0, ..QueueConfig::default() };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("delivery_batch_size"));

        let config = QueueConfig { bulk_batch_size: 0, ..QueueConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = QueueConfig { reap_interval: Duration::ZERO, ..QueueConfig::default() };
        let error = config.validate().unwrap_err();
        assert!(matches!(error, DeliveryError::ConfigurationError { .. }));
        assert!(error.to_string().contains("reap_interval"));
    }

    #[test]
    fn lease_must_outlast_a_full_batch_of_timeouts() {
        // 10 messages x 30s request timeout = 300s.
        let config =
            QueueConfig { lease_timeout: Duration::from_secs(300), ..QueueConfig::default() };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("lease_timeout"));

        let config =
            QueueConfig { lease_timeout: Duration::from_secs(301), ..QueueConfig::default() };
        assert!(config.validate().is_ok());

        let config = QueueConfig { delivery_batch_size: usize::MAX, ..QueueConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let mut config = QueueConfig::default();
        config.client_config.base_url = "not a url".to_string();
        assert!(matches!(engine(config), Err(DeliveryError::ConfigurationError { .. })));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let mut engine = engine(QueueConfig::default()).unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(engine.start().is_err());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_start_succeeds() {
        let engine = engine(QueueConfig::default()).unwrap();
        assert!(!engine.is_running());
        engine.shutdown().await.unwrap();
    }
}
