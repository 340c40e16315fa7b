//! Lease reaper: requeues work stranded by a crash.
//!
//! A message claimed into PROCESSING, or an envelope claimed into CLAIMED,
//! carries its claim time. Anything still in that state after
//! `lease_timeout` belongs to a cycle that died between claim and outcome,
//! and goes back to PENDING / PROCESS. Re-expanding an envelope is safe
//! because expanded messages are unique per `(bulk_id, bulk_index)`.
//!
//! A cycle that outlives its lease loses the claim: outcome updates carry
//! the claim time and no longer match once the row was requeued.

use std::{sync::Arc, time::Duration};

use missive_core::Clock;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{engine::QueueStats, error::Result, storage::QueueStorage};

/// Rows requeued by one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// PROCESSING messages returned to PENDING.
    pub messages: u64,
    /// CLAIMED envelopes returned to PROCESS.
    pub envelopes: u64,
}

/// Periodic lease-expiry pass.
pub struct LeaseReaper {
    storage: Arc<dyn QueueStorage>,
    lease_timeout: Duration,
    interval: Duration,
    stats: Arc<RwLock<QueueStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl LeaseReaper {
    /// Creates a reaper.
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        lease_timeout: Duration,
        interval: Duration,
        stats: Arc<RwLock<QueueStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, lease_timeout, interval, stats, cancellation_token, clock }
    }

    /// Runs a pass every `interval` until cancelled.
    pub async fn run(self: Arc<Self>) {
        info!(
            lease_timeout_secs = self.lease_timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "lease reaper starting"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }

            if let Err(error) = self.reap_once().await {
                error!(error = %error, "lease reaper pass failed");
            }
        }

        info!("lease reaper stopped");
    }

    /// Requeues every message and envelope whose lease has expired.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if either update fails.
    pub async fn reap_once(&self) -> Result<ReapReport> {
        let now = self.clock.now_utc();
        let Some(cutoff) = chrono::Duration::from_std(self.lease_timeout)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
        else {
            // The lease reaches back past the earliest representable time.
            debug!("lease timeout exceeds the clock range, nothing can be stale");
            return Ok(ReapReport::default());
        };

        let messages = self.storage.requeue_stale_messages(cutoff).await?;
        let envelopes = self.storage.requeue_stale_envelopes(cutoff).await?;
        let report = ReapReport { messages, envelopes };

        if messages > 0 || envelopes > 0 {
            warn!(messages, envelopes, cutoff = %cutoff, "requeued expired leases");
            let mut stats = self.stats.write().await;
            stats.leases_reaped += messages + envelopes;
        } else {
            debug!("no expired leases");
        }

        Ok(report)
    }
}
