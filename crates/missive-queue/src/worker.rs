//! Delivery worker: claims due PENDING messages and sends them.
//!
//! A cycle claims a batch in one store transaction (PENDING to PROCESSING),
//! then delivers the claimed messages one after another, oldest `dt_queue`
//! first. Every attempt ends in SENT, FAILED, or (when the retry policy
//! allows it) PENDING with a later queue time. A failure of one message
//! never stops the rest of the batch.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, SubsecRound, Utc};
use missive_core::{
    models::{Message, MessageId},
    Clock,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::SenderClient,
    engine::QueueStats,
    error::{ErrorCategory, Result},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::QueueStorage,
};

/// Counts of what one delivery cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Messages claimed into PROCESSING.
    pub claimed: usize,
    /// Messages marked SENT.
    pub sent: usize,
    /// Messages marked FAILED.
    pub failed: usize,
    /// Messages sent back to PENDING for another attempt.
    pub retried: usize,
    /// Claims released unattempted because of shutdown.
    pub released: usize,
    /// Attempts whose outcome could not be stored, either because the store
    /// write failed or because the claim had expired. The lease reaper or a
    /// newer claim owns these messages now.
    pub unrecorded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Failed,
    Retried,
}

/// Periodic claim-and-deliver loop.
pub struct DeliveryWorker {
    storage: Arc<dyn QueueStorage>,
    client: SenderClient,
    retry_policy: RetryPolicy,
    batch_size: usize,
    poll_interval: Duration,
    stats: Arc<RwLock<QueueStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        client: SenderClient,
        retry_policy: RetryPolicy,
        batch_size: usize,
        poll_interval: Duration,
        stats: Arc<RwLock<QueueStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            client,
            retry_policy,
            batch_size,
            poll_interval,
            stats,
            cancellation_token,
            clock,
        }
    }

    /// Runs cycles every `poll_interval` until cancelled.
    ///
    /// Each cycle runs on its own task, so a panic inside a cycle is logged
    /// and the next tick proceeds normally.
    pub async fn run(self: Arc<Self>) {
        info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis(),
            "delivery worker starting"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.poll_interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }

            let worker = self.clone();
            match tokio::spawn(async move { worker.process_cycle().await }).await {
                Ok(Ok(_)) => {},
                Ok(Err(error)) => {
                    error!(
                        error = %error,
                        category = %ErrorCategory::from(&error),
                        "delivery cycle failed"
                    );
                },
                Err(join_error) => {
                    error!(error = %join_error, "delivery cycle panicked");
                },
            }
        }

        info!("delivery worker stopped");
    }

    /// Runs one cycle: claim, then deliver each claimed message.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the claim fails; nothing was
    /// claimed in that case. Failures after the claim are handled per
    /// message and never returned.
    pub async fn process_cycle(&self) -> Result<DeliveryReport> {
        let now = self.clock.now_utc();
        // PostgreSQL keeps microseconds; the claim time doubles as the
        // ownership token for every later update of this batch.
        let claimed_at = now.trunc_subsecs(6);
        let claimed =
            self.storage.claim_pending_messages(self.batch_size, now, claimed_at).await?;

        let mut report = DeliveryReport { claimed: claimed.len(), ..DeliveryReport::default() };
        if claimed.is_empty() {
            debug!("no due messages");
            self.record(&report).await;
            return Ok(report);
        }

        debug!(claimed = claimed.len(), "claimed message batch");

        let mut remaining = claimed.into_iter();
        while let Some(message) = remaining.next() {
            if self.cancellation_token.is_cancelled() {
                let ids: Vec<_> =
                    std::iter::once(message.id).chain(remaining.map(|m| m.id)).collect();
                report.released = self.release(ids, claimed_at).await;
                break;
            }

            match self.deliver(&message, claimed_at).await {
                Some(Outcome::Sent) => report.sent += 1,
                Some(Outcome::Failed) => report.failed += 1,
                Some(Outcome::Retried) => report.retried += 1,
                None => report.unrecorded += 1,
            }
        }

        self.record(&report).await;
        info!(
            claimed = report.claimed,
            sent = report.sent,
            failed = report.failed,
            retried = report.retried,
            released = report.released,
            unrecorded = report.unrecorded,
            "delivery cycle completed"
        );
        Ok(report)
    }

    /// Sends one message and stores the outcome.
    ///
    /// Returns `None` when the outcome could not be stored.
    async fn deliver(&self, message: &Message, claimed_at: DateTime<Utc>) -> Option<Outcome> {
        let result = self.client.send(message).await;
        let attempted_at = self.clock.now_utc();

        let (outcome, stored) = match result {
            Ok(response) => {
                debug!(
                    message_id = %message.id,
                    status_code = response.status_code,
                    duration_ms = response.duration.as_millis(),
                    "message sent"
                );
                let stored = self
                    .storage
                    .mark_message_sent(message.id, claimed_at, attempted_at, response.body)
                    .await;
                (Outcome::Sent, stored)
            },
            Err(error) => {
                let attempt = u32::try_from(message.attempts).unwrap_or(0).saturating_add(1);
                let decision =
                    RetryContext::new(attempt, &error, attempted_at, &self.retry_policy)
                        .decide_retry();

                match decision {
                    RetryDecision::Retry { next_attempt_at } => {
                        warn!(
                            message_id = %message.id,
                            attempt,
                            error = %error,
                            next_attempt_at = %next_attempt_at,
                            "delivery failed, retry scheduled"
                        );
                        let stored = self
                            .storage
                            .schedule_message_retry(
                                message.id,
                                claimed_at,
                                next_attempt_at,
                                error.response_text(),
                            )
                            .await;
                        (Outcome::Retried, stored)
                    },
                    RetryDecision::GiveUp { reason } => {
                        warn!(
                            message_id = %message.id,
                            attempt,
                            error = %error,
                            category = %ErrorCategory::from(&error),
                            reason = %reason,
                            "delivery failed"
                        );
                        let stored = self
                            .storage
                            .mark_message_failed(
                                message.id,
                                claimed_at,
                                attempted_at,
                                error.response_text(),
                            )
                            .await;
                        (Outcome::Failed, stored)
                    },
                }
            },
        };

        match stored {
            Ok(true) => Some(outcome),
            Ok(false) => {
                warn!(
                    message_id = %message.id,
                    claimed_at = %claimed_at,
                    "claim expired before the outcome was stored; outcome discarded"
                );
                None
            },
            Err(store_error) => {
                error!(
                    message_id = %message.id,
                    error = %store_error,
                    "failed to record delivery outcome; lease expiry will requeue the message"
                );
                None
            },
        }
    }

    async fn release(&self, ids: Vec<MessageId>, claimed_at: DateTime<Utc>) -> usize {
        let count = ids.len();
        match self.storage.release_message_claims(ids, claimed_at).await {
            Ok(released) => {
                info!(released, "shutdown requested, released unattempted claims");
                usize::try_from(released).unwrap_or(count)
            },
            Err(error) => {
                error!(error = %error, count, "failed to release claims");
                0
            },
        }
    }

    async fn record(&self, report: &DeliveryReport) {
        let mut stats = self.stats.write().await;
        stats.delivery_cycles += 1;
        stats.messages_sent += report.sent as u64;
        stats.messages_failed += report.failed as u64;
        stats.messages_retried += report.retried as u64;
        stats.claims_released += report.released as u64;
        stats.outcomes_unrecorded += report.unrecorded as u64;
    }
}
