//! Bulk expander: turns claimed envelopes into paced individual messages.
//!
//! Envelopes are claimed PROCESS to CLAIMED, then each is expanded on its
//! own task. At most `batch_size` envelopes are in flight; a tick only
//! claims as many envelopes as there are free slots. On shutdown no new
//! envelopes are claimed and the in-flight expansions are drained.

use std::{sync::Arc, time::Duration};

use missive_core::{
    models::{BulkEnvelope, BulkId, NewMessage},
    Clock,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tokio::{sync::RwLock, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    engine::QueueStats,
    error::{DeliveryError, Result},
    pacing::PacingSchedule,
    storage::QueueStorage,
};

/// Result of expanding one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExpansionOutcome {
    /// Envelope marked DONE.
    Done {
        /// Messages inserted (or already present from an earlier attempt).
        inserted: usize,
        /// Recipients whose insert failed and were skipped.
        skipped: usize,
    },
    /// Payload could not be parsed; envelope marked FAILED.
    Failed,
}

/// Counts of what one expansion cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpansionReport {
    /// Envelopes claimed.
    pub claimed: usize,
    /// Envelopes marked DONE.
    pub done: usize,
    /// Envelopes marked FAILED.
    pub failed: usize,
    /// Messages created across all envelopes.
    pub messages: usize,
    /// Recipients skipped after insert failures.
    pub skipped: usize,
}

impl ExpansionReport {
    fn add(&mut self, outcome: ExpansionOutcome) {
        match outcome {
            ExpansionOutcome::Done { inserted, skipped } => {
                self.done += 1;
                self.messages += inserted;
                self.skipped += skipped;
            },
            ExpansionOutcome::Failed => self.failed += 1,
        }
    }
}

/// Periodic envelope claim loop with supervised expansion tasks.
pub struct BulkExpander {
    storage: Arc<dyn QueueStorage>,
    pacing: PacingSchedule,
    seed: Option<u64>,
    batch_size: usize,
    poll_interval: Duration,
    stats: Arc<RwLock<QueueStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl BulkExpander {
    /// Creates an expander.
    ///
    /// With a `seed`, the pacing jitter of every envelope is derived from the
    /// seed and the envelope id, so re-running an expansion yields the same
    /// queue times.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        pacing: PacingSchedule,
        seed: Option<u64>,
        batch_size: usize,
        poll_interval: Duration,
        stats: Arc<RwLock<QueueStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            pacing,
            seed,
            batch_size,
            poll_interval,
            stats,
            cancellation_token,
            clock,
        }
    }

    /// Runs until cancelled, then drains in-flight expansions.
    pub async fn run(self: Arc<Self>) {
        info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis(),
            "bulk expander starting"
        );

        let mut tasks: JoinSet<(BulkId, ExpansionOutcome)> = JoinSet::new();

        loop {
            tokio::select! {
                () = self.clock.sleep(self.poll_interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }

            while let Some(joined) = tasks.try_join_next() {
                self.finish_task(joined).await;
            }

            let free = self.batch_size.saturating_sub(tasks.len());
            if free == 0 {
                debug!(in_flight = tasks.len(), "all expansion slots busy");
                continue;
            }

            match self.claim(free).await {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        self.spawn_expansion(&mut tasks, envelope);
                    }
                },
                Err(error) => error!(error = %error, "failed to claim bulk envelopes"),
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "draining in-flight expansions");
        }
        while let Some(joined) = tasks.join_next().await {
            self.finish_task(joined).await;
        }

        info!("bulk expander stopped");
    }

    /// Claims up to `batch_size` envelopes and expands them concurrently,
    /// waiting for all of them.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the claim fails. Expansion
    /// failures are recorded on the envelopes and never returned.
    pub async fn process_cycle(self: &Arc<Self>) -> Result<ExpansionReport> {
        let envelopes = self.claim(self.batch_size).await?;
        let mut report = ExpansionReport { claimed: envelopes.len(), ..Default::default() };

        let mut tasks = JoinSet::new();
        for envelope in envelopes {
            self.spawn_expansion(&mut tasks, envelope);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, outcome)) => report.add(outcome),
                Err(join_error) => error!(error = %join_error, "envelope expansion panicked"),
            }
        }

        self.record(&report).await;
        Ok(report)
    }

    /// Expands one claimed envelope and marks it DONE or FAILED.
    ///
    /// Insert failures skip the recipient; the envelope is still DONE once
    /// every recipient was attempted.
    pub async fn expand(&self, envelope: &BulkEnvelope) -> ExpansionOutcome {
        let payload = match envelope.parse_payload() {
            Ok(payload) => payload,
            Err(parse_error) => {
                let error = DeliveryError::from(parse_error);
                warn!(error = %error, "bulk payload rejected");
                self.finish(envelope.id, false).await;
                return ExpansionOutcome::Failed;
            },
        };

        let recipients = payload.recipients.len();
        let plan = self.pacing.plan(recipients);
        let mut rng = self.rng_for(envelope.id);
        debug!(
            recipients,
            window_ms = plan.window().as_millis(),
            base_delay_ms = plan.base_delay().as_millis(),
            "expanding envelope"
        );

        let mut inserted = 0;
        let mut skipped = 0;
        for (index, recipient) in payload.recipients.into_iter().enumerate() {
            let dt_queue = plan.queue_time(envelope.dt_store, index, &mut rng);
            let message = NewMessage {
                sender: envelope.sender.clone(),
                recipient,
                body: payload.message.clone(),
                bulk_id: Some(envelope.id),
                bulk_index: Some(i32::try_from(index).unwrap_or(i32::MAX)),
                dt_store: envelope.dt_store,
                dt_queue,
            };

            match self.storage.insert_message(message).await {
                Ok(_) => inserted += 1,
                Err(insert_error) => {
                    skipped += 1;
                    warn!(index, error = %insert_error, "failed to insert message, skipping recipient");
                },
            }
        }

        self.finish(envelope.id, true).await;
        info!(inserted, skipped, "envelope expanded");
        ExpansionOutcome::Done { inserted, skipped }
    }

    fn spawn_expansion(
        self: &Arc<Self>,
        tasks: &mut JoinSet<(BulkId, ExpansionOutcome)>,
        envelope: BulkEnvelope,
    ) {
        let expander = self.clone();
        let span = info_span!("bulk_expansion", bulk_id = %envelope.id, sender = %envelope.sender);
        tasks.spawn(
            async move {
                let outcome = expander.expand(&envelope).await;
                (envelope.id, outcome)
            }
            .instrument(span),
        );
    }

    async fn finish_task(
        &self,
        joined: std::result::Result<(BulkId, ExpansionOutcome), tokio::task::JoinError>,
    ) {
        match joined {
            Ok((_, outcome)) => {
                let mut report = ExpansionReport::default();
                report.add(outcome);
                self.record(&report).await;
            },
            // The envelope stays CLAIMED until its lease expires.
            Err(join_error) => error!(error = %join_error, "envelope expansion panicked"),
        }
    }

    async fn claim(&self, limit: usize) -> Result<Vec<BulkEnvelope>> {
        let envelopes = self.storage.claim_envelopes(limit, self.clock.now_utc()).await?;
        if !envelopes.is_empty() {
            debug!(claimed = envelopes.len(), "claimed bulk envelopes");
        }
        Ok(envelopes)
    }

    async fn finish(&self, id: BulkId, done: bool) {
        let now = self.clock.now_utc();
        let result = if done {
            self.storage.mark_envelope_done(id, now).await
        } else {
            self.storage.mark_envelope_failed(id, now).await
        };

        if let Err(error) = result {
            error!(bulk_id = %id, error = %error, "failed to update envelope status");
        }
    }

    fn rng_for(&self, id: BulkId) -> StdRng {
        match self.seed {
            Some(seed) => {
                let mixed = (id.0 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                StdRng::seed_from_u64(seed ^ mixed)
            },
            None => StdRng::from_os_rng(),
        }
    }

    async fn record(&self, report: &ExpansionReport) {
        let mut stats = self.stats.write().await;
        stats.envelopes_done += report.done as u64;
        stats.envelopes_failed += report.failed as u64;
        stats.messages_expanded += report.messages as u64;
        stats.recipients_skipped += report.skipped as u64;
    }
}
