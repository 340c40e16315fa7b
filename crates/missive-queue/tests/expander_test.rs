//! Bulk expander tests against the in-memory store.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use missive_core::{
    models::{NewEnvelope, NewMessage},
    BulkId, BulkStatus, Clock, MessageStatus, TestClock,
};
use missive_queue::{
    expander::{BulkExpander, ExpansionOutcome},
    reaper::LeaseReaper,
    storage::{mock::MockQueueStorage, QueueStorage},
    DeliveryError, PacingSchedule, QueueStats,
};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const SENDER: &str = "628111000";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 20, 8, 0, 0).unwrap()
}

struct Harness {
    storage: MockQueueStorage,
    clock: TestClock,
    stats: Arc<RwLock<QueueStats>>,
    token: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        Self {
            storage: MockQueueStorage::new(),
            clock: TestClock::with_start_time(t0()),
            stats: Arc::new(RwLock::new(QueueStats::default())),
            token: CancellationToken::new(),
        }
    }

    fn expander(&self, batch_size: usize, seed: Option<u64>) -> Arc<BulkExpander> {
        Arc::new(BulkExpander::new(
            Arc::new(self.storage.clone()),
            PacingSchedule::default(),
            seed,
            batch_size,
            Duration::from_secs(10),
            self.stats.clone(),
            self.token.clone(),
            Arc::new(self.clock.clone()),
        ))
    }

    async fn envelope(&self, recipients: &[&str]) -> BulkId {
        self.storage
            .add_envelope(NewEnvelope::new(SENDER, recipients, "promo", t0()))
            .await
    }
}

#[tokio::test]
async fn envelope_expands_into_one_message_per_recipient() -> Result<()> {
    let h = Harness::new();
    let recipients = ["6281", "6282", "6283", "6284", "6285"];
    let id = h.envelope(&recipients).await;
    h.clock.advance(Duration::from_secs(2));

    let report = h.expander(5, Some(1)).process_cycle().await?;

    assert_eq!(report.claimed, 1);
    assert_eq!(report.done, 1);
    assert_eq!(report.messages, 5);

    let envelope = h.storage.envelope(id).await.unwrap();
    assert_eq!(envelope.status, BulkStatus::Done);
    assert_eq!(envelope.dt_convert, Some(h.clock.now_utc()));

    let messages = h.storage.find_messages_by_bulk(id).await?;
    assert_eq!(messages.len(), 5);
    for (index, message) in messages.iter().enumerate() {
        assert_eq!(message.recipient, recipients[index]);
        assert_eq!(message.sender, SENDER);
        assert_eq!(message.body, "promo");
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.dt_store, t0());
        assert_eq!(message.bulk_index, Some(i32::try_from(index)?));
        assert!(message.dt_queue > t0());
        assert!(message.dt_send.is_none());
    }

    let stats = h.stats.read().await.clone();
    assert_eq!(stats.envelopes_done, 1);
    assert_eq!(stats.messages_expanded, 5);
    Ok(())
}

#[tokio::test]
async fn queue_times_follow_pacing_bounds() -> Result<()> {
    let h = Harness::new();
    let id = h.envelope(&["a", "b", "c", "d", "e"]).await;

    h.expander(5, None).process_cycle().await?;

    // 5 recipients: 30s window, 6s base.
    let offsets: Vec<i64> = h
        .storage
        .find_messages_by_bulk(id)
        .await?
        .iter()
        .map(|m| (m.dt_queue - t0()).num_milliseconds())
        .collect();
    assert!((1_000..=3_000).contains(&offsets[0]));
    assert!((2_000..=5_000).contains(&offsets[1]));
    assert!((3_000..=8_000).contains(&offsets[2]));
    assert!((21_000..27_000).contains(&offsets[3]));
    assert!((27_000..33_000).contains(&offsets[4]));
    Ok(())
}

#[tokio::test]
async fn malformed_payload_fails_without_messages() -> Result<()> {
    let h = Harness::new();
    let id = h
        .storage
        .add_envelope(NewEnvelope {
            sender: SENDER.to_string(),
            dt_store: t0(),
            payload: json!({"numbers": ["6281"], "text": "hi"}),
        })
        .await;

    let report = h.expander(5, None).process_cycle().await?;

    assert_eq!(report.failed, 1);
    assert_eq!(report.messages, 0);
    let envelope = h.storage.envelope(id).await.unwrap();
    assert_eq!(envelope.status, BulkStatus::Failed);
    assert_eq!(envelope.dt_convert, Some(t0()));
    assert!(h.storage.messages().await.is_empty());
    assert_eq!(h.stats.read().await.envelopes_failed, 1);
    Ok(())
}

#[tokio::test]
async fn empty_recipient_list_fails() -> Result<()> {
    let h = Harness::new();
    let id = h.envelope(&[]).await;

    let expander = h.expander(5, None);
    let claimed = h.storage.claim_envelopes(1, t0()).await?;
    let outcome = expander.expand(&claimed[0]).await;

    assert_eq!(outcome, ExpansionOutcome::Failed);
    assert_eq!(h.storage.envelope(id).await.unwrap().status, BulkStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn failed_insert_skips_recipient_and_envelope_completes() -> Result<()> {
    let h = Harness::new();
    let id = h.envelope(&["6281", "6282", "6283"]).await;
    h.storage.fail_inserts_for("6282").await;

    let report = h.expander(5, None).process_cycle().await?;

    assert_eq!(report.done, 1);
    assert_eq!(report.messages, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.storage.envelope(id).await.unwrap().status, BulkStatus::Done);

    let recipients: Vec<_> = h
        .storage
        .find_messages_by_bulk(id)
        .await?
        .into_iter()
        .map(|m| m.recipient)
        .collect();
    assert_eq!(recipients, vec!["6281", "6283"]);
    Ok(())
}

#[tokio::test]
async fn seeded_expansion_is_reproducible() -> Result<()> {
    async fn queue_times(seed: u64) -> Result<Vec<DateTime<Utc>>> {
        let h = Harness::new();
        let id = h.envelope(&["1", "2", "3", "4", "5", "6", "7", "8"]).await;
        h.expander(5, Some(seed)).process_cycle().await?;
        Ok(h.storage.find_messages_by_bulk(id).await?.into_iter().map(|m| m.dt_queue).collect())
    }

    assert_eq!(queue_times(42).await?, queue_times(42).await?);
    assert_ne!(queue_times(42).await?, queue_times(43).await?);
    Ok(())
}

#[tokio::test]
async fn re_expansion_after_lease_expiry_does_not_duplicate() -> Result<()> {
    let h = Harness::new();
    let id = h.envelope(&["6281", "6282", "6283"]).await;

    // A cycle that died after inserting the first recipient.
    h.storage.claim_envelopes(5, t0()).await?;
    let mut partial = NewMessage::direct(SENDER, "6281", "promo", t0());
    partial.bulk_id = Some(id);
    partial.bulk_index = Some(0);
    let first = h.storage.insert_message(partial).await?;

    let reaper = LeaseReaper::new(
        Arc::new(h.storage.clone()),
        Duration::from_secs(300),
        Duration::from_secs(60),
        h.stats.clone(),
        h.token.clone(),
        Arc::new(h.clock.clone()),
    );
    h.clock.advance(Duration::from_secs(600));
    assert_eq!(reaper.reap_once().await?.envelopes, 1);
    assert_eq!(h.storage.envelope(id).await.unwrap().status, BulkStatus::Process);

    let report = h.expander(5, None).process_cycle().await?;
    assert_eq!(report.done, 1);

    let messages = h.storage.find_messages_by_bulk(id).await?;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].id, first);
    Ok(())
}

#[tokio::test]
async fn claim_respects_batch_size() -> Result<()> {
    let h = Harness::new();
    for _ in 0..7 {
        h.envelope(&["6281"]).await;
    }

    let expander = h.expander(5, None);
    assert_eq!(expander.process_cycle().await?.claimed, 5);
    assert_eq!(expander.process_cycle().await?.claimed, 2);
    assert_eq!(expander.process_cycle().await?.claimed, 0);
    Ok(())
}

#[tokio::test]
async fn claim_error_is_returned() {
    let h = Harness::new();
    let id = h.envelope(&["6281"]).await;
    h.storage.inject_envelope_claim_error("pool exhausted").await;

    let result = h.expander(5, None).process_cycle().await;

    assert!(matches!(result, Err(DeliveryError::DatabaseError { .. })));
    assert_eq!(h.storage.envelope(id).await.unwrap().status, BulkStatus::Process);
}

#[tokio::test]
async fn run_loop_expands_and_drains_on_cancel() -> Result<()> {
    let h = Harness::new();
    let first = h.envelope(&["6281", "6282"]).await;
    let second = h.envelope(&["6283"]).await;

    let handle = tokio::spawn(h.expander(5, None).run());

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let done = h.stats.read().await.envelopes_done;
            if done == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    h.token.cancel();
    handle.await?;

    assert_eq!(h.storage.envelope(first).await.unwrap().status, BulkStatus::Done);
    assert_eq!(h.storage.envelope(second).await.unwrap().status, BulkStatus::Done);
    assert_eq!(h.storage.messages().await.len(), 3);
    Ok(())
}
