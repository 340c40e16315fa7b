//! Integration tests for the PostgreSQL repositories.
//!
//! Each test bootstraps the schema inside its own PostgreSQL schema so the
//! claim queries only ever see the rows that test inserted. Run with
//! `DATABASE_URL=postgres://... cargo test -- --ignored`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use missive_core::{
    storage::{schema::ensure_schema, Storage},
    BulkStatus, MessageStatus, NewEnvelope, NewMessage,
};
use sqlx::{postgres::PgPoolOptions, Executor};

async fn isolated_storage(name: &str) -> Storage {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let schema = format!("missive_test_{name}");

    let admin = PgPoolOptions::new().max_connections(1).connect(&url).await.unwrap();
    admin.execute(format!("DROP SCHEMA IF EXISTS {schema} CASCADE").as_str()).await.unwrap();
    admin.execute(format!("CREATE SCHEMA {schema}").as_str()).await.unwrap();
    admin.close().await;

    let search_path = format!("SET search_path TO {schema}");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .after_connect(move |conn, _meta| {
            let search_path = search_path.clone();
            Box::pin(async move {
                conn.execute(search_path.as_str()).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .unwrap();

    ensure_schema(&pool).await.unwrap();
    ensure_schema(&pool).await.unwrap();
    Storage::new(pool)
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn health_check_succeeds() {
    let storage = isolated_storage("health").await;
    assert!(storage.health_check().await.is_ok());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn claim_takes_only_due_messages_in_queue_order() {
    let storage = isolated_storage("claim_order").await;
    let repo = &storage.messages;

    let mut late = NewMessage::direct("acme", "628003", "c", t0());
    late.dt_queue = t0() + Duration::seconds(20);
    let mut early = NewMessage::direct("acme", "628001", "a", t0());
    early.dt_queue = t0() + Duration::seconds(5);
    let mut future = NewMessage::direct("acme", "628009", "z", t0());
    future.dt_queue = t0() + Duration::hours(1);

    let late_id = repo.insert(&late).await.unwrap();
    let early_id = repo.insert(&early).await.unwrap();
    let future_id = repo.insert(&future).await.unwrap();

    let now = t0() + Duration::minutes(1);
    let claimed = repo.claim_pending(10, now, now).await.unwrap();

    let ids: Vec<_> = claimed.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![early_id, late_id]);
    assert!(claimed.iter().all(|m| m.status == MessageStatus::Processing));
    assert!(claimed.iter().all(|m| m.claimed_at == Some(now)));

    let untouched = repo.find_by_id(future_id).await.unwrap().unwrap();
    assert_eq!(untouched.status, MessageStatus::Pending);

    // A second claim finds nothing left that is due.
    assert!(repo.claim_pending(10, now, now).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn attempt_outcomes_set_dt_send() {
    let storage = isolated_storage("outcomes").await;
    let repo = &storage.messages;

    let sent_id = repo.insert(&NewMessage::direct("acme", "1", "x", t0())).await.unwrap();
    let failed_id = repo.insert(&NewMessage::direct("acme", "2", "y", t0())).await.unwrap();
    repo.claim_pending(10, t0(), t0()).await.unwrap();

    let at = t0() + Duration::seconds(3);
    assert!(repo
        .mark_attempted(sent_id, t0(), MessageStatus::Sent, at, "{\"ok\":true}")
        .await
        .unwrap());
    assert!(repo.mark_attempted(failed_id, t0(), MessageStatus::Failed, at, "boom").await.unwrap());

    let sent = repo.find_by_id(sent_id).await.unwrap().unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);
    assert_eq!(sent.dt_send, Some(at));
    assert_eq!(sent.external_response.as_deref(), Some("{\"ok\":true}"));
    assert_eq!(sent.attempts, 1);
    assert_eq!(sent.claimed_at, None);

    let failed = repo.find_by_id(failed_id).await.unwrap().unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);
    assert_eq!(failed.dt_send, Some(at));

    // Terminal rows are never overwritten.
    assert!(!repo.mark_attempted(failed_id, t0(), MessageStatus::Sent, at, "late").await.unwrap());
    assert_eq!(repo.count_by_status(MessageStatus::Sent).await.unwrap(), 1);
    assert_eq!(repo.count_by_status(MessageStatus::Failed).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn retry_and_release_return_messages_to_pending() {
    let storage = isolated_storage("retry_release").await;
    let repo = &storage.messages;

    let retried = repo.insert(&NewMessage::direct("acme", "1", "x", t0())).await.unwrap();
    let released = repo.insert(&NewMessage::direct("acme", "2", "y", t0())).await.unwrap();
    repo.claim_pending(10, t0(), t0()).await.unwrap();

    let next = t0() + Duration::seconds(30);
    assert!(repo.schedule_retry(retried, t0(), next, "HTTP 503").await.unwrap());
    assert_eq!(repo.release_claims(&[released], t0()).await.unwrap(), 1);

    let retried = repo.find_by_id(retried).await.unwrap().unwrap();
    assert_eq!(retried.status, MessageStatus::Pending);
    assert_eq!(retried.dt_queue, next);
    assert_eq!(retried.dt_send, None);
    assert_eq!(retried.attempts, 1);

    let released = repo.find_by_id(released).await.unwrap().unwrap();
    assert_eq!(released.status, MessageStatus::Pending);
    assert_eq!(released.attempts, 0);
    assert_eq!(released.claimed_at, None);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn outcome_of_an_expired_claim_does_not_touch_the_new_claim() {
    let storage = isolated_storage("expired_claim").await;
    let repo = &storage.messages;

    let id = repo.insert(&NewMessage::direct("acme", "1", "x", t0())).await.unwrap();
    repo.claim_pending(10, t0(), t0()).await.unwrap();

    let reclaimed_at = t0() + Duration::seconds(301);
    assert_eq!(repo.requeue_stale(t0() + Duration::seconds(1)).await.unwrap(), 1);
    assert_eq!(repo.claim_pending(10, reclaimed_at, reclaimed_at).await.unwrap().len(), 1);

    let late = reclaimed_at + Duration::seconds(5);
    assert!(!repo.mark_attempted(id, t0(), MessageStatus::Failed, late, "late").await.unwrap());
    assert!(!repo.schedule_retry(id, t0(), late, "late").await.unwrap());
    assert_eq!(repo.release_claims(&[id], t0()).await.unwrap(), 0);

    let message = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Processing);
    assert_eq!(message.claimed_at, Some(reclaimed_at));
    assert_eq!(message.attempts, 0);

    assert!(repo.mark_attempted(id, reclaimed_at, MessageStatus::Sent, late, "{}").await.unwrap());
    assert_eq!(repo.find_by_id(id).await.unwrap().unwrap().status, MessageStatus::Sent);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn stale_processing_messages_are_requeued() {
    let storage = isolated_storage("stale_messages").await;
    let repo = &storage.messages;

    let stale = repo.insert(&NewMessage::direct("acme", "1", "x", t0())).await.unwrap();
    repo.claim_pending(10, t0(), t0()).await.unwrap();
    let fresh = repo.insert(&NewMessage::direct("acme", "2", "y", t0())).await.unwrap();
    let later = t0() + Duration::minutes(10);
    repo.claim_pending(10, later, later).await.unwrap();

    let requeued = repo.requeue_stale(t0() + Duration::minutes(5)).await.unwrap();

    assert_eq!(requeued, 1);
    assert_eq!(repo.find_by_id(stale).await.unwrap().unwrap().status, MessageStatus::Pending);
    assert_eq!(repo.find_by_id(fresh).await.unwrap().unwrap().status, MessageStatus::Processing);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn envelope_claim_and_finish() {
    let storage = isolated_storage("envelopes").await;
    let repo = &storage.bulk_envelopes;

    let id = repo.insert(&NewEnvelope::new("acme", &["1", "2"], "hi", t0())).await.unwrap();

    let claimed = repo.claim(5, t0()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, BulkStatus::Claimed);
    assert_eq!(claimed[0].parse_payload().unwrap().recipients, vec!["1", "2"]);

    // Already claimed, so invisible to another cycle.
    assert!(repo.claim(5, t0()).await.unwrap().is_empty());

    let done_at = t0() + Duration::seconds(2);
    assert!(repo.finish(id, BulkStatus::Done, done_at).await.unwrap());
    assert!(!repo.finish(id, BulkStatus::Failed, done_at).await.unwrap());

    let envelope = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(envelope.status, BulkStatus::Done);
    assert_eq!(envelope.dt_convert, Some(done_at));
    assert_eq!(envelope.claimed_at, None);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn expansion_inserts_are_idempotent() {
    let storage = isolated_storage("idempotent_insert").await;

    let bulk_id = storage
        .bulk_envelopes
        .insert(&NewEnvelope::new("acme", &["1"], "hi", t0()))
        .await
        .unwrap();

    let mut message = NewMessage::direct("acme", "1", "hi", t0());
    message.bulk_id = Some(bulk_id);
    message.bulk_index = Some(0);

    let first = storage.messages.insert(&message).await.unwrap();
    let second = storage.messages.insert(&message).await.unwrap();

    assert_eq!(first, second);
    let expanded = storage.messages.find_by_bulk(bulk_id).await.unwrap();
    assert_eq!(expanded.len(), 1);
    assert!(expanded[0].is_broadcast());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn stale_envelopes_are_requeued() {
    let storage = isolated_storage("stale_envelopes").await;
    let repo = &storage.bulk_envelopes;

    let id = repo.insert(&NewEnvelope::new("acme", &["1"], "hi", t0())).await.unwrap();
    repo.claim(5, t0()).await.unwrap();

    assert_eq!(repo.requeue_stale(t0() + Duration::minutes(5)).await.unwrap(), 1);
    assert_eq!(repo.find_by_id(id).await.unwrap().unwrap().status, BulkStatus::Process);
}
