//! Storage seam between the queue workers and the store.
//!
//! Workers only talk to `QueueStorage`. Production wires in
//! `PostgresQueueStorage`, which delegates to the repositories in
//! `missive_core::storage`; tests use the in-memory `mock` module.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use missive_core::{
    error::Result,
    models::{BulkEnvelope, BulkId, BulkStatus, Message, MessageId, MessageStatus, NewMessage},
    storage::Storage,
};

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Store operations needed by the delivery worker, expander and reaper.
pub trait QueueStorage: Send + Sync + 'static {
    /// Claims up to `limit` PENDING messages with `dt_queue <= due_at`.
    ///
    /// Selection and the flip to PROCESSING are one transaction. Rows are
    /// returned in ascending `dt_queue` order; an empty result is a no-op.
    fn claim_pending_messages(
        &self,
        limit: usize,
        due_at: DateTime<Utc>,
        claimed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Message>>;

    /// Records a successful attempt.
    ///
    /// The outcome and retry calls below only apply while the message is
    /// still PROCESSING under the claim taken at `claimed_at`. They resolve
    /// to `false` when that claim was lost to lease expiry.
    fn mark_message_sent(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
        dt_send: DateTime<Utc>,
        response: String,
    ) -> StorageFuture<'_, bool>;

    /// Records a terminal failed attempt.
    fn mark_message_failed(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
        dt_send: DateTime<Utc>,
        response: String,
    ) -> StorageFuture<'_, bool>;

    /// Returns a failed message to PENDING, due at `next_queue_at`.
    fn schedule_message_retry(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
        next_queue_at: DateTime<Utc>,
        response: String,
    ) -> StorageFuture<'_, bool>;

    /// Returns messages claimed at `claimed_at` but never attempted to
    /// PENDING.
    fn release_message_claims(
        &self,
        ids: Vec<MessageId>,
        claimed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, u64>;

    /// Inserts a PENDING message, or returns the id of the existing row for
    /// the same `(bulk_id, bulk_index)`.
    fn insert_message(&self, message: NewMessage) -> StorageFuture<'_, MessageId>;

    /// Claims up to `limit` envelopes in PROCESS status, moving them to
    /// CLAIMED in the same transaction.
    fn claim_envelopes(
        &self,
        limit: usize,
        claimed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<BulkEnvelope>>;

    /// Marks a claimed envelope as fully expanded.
    fn mark_envelope_done(&self, id: BulkId, dt_convert: DateTime<Utc>) -> StorageFuture<'_, ()>;

    /// Marks a claimed envelope as unexpandable.
    fn mark_envelope_failed(&self, id: BulkId, dt_convert: DateTime<Utc>)
        -> StorageFuture<'_, ()>;

    /// Requeues PROCESSING messages claimed before `claimed_before`.
    fn requeue_stale_messages(&self, claimed_before: DateTime<Utc>) -> StorageFuture<'_, u64>;

    /// Requeues CLAIMED envelopes claimed before `claimed_before`.
    fn requeue_stale_envelopes(&self, claimed_before: DateTime<Utc>) -> StorageFuture<'_, u64>;

    /// Finds a message by id.
    fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>>;

    /// Finds an envelope by id.
    fn find_envelope(&self, id: BulkId) -> StorageFuture<'_, Option<BulkEnvelope>>;

    /// Lists the messages expanded from an envelope, in recipient order.
    fn find_messages_by_bulk(&self, bulk_id: BulkId) -> StorageFuture<'_, Vec<Message>>;
}

/// PostgreSQL implementation over the core repositories.
pub struct PostgresQueueStorage {
    storage: Arc<Storage>,
}

impl PostgresQueueStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl QueueStorage for PostgresQueueStorage {
    fn claim_pending_messages(
        &self,
        limit: usize,
        due_at: DateTime<Utc>,
        claimed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Message>> {
        Box::pin(async move { self.storage.messages.claim_pending(limit, due_at, claimed_at).await })
    }

    fn mark_message_sent(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
        dt_send: DateTime<Utc>,
        response: String,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage
                .messages
                .mark_attempted(id, claimed_at, MessageStatus::Sent, dt_send, &response)
                .await
        })
    }

    fn mark_message_failed(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
        dt_send: DateTime<Utc>,
        response: String,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage
                .messages
                .mark_attempted(id, claimed_at, MessageStatus::Failed, dt_send, &response)
                .await
        })
    }

    fn schedule_message_retry(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
        next_queue_at: DateTime<Utc>,
        response: String,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage.messages.schedule_retry(id, claimed_at, next_queue_at, &response).await
        })
    }

    fn release_message_claims(
        &self,
        ids: Vec<MessageId>,
        claimed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, u64> {
        Box::pin(async move { self.storage.messages.release_claims(&ids, claimed_at).await })
    }

    fn insert_message(&self, message: NewMessage) -> StorageFuture<'_, MessageId> {
        Box::pin(async move { self.storage.messages.insert(&message).await })
    }

    fn claim_envelopes(
        &self,
        limit: usize,
        claimed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<BulkEnvelope>> {
        Box::pin(async move { self.storage.bulk_envelopes.claim(limit, claimed_at).await })
    }

    fn mark_envelope_done(&self, id: BulkId, dt_convert: DateTime<Utc>) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage.bulk_envelopes.finish(id, BulkStatus::Done, dt_convert).await.map(|_| ())
        })
    }

    fn mark_envelope_failed(
        &self,
        id: BulkId,
        dt_convert: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage.bulk_envelopes.finish(id, BulkStatus::Failed, dt_convert).await.map(|_| ())
        })
    }

    fn requeue_stale_messages(&self, claimed_before: DateTime<Utc>) -> StorageFuture<'_, u64> {
        Box::pin(async move { self.storage.messages.requeue_stale(claimed_before).await })
    }

    fn requeue_stale_envelopes(&self, claimed_before: DateTime<Utc>) -> StorageFuture<'_, u64> {
        Box::pin(async move { self.storage.bulk_envelopes.requeue_stale(claimed_before).await })
    }

    fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>> {
        Box::pin(async move { self.storage.messages.find_by_id(id).await })
    }

    fn find_envelope(&self, id: BulkId) -> StorageFuture<'_, Option<BulkEnvelope>> {
        Box::pin(async move { self.storage.bulk_envelopes.find_by_id(id).await })
    }

    fn find_messages_by_bulk(&self, bulk_id: BulkId) -> StorageFuture<'_, Vec<Message>> {
        Box::pin(async move { self.storage.messages.find_by_bulk(bulk_id).await })
    }
}

pub mod mock {
    //! In-memory storage for exercising the workers without a database.
    //!
    //! Mirrors the transition rules of the PostgreSQL repositories and keeps
    //! a log of every mutating call so tests can assert on ordering.

    use std::{
        collections::{BTreeMap, HashSet},
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use missive_core::{
        error::{CoreError, Result},
        models::{
            BulkEnvelope, BulkId, BulkStatus, Json, Message, MessageId, MessageStatus,
            NewEnvelope, NewMessage,
        },
    };
    use tokio::sync::RwLock;

    use super::{QueueStorage, StorageFuture};

    /// A mutating call observed by the mock.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum StorageOp {
        /// Messages claimed into PROCESSING, in returned order.
        ClaimMessages(Vec<MessageId>),
        /// Message marked SENT.
        MarkSent(MessageId),
        /// Message marked FAILED.
        MarkFailed(MessageId),
        /// Message sent back to PENDING by the retry policy.
        ScheduleRetry(MessageId),
        /// Claims released without an attempt.
        Release(Vec<MessageId>),
        /// Message inserted (or found existing).
        InsertMessage(MessageId),
        /// Envelopes claimed.
        ClaimEnvelopes(Vec<BulkId>),
        /// Envelope marked DONE.
        EnvelopeDone(BulkId),
        /// Envelope marked FAILED.
        EnvelopeFailed(BulkId),
    }

    #[derive(Default)]
    struct State {
        messages: BTreeMap<MessageId, Message>,
        envelopes: BTreeMap<BulkId, BulkEnvelope>,
        next_message_id: i64,
        next_bulk_id: i64,
        ops: Vec<StorageOp>,
        claim_error: Option<String>,
        envelope_claim_error: Option<String>,
        failing_recipients: HashSet<String>,
        failing_marks: HashSet<MessageId>,
    }

    impl State {
        fn insert_message(&mut self, new: NewMessage) -> MessageId {
            if let (Some(bulk_id), Some(index)) = (new.bulk_id, new.bulk_index) {
                let existing = self
                    .messages
                    .values()
                    .find(|m| m.bulk_id == Some(bulk_id) && m.bulk_index == Some(index));
                if let Some(existing) = existing {
                    return existing.id;
                }
            }

            self.next_message_id += 1;
            let id = MessageId(self.next_message_id);
            self.messages.insert(
                id,
                Message {
                    id,
                    sender: new.sender,
                    recipient: new.recipient,
                    status: MessageStatus::Pending,
                    bulk_id: new.bulk_id,
                    bulk_index: new.bulk_index,
                    dt_store: new.dt_store,
                    dt_queue: new.dt_queue,
                    dt_send: None,
                    body: new.body,
                    external_response: None,
                    attempts: 0,
                    claimed_at: None,
                },
            );
            id
        }

        fn claimed(&mut self, id: MessageId, claimed_at: DateTime<Utc>) -> Option<&mut Message> {
            self.messages.get_mut(&id).filter(|m| {
                m.status == MessageStatus::Processing && m.claimed_at == Some(claimed_at)
            })
        }

        fn attempt(
            &mut self,
            id: MessageId,
            claimed_at: DateTime<Utc>,
            status: MessageStatus,
            dt_send: DateTime<Utc>,
            response: String,
        ) -> Result<bool> {
            if self.failing_marks.contains(&id) {
                return Err(CoreError::Database(format!("injected failure marking {id}")));
            }
            let updated = match self.claimed(id, claimed_at) {
                Some(message) => {
                    message.status = status;
                    message.dt_send = Some(dt_send);
                    message.external_response = Some(response);
                    message.attempts += 1;
                    message.claimed_at = None;
                    true
                },
                None => false,
            };
            self.ops.push(match status {
                MessageStatus::Sent => StorageOp::MarkSent(id),
                _ => StorageOp::MarkFailed(id),
            });
            Ok(updated)
        }

        fn finish_envelope(&mut self, id: BulkId, status: BulkStatus, at: DateTime<Utc>) {
            if let Some(envelope) =
                self.envelopes.get_mut(&id).filter(|e| e.status == BulkStatus::Claimed)
            {
                envelope.status = status;
                envelope.dt_convert = Some(at);
                envelope.claimed_at = None;
            }
            self.ops.push(match status {
                BulkStatus::Done => StorageOp::EnvelopeDone(id),
                _ => StorageOp::EnvelopeFailed(id),
            });
        }
    }

    /// In-memory `QueueStorage`.
    #[derive(Clone, Default)]
    pub struct MockQueueStorage {
        state: Arc<RwLock<State>>,
    }

    impl MockQueueStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds a PENDING message.
        pub async fn add_message(&self, message: NewMessage) -> MessageId {
            self.state.write().await.insert_message(message)
        }

        /// Adds an envelope in PROCESS status.
        pub async fn add_envelope(&self, envelope: NewEnvelope) -> BulkId {
            let mut state = self.state.write().await;
            state.next_bulk_id += 1;
            let id = BulkId(state.next_bulk_id);
            state.envelopes.insert(
                id,
                BulkEnvelope {
                    id,
                    sender: envelope.sender,
                    status: BulkStatus::Process,
                    dt_store: envelope.dt_store,
                    dt_convert: None,
                    payload: Json(envelope.payload),
                    claimed_at: None,
                },
            );
            id
        }

        /// Fails the next message claim with a database error.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            self.state.write().await.claim_error = Some(error.into());
        }

        /// Fails the next envelope claim with a database error.
        pub async fn inject_envelope_claim_error(&self, error: impl Into<String>) {
            self.state.write().await.envelope_claim_error = Some(error.into());
        }

        /// Makes every insert for `recipient` fail.
        pub async fn fail_inserts_for(&self, recipient: impl Into<String>) {
            self.state.write().await.failing_recipients.insert(recipient.into());
        }

        /// Makes every outcome update for `id` fail.
        pub async fn fail_marks_for(&self, id: MessageId) {
            self.state.write().await.failing_marks.insert(id);
        }

        /// Snapshot of all messages, ordered by id.
        pub async fn messages(&self) -> Vec<Message> {
            self.state.read().await.messages.values().cloned().collect()
        }

        /// Snapshot of one message.
        pub async fn message(&self, id: MessageId) -> Option<Message> {
            self.state.read().await.messages.get(&id).cloned()
        }

        /// Snapshot of one envelope.
        pub async fn envelope(&self, id: BulkId) -> Option<BulkEnvelope> {
            self.state.read().await.envelopes.get(&id).cloned()
        }

        /// Mutating calls observed so far.
        pub async fn operations(&self) -> Vec<StorageOp> {
            self.state.read().await.ops.clone()
        }

        /// Number of messages in `status`.
        pub async fn count_messages(&self, status: MessageStatus) -> usize {
            self.state.read().await.messages.values().filter(|m| m.status == status).count()
        }
    }

    impl QueueStorage for MockQueueStorage {
        fn claim_pending_messages(
            &self,
            limit: usize,
            due_at: DateTime<Utc>,
            claimed_at: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<Message>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(error) = state.claim_error.take() {
                    return Err(CoreError::Database(error));
                }

                let mut due: Vec<_> = state
                    .messages
                    .values()
                    .filter(|m| m.status == MessageStatus::Pending && m.dt_queue <= due_at)
                    .map(|m| (m.dt_queue, m.id))
                    .collect();
                due.sort();
                due.truncate(limit);

                let mut claimed = Vec::with_capacity(due.len());
                for (_, id) in due {
                    if let Some(message) = state.messages.get_mut(&id) {
                        message.status = MessageStatus::Processing;
                        message.claimed_at = Some(claimed_at);
                        claimed.push(message.clone());
                    }
                }

                state.ops.push(StorageOp::ClaimMessages(claimed.iter().map(|m| m.id).collect()));
                Ok(claimed)
            })
        }

        fn mark_message_sent(
            &self,
            id: MessageId,
            claimed_at: DateTime<Utc>,
            dt_send: DateTime<Utc>,
            response: String,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.state.write().await.attempt(
                    id,
                    claimed_at,
                    MessageStatus::Sent,
                    dt_send,
                    response,
                )
            })
        }

        fn mark_message_failed(
            &self,
            id: MessageId,
            claimed_at: DateTime<Utc>,
            dt_send: DateTime<Utc>,
            response: String,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.state.write().await.attempt(
                    id,
                    claimed_at,
                    MessageStatus::Failed,
                    dt_send,
                    response,
                )
            })
        }

        fn schedule_message_retry(
            &self,
            id: MessageId,
            claimed_at: DateTime<Utc>,
            next_queue_at: DateTime<Utc>,
            response: String,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state.failing_marks.contains(&id) {
                    return Err(CoreError::Database(format!("injected failure retrying {id}")));
                }
                let updated = match state.claimed(id, claimed_at) {
                    Some(message) => {
                        message.status = MessageStatus::Pending;
                        message.dt_queue = next_queue_at;
                        message.dt_send = None;
                        message.external_response = Some(response);
                        message.attempts += 1;
                        message.claimed_at = None;
                        true
                    },
                    None => false,
                };
                state.ops.push(StorageOp::ScheduleRetry(id));
                Ok(updated)
            })
        }

        fn release_message_claims(
            &self,
            ids: Vec<MessageId>,
            claimed_at: DateTime<Utc>,
        ) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let mut released = 0;
                for id in &ids {
                    if let Some(message) = state.claimed(*id, claimed_at) {
                        message.status = MessageStatus::Pending;
                        message.claimed_at = None;
                        released += 1;
                    }
                }
                state.ops.push(StorageOp::Release(ids));
                Ok(released)
            })
        }

        fn insert_message(&self, message: NewMessage) -> StorageFuture<'_, MessageId> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state.failing_recipients.contains(&message.recipient) {
                    return Err(CoreError::Database(format!(
                        "injected insert failure for {}",
                        message.recipient
                    )));
                }
                let id = state.insert_message(message);
                state.ops.push(StorageOp::InsertMessage(id));
                Ok(id)
            })
        }

        fn claim_envelopes(
            &self,
            limit: usize,
            claimed_at: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<BulkEnvelope>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(error) = state.envelope_claim_error.take() {
                    return Err(CoreError::Database(error));
                }

                let mut claimed = Vec::new();
                for envelope in state.envelopes.values_mut() {
                    if claimed.len() == limit {
                        break;
                    }
                    if envelope.status == BulkStatus::Process {
                        envelope.status = BulkStatus::Claimed;
                        envelope.claimed_at = Some(claimed_at);
                        claimed.push(envelope.clone());
                    }
                }

                state.ops.push(StorageOp::ClaimEnvelopes(claimed.iter().map(|e| e.id).collect()));
                Ok(claimed)
            })
        }

        fn mark_envelope_done(
            &self,
            id: BulkId,
            dt_convert: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.state.write().await.finish_envelope(id, BulkStatus::Done, dt_convert);
                Ok(())
            })
        }

        fn mark_envelope_failed(
            &self,
            id: BulkId,
            dt_convert: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.state.write().await.finish_envelope(id, BulkStatus::Failed, dt_convert);
                Ok(())
            })
        }

        fn requeue_stale_messages(&self, claimed_before: DateTime<Utc>) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let mut requeued = 0;
                for message in state.messages.values_mut() {
                    if message.status == MessageStatus::Processing
                        && message.claimed_at.is_some_and(|at| at < claimed_before)
                    {
                        message.status = MessageStatus::Pending;
                        message.claimed_at = None;
                        message.dt_send = None;
                        requeued += 1;
                    }
                }
                Ok(requeued)
            })
        }

        fn requeue_stale_envelopes(
            &self,
            claimed_before: DateTime<Utc>,
        ) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let mut requeued = 0;
                for envelope in state.envelopes.values_mut() {
                    if envelope.status == BulkStatus::Claimed
                        && envelope.claimed_at.is_some_and(|at| at < claimed_before)
                    {
                        envelope.status = BulkStatus::Process;
                        envelope.claimed_at = None;
                        requeued += 1;
                    }
                }
                Ok(requeued)
            })
        }

        fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>> {
            Box::pin(async move { Ok(self.message(id).await) })
        }

        fn find_envelope(&self, id: BulkId) -> StorageFuture<'_, Option<BulkEnvelope>> {
            Box::pin(async move { Ok(self.envelope(id).await) })
        }

        fn find_messages_by_bulk(&self, bulk_id: BulkId) -> StorageFuture<'_, Vec<Message>> {
            Box::pin(async move {
                let mut messages: Vec<_> = self
                    .state
                    .read()
                    .await
                    .messages
                    .values()
                    .filter(|m| m.bulk_id == Some(bulk_id))
                    .cloned()
                    .collect();
                messages.sort_by_key(|m| m.bulk_index);
                Ok(messages)
            })
        }
    }
}
