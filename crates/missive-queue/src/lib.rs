//! Queue processing for the missive message store.
//!
//! Three background loops run against the store:
//!
//! 1. **Delivery worker** - claims due PENDING messages (PENDING to
//!    PROCESSING in one transaction), posts each to the sender API and marks
//!    it SENT or FAILED with the API's response.
//! 2. **Bulk expander** - claims PROCESS envelopes, inserts one PENDING
//!    message per recipient with a paced queue time, and marks the envelope
//!    DONE or FAILED.
//! 3. **Lease reaper** - returns claims older than the lease timeout to
//!    their claimable state so a crashed cycle never strands work.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of engine processes can
//! share one database without claiming the same row twice.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use missive_core::{storage::Storage, RealClock};
//! use missive_queue::{DeliveryError, QueueConfig, QueueEngine};
//!
//! # async fn example(storage: Storage) -> std::result::Result<(), DeliveryError> {
//! let mut engine =
//!     QueueEngine::with_postgres(storage, QueueConfig::default(), Arc::new(RealClock))?;
//! engine.start()?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod engine;
pub mod error;
pub mod expander;
pub mod pacing;
pub mod reaper;
pub mod retry;
pub mod storage;
pub mod worker;

pub use engine::{QueueConfig, QueueEngine, QueueStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use pacing::PacingSchedule;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use storage::{PostgresQueueStorage, QueueStorage};

/// Default number of messages claimed per delivery cycle.
pub const DEFAULT_DELIVERY_BATCH_SIZE: usize = 10;

/// Default number of envelopes expanded concurrently.
pub const DEFAULT_BULK_BATCH_SIZE: usize = 5;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
