//! Core domain models and storage for the missive message queue.
//!
//! Provides the two tables of record (individual messages and bulk
//! envelopes), their status state machines, strongly-typed identifiers, the
//! clock abstraction used for every stored timestamp, and the PostgreSQL
//! repositories that implement the transactional claim pattern.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    BulkEnvelope, BulkId, BulkPayload, BulkStatus, Message, MessageId, MessageStatus,
    NewEnvelope, NewMessage,
};
pub use time::{Clock, RealClock, TestClock};
