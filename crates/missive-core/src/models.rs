//! Domain models and strongly-typed identifiers.
//!
//! Two tables of record: individual messages and bulk envelopes. Both are
//! owned by the store; workers only hold the rows of their current batch.
//!
//! # Message lifecycle
//!
//! ```text
//! PENDING -> PROCESSING -> SENT
//!    ^            |      -> FAILED
//!    +------------+ (retry or expired lease)
//! ```
//!
//! # Envelope lifecycle
//!
//! ```text
//! PROCESS -> CLAIMED -> DONE
//!    ^          |    -> FAILED
//!    +----------+ (expired lease)
//! ```

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sqlx::types::Json;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! store_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <i64 as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                Ok(Self(<i64 as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

macro_rules! text_status {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stored text representation.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CoreError::InvalidInput(format!(
                        "invalid {} value: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <&str as sqlx::Type<PgDb>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <&str as sqlx::Type<PgDb>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(s.parse()?)
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

store_id!(
    /// Store-assigned identifier of an individual message.
    MessageId
);

store_id!(
    /// Store-assigned identifier of a bulk envelope.
    BulkId
);

/// Delivery status of an individual message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Waiting for its queue time and a delivery worker.
    Pending,
    /// Claimed by a delivery cycle; the attempt has not been recorded yet.
    Processing,
    /// Delivered; the external API answered 2xx.
    Sent,
    /// Delivery attempt failed and the retry policy gave up.
    Failed,
}

text_status!(MessageStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Sent => "SENT",
    Failed => "FAILED",
});

impl MessageStatus {
    /// Whether no further transition happens from this status.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

/// Processing status of a bulk envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkStatus {
    /// Submitted and awaiting expansion.
    Process,
    /// Claimed by an expansion cycle.
    Claimed,
    /// Expanded into individual messages.
    Done,
    /// Payload could not be expanded.
    Failed,
}

text_status!(BulkStatus {
    Process => "PROCESS",
    Claimed => "CLAIMED",
    Done => "DONE",
    Failed => "FAILED",
});

impl BulkStatus {
    /// Whether the envelope will never be processed again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// An individual message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Sender account; part of the outbound URL.
    pub sender: String,
    /// Destination of the message.
    pub recipient: String,
    /// Current delivery status.
    pub status: MessageStatus,
    /// Originating envelope, `None` for direct sends.
    pub bulk_id: Option<BulkId>,
    /// Recipient position within the originating envelope.
    pub bulk_index: Option<i32>,
    /// Creation time (shared by every message of one envelope).
    pub dt_store: DateTime<Utc>,
    /// Scheduled delivery time, may lie in the future.
    pub dt_queue: DateTime<Utc>,
    /// Time of the last attempt; set iff the status is terminal.
    pub dt_send: Option<DateTime<Utc>>,
    /// Message text.
    #[sqlx(rename = "message")]
    #[serde(rename = "message")]
    pub body: String,
    /// Raw response body or failure reason of the last attempt.
    #[sqlx(rename = "external_api_response")]
    pub external_response: Option<String>,
    /// Delivery attempts made so far.
    pub attempts: i32,
    /// Lease start while PROCESSING.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Whether this message came out of a bulk envelope.
    pub fn is_broadcast(&self) -> bool {
        self.bulk_id.is_some()
    }
}

/// Fields for inserting a new PENDING message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Sender account.
    pub sender: String,
    /// Destination of the message.
    pub recipient: String,
    /// Message text.
    pub body: String,
    /// Originating envelope, if any.
    pub bulk_id: Option<BulkId>,
    /// Recipient position within the envelope.
    pub bulk_index: Option<i32>,
    /// Creation time.
    pub dt_store: DateTime<Utc>,
    /// Scheduled delivery time.
    pub dt_queue: DateTime<Utc>,
}

impl NewMessage {
    /// A direct send, queued for immediate delivery.
    pub fn direct(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            body: body.into(),
            bulk_id: None,
            bulk_index: None,
            dt_store: now,
            dt_queue: now,
        }
    }
}

/// Recipients and shared body of a bulk envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkPayload {
    /// Ordered recipient list.
    pub recipients: Vec<String>,
    /// Body sent to every recipient.
    pub message: String,
}

/// A bulk envelope row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BulkEnvelope {
    /// Store-assigned identifier.
    pub id: BulkId,
    /// Sender account, copied onto every expanded message.
    pub sender: String,
    /// Current processing status.
    pub status: BulkStatus,
    /// Submission time.
    pub dt_store: DateTime<Utc>,
    /// Time expansion finished or failed.
    pub dt_convert: Option<DateTime<Utc>>,
    /// Opaque structured payload, see [`BulkPayload`].
    #[sqlx(rename = "bulk")]
    pub payload: Json<serde_json::Value>,
    /// Lease start while CLAIMED.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl BulkEnvelope {
    /// Parses the stored payload.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the payload does not have the
    /// `{recipients, message}` shape or lists no recipients.
    pub fn parse_payload(&self) -> Result<BulkPayload> {
        let payload: BulkPayload = serde_json::from_value(self.payload.0.clone())?;
        if payload.recipients.is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "bulk envelope {} has no recipients",
                self.id
            )));
        }
        Ok(payload)
    }
}

/// Fields for inserting a new envelope in PROCESS status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEnvelope {
    /// Sender account.
    pub sender: String,
    /// Submission time.
    pub dt_store: DateTime<Utc>,
    /// Payload to store verbatim.
    pub payload: serde_json::Value,
}

impl NewEnvelope {
    /// Builds an envelope from a recipient list and a shared body.
    pub fn new(
        sender: impl Into<String>,
        recipients: &[&str],
        message: impl Into<String>,
        dt_store: DateTime<Utc>,
    ) -> Self {
        Self {
            sender: sender.into(),
            dt_store,
            payload: serde_json::json!({
                "recipients": recipients,
                "message": message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: serde_json::Value) -> BulkEnvelope {
        BulkEnvelope {
            id: BulkId(7),
            sender: "acme".to_string(),
            status: BulkStatus::Process,
            dt_store: Utc::now(),
            dt_convert: None,
            payload: Json(payload),
            claimed_at: None,
        }
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Processing,
            MessageStatus::Sent,
            MessageStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        for status in [BulkStatus::Process, BulkStatus::Claimed, BulkStatus::Done, BulkStatus::Failed]
        {
            assert_eq!(status.to_string().parse::<BulkStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("pending".parse::<MessageStatus>().is_err());
        assert!("QUEUED".parse::<BulkStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Processing.is_terminal());
        assert!(BulkStatus::Done.is_terminal());
        assert!(!BulkStatus::Claimed.is_terminal());
    }

    #[test]
    fn payload_parses_recipients_in_order() {
        let env = envelope(serde_json::json!({
            "recipients": ["628111", "628222", "628333"],
            "message": "hi",
        }));

        let payload = env.parse_payload().unwrap();
        assert_eq!(payload.recipients, vec!["628111", "628222", "628333"]);
        assert_eq!(payload.message, "hi");
    }

    #[test]
    fn malformed_payload_is_invalid_input() {
        let env = envelope(serde_json::json!({ "recipients": "628111", "message": 3 }));
        assert!(matches!(env.parse_payload(), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn empty_recipient_list_is_invalid_input() {
        let env = envelope(serde_json::json!({ "recipients": [], "message": "hi" }));
        let err = env.parse_payload().unwrap_err();
        assert!(err.to_string().contains("no recipients"));
    }

    #[test]
    fn new_envelope_builds_expected_payload() {
        let env = NewEnvelope::new("acme", &["a", "b"], "hello", Utc::now());
        assert_eq!(env.payload["recipients"], serde_json::json!(["a", "b"]));
        assert_eq!(env.payload["message"], "hello");
    }
}
