//! Event trait and the wire envelope for published events.
//!
//! Events travel as JSON so that consumers written in any language can read
//! them. The envelope flattens the payload and adds the two fields stamped at
//! publish time:
//!
//! ```json
//! {"userId": "u1", "totalTasks": 3, ..., "timestamp": "2024-05-01T10:00:00.000Z", "eventId": "9b1d..."}
//! ```
//!
//! # Example
//!
//! ```
//! use tasksync_core::event::{Event, EventEnvelope};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! struct Pinged { who: String }
//!
//! impl Event for Pinged {
//!     fn routing_key(&self) -> &'static str {
//!         "ping.sent"
//!     }
//! }
//!
//! let envelope = EventEnvelope::stamp(Pinged { who: "me".into() }, chrono::Utc::now());
//! let bytes = envelope.to_bytes().unwrap();
//! let decoded = EventEnvelope::<Pinged>::from_bytes(&bytes).unwrap();
//! assert_eq!(decoded.event_id, envelope.event_id);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// A fact published to the broker.
///
/// # Routing Keys
///
/// `routing_key()` returns the `.`-delimited topic the event is published
/// under, e.g. `"task.checkout.completed"`. Consumers bind patterns against it
/// (see [`crate::routing`]).
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Topic this event is published under.
    fn routing_key(&self) -> &'static str;
}

/// Unique id stamped on every published event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh UUID v4 id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// An event as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<E> {
    /// Domain payload, flattened into the top level object.
    #[serde(flatten)]
    pub payload: E,
    /// Capture time, ISO-8601 with millisecond precision.
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    /// Globally unique id.
    pub event_id: EventId,
}

impl<E> EventEnvelope<E> {
    /// Wrap `payload` with a fresh id and the capture time `now`.
    #[must_use]
    pub fn stamp(payload: E, now: DateTime<Utc>) -> Self {
        Self {
            payload,
            timestamp: crate::record::truncate_to_millis(now),
            event_id: EventId::generate(),
        }
    }
}

impl<E: Serialize> EventEnvelope<E> {
    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be
    /// represented as JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }
}

impl<E: DeserializeOwned> EventEnvelope<E> {
    /// Parse JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] for malformed bodies.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// `DateTime<Utc>` as `2024-05-01T10:00:00.000Z`.
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize with millisecond precision and a `Z` suffix.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Parse any RFC 3339 timestamp.
    ///
    /// # Errors
    ///
    /// Fails on strings that are not RFC 3339.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Counted {
        user_id: String,
        total: u32,
    }

    impl Event for Counted {
        fn routing_key(&self) -> &'static str {
            "counted.done"
        }
    }

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn envelope_is_flat_with_iso_timestamp() {
        let envelope = EventEnvelope::stamp(
            Counted {
                user_id: "u1".into(),
                total: 3,
            },
            at(1_714_557_600_123),
        );

        let json: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().expect("serialization should succeed"))
                .expect("valid json");

        assert_eq!(json["userId"], "u1");
        assert_eq!(json["total"], 3);
        assert_eq!(json["timestamp"], "2024-05-01T10:00:00.123Z");
        assert_eq!(json["eventId"], envelope.event_id.as_str());
    }

    #[test]
    fn every_stamp_gets_a_new_id() {
        let payload = Counted {
            user_id: "u1".into(),
            total: 0,
        };
        let a = EventEnvelope::stamp(payload.clone(), at(0));
        let b = EventEnvelope::stamp(payload, at(0));
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn malformed_body_is_a_deserialization_error() {
        let result = EventEnvelope::<Counted>::from_bytes(b"{not json");
        assert!(matches!(result, Err(EventError::DeserializationError(_))));
    }
}
