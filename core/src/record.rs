//! Versioned record types.
//!
//! A [`Record`] wraps domain fields with the bookkeeping the sync protocol needs:
//! an immutable id, a version counter and creation/modification timestamps.
//! Domain crates plug their own fields in through [`RecordFields`].
//!
//! Timestamps travel as epoch milliseconds so that a client can hand back the
//! `updatedAt` of the newest record it has seen as its next sync cursor.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `RecordId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid record ID: {0}")]
pub struct ParseRecordIdError(String);

/// Unique, immutable identifier of a record.
///
/// Clients working offline generate their own ids, so any non-empty string is
/// accepted. Server-generated ids are UUID v4.
///
/// # Examples
///
/// ```
/// use tasksync_core::record::RecordId;
///
/// let id = RecordId::new("task-1");
/// assert_eq!(id.as_str(), "task-1");
///
/// let parsed: RecordId = "task-2".parse().unwrap();
/// assert_eq!(parsed, RecordId::new("task-2"));
/// assert!("".parse::<RecordId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new `RecordId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the id into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = ParseRecordIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseRecordIdError("Record ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RecordId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Record version used as the optimistic-concurrency token.
///
/// A freshly created record is at [`Version::INITIAL`] (1). Every successful
/// mutation moves it to [`Version::next`].
///
/// # Examples
///
/// ```
/// use tasksync_core::record::Version;
///
/// let v1 = Version::INITIAL;
/// assert_eq!(v1.value(), 1);
/// assert_eq!(v1.next(), Version::new(2));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of a newly created record.
    pub const INITIAL: Self = Self(1);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A payload field failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Name of the offending field.
    pub field: &'static str,
    /// Human readable reason.
    pub message: String,
}

impl ValidationError {
    /// Create a validation error for `field`.
    #[must_use]
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Domain payload carried by a [`Record`].
///
/// `Changes` is the partial update a client submits; [`RecordFields::apply`]
/// merges it into the current fields. Bookkeeping fields (id, version,
/// timestamps) are never part of the payload, so changes cannot touch them.
pub trait RecordFields:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Partial update type.
    type Changes: Clone + fmt::Debug + Send + Sync + 'static;

    /// Merge `changes` into `self`.
    fn apply(&mut self, changes: Self::Changes);

    /// Check the payload before it is stored.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when a required field is missing or malformed.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Input to [`crate::RecordStore::create`].
#[derive(Clone, Debug, PartialEq)]
pub struct NewRecord<F> {
    /// Client supplied id; generated when absent.
    pub id: Option<RecordId>,
    /// Domain payload.
    pub fields: F,
}

impl<F> NewRecord<F> {
    /// A new record with a server generated id.
    #[must_use]
    pub const fn new(fields: F) -> Self {
        Self { id: None, fields }
    }

    /// A new record with a client supplied id.
    #[must_use]
    pub fn with_id(id: impl Into<RecordId>, fields: F) -> Self {
        Self {
            id: Some(id.into()),
            fields,
        }
    }
}

/// A stored record: domain fields plus sync bookkeeping.
///
/// Serialized flat, e.g. `{"id": "...", "title": "...", "version": 2,
/// "createdAt": 1700000000000, "updatedAt": 1700000000500}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record<F> {
    /// Immutable unique key.
    pub id: RecordId,
    /// Domain payload.
    #[serde(flatten)]
    pub fields: F,
    /// Concurrency token, starts at 1.
    pub version: Version,
    /// Creation time, never changes.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Time of the last successful mutation.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl<F: RecordFields> Record<F> {
    /// Build a record at [`Version::INITIAL`].
    #[must_use]
    pub fn new(id: RecordId, fields: F, now: DateTime<Utc>) -> Self {
        let now = truncate_to_millis(now);
        Self {
            id,
            fields,
            version: Version::INITIAL,
            created_at: now,
            updated_at: now,
        }
    }

    /// Produce the successor of this record after applying `changes`.
    ///
    /// The id and creation time are carried over, the version is bumped by one
    /// and `updated_at` moves strictly forward even if `now` did not.
    #[must_use]
    pub fn successor(&self, changes: F::Changes, now: DateTime<Utc>) -> Self {
        let mut fields = self.fields.clone();
        fields.apply(changes);
        Self {
            id: self.id.clone(),
            fields,
            version: self.version.next(),
            created_at: self.created_at,
            updated_at: next_timestamp(self.updated_at, now),
        }
    }

    /// `updatedAt` in epoch milliseconds.
    #[must_use]
    pub fn updated_at_millis(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }
}

/// Drop sub-millisecond precision so stored values survive the wire format.
#[must_use]
pub fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// The modification time following `previous`: `now`, or one millisecond past
/// `previous` when the clock has not advanced.
#[must_use]
pub fn next_timestamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = truncate_to_millis(now);
    if now > previous {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl RecordFields for Note {
        type Changes = String;

        fn apply(&mut self, changes: String) {
            self.text = changes;
        }
    }

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }

    #[test]
    fn new_record_starts_at_version_one() {
        let record = Record::new(RecordId::new("n1"), Note { text: "a".into() }, at(1_000));
        assert_eq!(record.version, Version::INITIAL);
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn successor_bumps_version_and_keeps_identity() {
        let record = Record::new(RecordId::new("n1"), Note { text: "a".into() }, at(1_000));
        let next = record.successor("b".to_string(), at(2_000));

        assert_eq!(next.id, record.id);
        assert_eq!(next.created_at, record.created_at);
        assert_eq!(next.version, Version::new(2));
        assert_eq!(next.fields.text, "b");
        assert_eq!(next.updated_at, at(2_000));
    }

    #[test]
    fn successor_moves_time_forward_when_clock_stalls() {
        let record = Record::new(RecordId::new("n1"), Note { text: "a".into() }, at(5_000));
        let next = record.successor("b".to_string(), at(4_000));
        assert_eq!(next.updated_at, at(5_001));
    }

    #[test]
    fn serializes_flat_with_millisecond_timestamps() {
        let record = Record::new(RecordId::new("n1"), Note { text: "a".into() }, at(1_500));
        let json = serde_json::to_value(&record).unwrap_or_default();

        assert_eq!(json["id"], "n1");
        assert_eq!(json["text"], "a");
        assert_eq!(json["version"], 1);
        assert_eq!(json["createdAt"], 1_500);
        assert_eq!(json["updatedAt"], 1_500);
    }

    #[test]
    fn record_id_rejects_blank_input() {
        assert!("  ".parse::<RecordId>().is_err());
    }
}
