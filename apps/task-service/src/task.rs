//! Task domain: the record payload synced with offline clients.
//!
//! A [`Task`] is the payload of a [`Record`]; the record adds the id, version
//! and timestamps. Clients send [`TaskChanges`] for partial updates, where a
//! field that is absent is left alone and a field set to `null` is cleared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tasksync_core::checkout::Completable;
use tasksync_core::{Record, RecordFields, ValidationError};

/// A stored task: the payload plus sync bookkeeping.
pub type TaskRecord = Record<Task>;

/// Task priority, also the checkout summary class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Needs attention now
    Urgent,
    /// Important
    High,
    /// Normal work
    #[default]
    Medium,
    /// Whenever there is time
    Low,
}

impl Priority {
    /// Every priority, most pressing first.
    pub const ALL: [Self; 4] = [Self::Urgent, Self::High, Self::Medium, Self::Low];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const PRIORITY_CLASSES: [&str; 4] = [
    Priority::Urgent.as_str(),
    Priority::High.as_str(),
    Priority::Medium.as_str(),
    Priority::Low.as_str(),
];

/// Task payload.
///
/// Timestamps the client owns (`completedAt`, `dueDate`) are epoch
/// milliseconds, like the record's own `createdAt`/`updatedAt`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Short title, must not be blank
    #[serde(default)]
    pub title: String,
    /// Free text
    #[serde(default)]
    pub description: String,
    /// Whether the task is done
    #[serde(default)]
    pub completed: bool,
    /// Priority (default: medium)
    #[serde(default)]
    pub priority: Priority,
    /// Photo paths on the client device, as the client encodes them
    #[serde(default)]
    pub photo_paths: String,
    /// When the task was completed
    #[serde(default)]
    pub completed_at: Option<i64>,
    /// Who completed the task
    #[serde(default)]
    pub completed_by: Option<String>,
    /// Latitude of the task location
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Longitude of the task location
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Human readable location
    #[serde(default)]
    pub location_name: Option<String>,
    /// Due date
    #[serde(default)]
    pub due_date: Option<i64>,
    /// Owner; tasks without one are shared by every user
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Task {
    /// A pending task with default fields.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Assign the task to `user_id`.
    #[must_use]
    pub fn owned_by(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Mark the task completed.
    #[must_use]
    pub const fn completed(mut self) -> Self {
        self.completed = true;
        self
    }
}

/// Partial update of a [`Task`].
///
/// Nullable fields are `Option<Option<_>>`: `None` leaves the field alone,
/// `Some(None)` clears it.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskChanges {
    /// New title
    pub title: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New completion flag
    pub completed: Option<bool>,
    /// New priority
    pub priority: Option<Priority>,
    /// New photo paths
    pub photo_paths: Option<String>,
    /// New completion time
    #[serde(default, deserialize_with = "nullable")]
    pub completed_at: Option<Option<i64>>,
    /// New completer
    #[serde(default, deserialize_with = "nullable")]
    pub completed_by: Option<Option<String>>,
    /// New latitude
    #[serde(default, deserialize_with = "nullable")]
    pub latitude: Option<Option<f64>>,
    /// New longitude
    #[serde(default, deserialize_with = "nullable")]
    pub longitude: Option<Option<f64>>,
    /// New location name
    #[serde(default, deserialize_with = "nullable")]
    pub location_name: Option<Option<String>>,
    /// New due date
    #[serde(default, deserialize_with = "nullable")]
    pub due_date: Option<Option<i64>>,
    /// New owner
    #[serde(default, deserialize_with = "nullable")]
    pub user_id: Option<Option<String>>,
}

/// Present-but-null becomes `Some(None)`; absence is handled by `default`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn replace<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl RecordFields for Task {
    type Changes = TaskChanges;

    fn apply(&mut self, changes: TaskChanges) {
        replace(&mut self.title, changes.title);
        replace(&mut self.description, changes.description);
        replace(&mut self.completed, changes.completed);
        replace(&mut self.priority, changes.priority);
        replace(&mut self.photo_paths, changes.photo_paths);
        replace(&mut self.completed_at, changes.completed_at);
        replace(&mut self.completed_by, changes.completed_by);
        replace(&mut self.latitude, changes.latitude);
        replace(&mut self.longitude, changes.longitude);
        replace(&mut self.location_name, changes.location_name);
        replace(&mut self.due_date, changes.due_date);
        replace(&mut self.user_id, changes.user_id);
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::new("title", "Title is required"));
        }
        Ok(())
    }
}

impl Completable for Task {
    fn subject(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn is_completed(&self) -> bool {
        self.completed
    }

    fn classification(&self) -> &'static str {
        self.priority.as_str()
    }

    fn classes() -> &'static [&'static str] {
        &PRIORITY_CLASSES
    }

    fn completion_changes(&self, at: DateTime<Utc>, by: &str) -> TaskChanges {
        TaskChanges {
            completed: Some(true),
            completed_at: Some(Some(at.timestamp_millis())),
            completed_by: Some(Some(by.to_string())),
            ..TaskChanges::default()
        }
    }
}

/// Sample tasks loaded into a fresh store.
#[must_use]
pub fn seed_tasks() -> Vec<Task> {
    vec![
        Task::new("Study offline-first sync")
            .with_description("Implement data synchronization")
            .with_priority(Priority::High),
        Task::new("Set up the sync server")
            .with_description("REST API backend for sync")
            .with_priority(Priority::Medium)
            .completed(),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let task: Task = serde_json::from_value(json!({"title": "Buy milk"})).unwrap();
        assert_eq!(task.priority, Priority::Medium);
        assert!(!task.completed);
        assert_eq!(task.description, "");
        assert_eq!(task.photo_paths, "");
        assert_eq!(task.user_id, None);
    }

    #[test]
    fn test_blank_title_is_rejected() {
        assert!(Task::new("   ").validate().is_err());
        assert!(Task::new("ok").validate().is_ok());
    }

    #[test]
    fn test_absent_and_null_differ() {
        let mut task = Task::new("t").owned_by("u1");
        task.location_name = Some("Office".to_string());

        let changes: TaskChanges =
            serde_json::from_value(json!({"title": "renamed", "locationName": null})).unwrap();
        task.apply(changes);

        assert_eq!(task.title, "renamed");
        assert_eq!(task.location_name, None);
        assert_eq!(task.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_completion_changes() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let mut task = Task::new("t").with_priority(Priority::Urgent);
        task.apply(task.completion_changes(at, "u1"));

        assert!(task.is_completed());
        assert_eq!(task.completed_at, Some(1_700_000_000_000));
        assert_eq!(task.completed_by.as_deref(), Some("u1"));
        assert_eq!(task.classification(), "urgent");
    }

    #[test]
    fn test_shared_tasks_belong_to_everyone() {
        assert!(Task::new("shared").belongs_to("anyone"));
        assert!(Task::new("mine").owned_by("u1").belongs_to("u1"));
        assert!(!Task::new("mine").owned_by("u1").belongs_to("u2"));
    }

    #[test]
    fn test_record_serializes_flat() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let record = Record::new("t1".into(), Task::new("flat"), at);
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["id"], "t1");
        assert_eq!(value["title"], "flat");
        assert_eq!(value["priority"], "medium");
        assert_eq!(value["version"], 1);
        assert_eq!(value["createdAt"], 1_700_000_000_000_i64);
    }
}
