//! Bulk completion ("checkout") over one subject's pending records.
//!
//! Checkout snapshots the subject's records that are not yet completed,
//! force-completes each one with an unconditional write, counts them by
//! classification and returns the [`CheckoutEvent`] to publish. Every class
//! known to the domain appears in the summary, with zero when absent, and the
//! event is produced even when nothing was pending.

use crate::event::Event;
use crate::record::{Record, RecordFields, RecordId};
use crate::routing::CHECKOUT_COMPLETED;
use crate::store::{RecordStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Record payloads that can be bulk-completed by checkout.
pub trait Completable: RecordFields {
    /// Owner of the record. `None` means the record is shared by every subject.
    fn subject(&self) -> Option<&str>;

    /// Whether the record is already completed.
    fn is_completed(&self) -> bool;

    /// Class the record is counted under in the checkout summary.
    fn classification(&self) -> &'static str;

    /// Every class, in the order the summary should list them.
    fn classes() -> &'static [&'static str];

    /// Changes that mark the record completed at `at` by `by`.
    fn completion_changes(&self, at: DateTime<Utc>, by: &str) -> Self::Changes;

    /// Whether checkout for `subject` picks this record up.
    fn belongs_to(&self, subject: &str) -> bool {
        self.subject().is_none_or(|owner| owner == subject)
    }
}

/// Published once per checkout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutEvent {
    /// Subject that checked out.
    pub user_id: String,
    /// Number of records completed by this checkout.
    pub total_tasks: u64,
    /// Completed records per class, every class present.
    pub summary: BTreeMap<String, u64>,
    /// Ids of the records completed by this checkout.
    #[serde(default)]
    pub task_ids: Vec<RecordId>,
}

impl CheckoutEvent {
    /// Count of `class` in the summary, 0 if absent.
    #[must_use]
    pub fn count(&self, class: &str) -> u64 {
        self.summary.get(class).copied().unwrap_or(0)
    }
}

impl Event for CheckoutEvent {
    fn routing_key(&self) -> &'static str {
        CHECKOUT_COMPLETED
    }
}

/// Result of [`complete_pending`].
#[derive(Clone, Debug, PartialEq)]
pub struct CheckoutOutcome<F> {
    /// The records as stored after completion.
    pub completed: Vec<Record<F>>,
    /// The event to publish.
    pub event: CheckoutEvent,
}

/// Force-complete every pending record of `subject` and build the event.
///
/// Records deleted between the snapshot and their completion are skipped.
///
/// # Errors
///
/// Returns [`StoreError::Storage`] if the backend fails, or
/// [`StoreError::Validation`] if a completed payload is rejected.
pub async fn complete_pending<F: Completable>(
    store: &RecordStore<F>,
    subject: &str,
    now: DateTime<Utc>,
) -> Result<CheckoutOutcome<F>, StoreError<F>> {
    let pending: Vec<Record<F>> = store
        .list(None)
        .await?
        .into_iter()
        .filter(|record| record.fields.belongs_to(subject) && !record.fields.is_completed())
        .collect();

    let mut completed = Vec::with_capacity(pending.len());
    for record in pending {
        let changes = record.fields.completion_changes(now, subject);
        match store.update(&record.id, changes, None).await {
            Ok(updated) => completed.push(updated),
            Err(StoreError::NotFound(id)) => {
                tracing::debug!(record_id = %id, "Record deleted during checkout, skipping");
            }
            Err(error) => return Err(error),
        }
    }

    let event = summarize(subject, &completed);
    tracing::info!(
        user_id = %subject,
        total_tasks = event.total_tasks,
        "Checkout completed pending records"
    );
    Ok(CheckoutOutcome { completed, event })
}

/// Build the checkout event for `completed`.
#[must_use]
pub fn summarize<F: Completable>(subject: &str, completed: &[Record<F>]) -> CheckoutEvent {
    let mut summary: BTreeMap<String, u64> = F::classes()
        .iter()
        .map(|class| ((*class).to_string(), 0))
        .collect();
    for record in completed {
        *summary
            .entry(record.fields.classification().to_string())
            .or_insert(0) += 1;
    }

    CheckoutEvent {
        user_id: subject.to_string(),
        total_tasks: completed.len() as u64,
        summary,
        task_ids: completed.iter().map(|record| record.id.clone()).collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::record::{NewRecord, Version};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Chore {
        hard: bool,
        owner: Option<String>,
        done: bool,
    }

    impl RecordFields for Chore {
        type Changes = bool;

        fn apply(&mut self, changes: bool) {
            self.done = changes;
        }
    }

    impl Completable for Chore {
        fn subject(&self) -> Option<&str> {
            self.owner.as_deref()
        }

        fn is_completed(&self) -> bool {
            self.done
        }

        fn classification(&self) -> &'static str {
            if self.hard { "hard" } else { "easy" }
        }

        fn classes() -> &'static [&'static str] {
            &["hard", "easy"]
        }

        fn completion_changes(&self, _at: DateTime<Utc>, _by: &str) -> bool {
            true
        }
    }

    fn chore(level: &str, owner: Option<&str>, done: bool) -> NewRecord<Chore> {
        NewRecord::new(Chore {
            hard: level == "hard",
            owner: owner.map(str::to_string),
            done,
        })
    }

    #[tokio::test]
    async fn completes_only_the_subjects_pending_records() {
        let store = RecordStore::in_memory();
        let mine = store.create(chore("hard", Some("u1"), false)).await.unwrap();
        let shared = store.create(chore("easy", None, false)).await.unwrap();
        let theirs = store.create(chore("hard", Some("u2"), false)).await.unwrap();
        let done = store.create(chore("easy", Some("u1"), true)).await.unwrap();

        let outcome = complete_pending(&store, "u1", Utc::now()).await.unwrap();

        assert_eq!(outcome.event.total_tasks, 2);
        assert_eq!(outcome.event.count("hard"), 1);
        assert_eq!(outcome.event.count("easy"), 1);
        for record in &outcome.completed {
            assert!(record.fields.done);
            assert_eq!(record.version, Version::new(2));
        }
        let mut ids = outcome.event.task_ids.clone();
        ids.sort();
        let mut expected = vec![mine.id, shared.id];
        expected.sort();
        assert_eq!(ids, expected);

        assert!(!store.read(&theirs.id).await.unwrap().fields.done);
        assert_eq!(store.read(&done.id).await.unwrap().version, Version::INITIAL);
    }

    #[tokio::test]
    async fn nothing_pending_still_yields_zeroed_event() {
        let store = RecordStore::<Chore>::in_memory();
        let outcome = complete_pending(&store, "u1", Utc::now()).await.unwrap();

        assert!(outcome.completed.is_empty());
        assert_eq!(outcome.event.total_tasks, 0);
        assert_eq!(outcome.event.summary.len(), 2);
        assert!(outcome.event.summary.values().all(|count| *count == 0));
    }

    #[test]
    fn event_wire_shape() {
        let event = summarize::<Chore>("u9", &[]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["userId"], "u9");
        assert_eq!(json["totalTasks"], 0);
        assert_eq!(json["summary"]["hard"], 0);
        assert_eq!(event.routing_key(), "task.checkout.completed");
    }
}
