//! Versioned record store with optimistic conflict detection.
//!
//! Every mutation may carry the version the client last saw. When it does and
//! the stored version has moved on, the mutation is refused with
//! [`StoreError::Conflict`] carrying the current server record, so the client
//! can merge and retry. Without an expected version the write is
//! last-writer-wins.
//!
//! The read-check-write cycle is a loop over [`RecordStorage::compare_and_swap`]:
//! no lock is held across an `.await`, and two writers holding the same
//! expected version can never both succeed.

use crate::checkout::Completable;
use crate::environment::{Clock, SystemClock};
use crate::record::{NewRecord, Record, RecordFields, RecordId, ValidationError, Version};
use crate::storage::{InMemoryStorage, RecordStorage, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`RecordStore`] operations.
#[derive(Error, Debug)]
pub enum StoreError<F: RecordFields> {
    /// No record with this id.
    #[error("Record not found: {0}")]
    NotFound(RecordId),

    /// The caller's expected version is stale.
    #[error("Version conflict on record {}: server is at version {}", server.id, server.version)]
    Conflict {
        /// Current server state, returned so the client can reconcile.
        server: Box<Record<F>>,
    },

    /// The payload was rejected.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl<F: RecordFields> StoreError<F> {
    /// The server record attached to a conflict.
    #[must_use]
    pub fn server_record(&self) -> Option<&Record<F>> {
        match self {
            Self::Conflict { server } => Some(server),
            _ => None,
        }
    }
}

impl<F: RecordFields> From<StorageError<F>> for StoreError<F> {
    fn from(error: StorageError<F>) -> Self {
        match error {
            StorageError::NotFound(id) => Self::NotFound(id),
            StorageError::AlreadyExists(server)
            | StorageError::VersionMismatch {
                current: server, ..
            } => Self::Conflict { server },
            StorageError::Backend(message) => Self::Storage(message),
        }
    }
}

/// Incremental-sync watermark: the newest `updatedAt` (epoch millis) a client
/// has already seen. Not persisted server side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncCursor(i64);

impl SyncCursor {
    /// Cursor at `millis` since the epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Epoch milliseconds.
    #[must_use]
    pub const fn millis(self) -> i64 {
        self.0
    }
}

/// Counters over the whole store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Number of records.
    pub total: usize,
    /// Records marked completed.
    pub completed: usize,
    /// Records not yet completed.
    pub pending: usize,
    /// Newest `updatedAt` in epoch millis, 0 when empty.
    pub last_sync: i64,
}

/// In-memory versioned keyed store over an injectable [`RecordStorage`].
///
/// # Example
///
/// ```
/// use tasksync_core::{NewRecord, RecordStore, Version};
/// # use tasksync_core::record::RecordFields;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// # struct Note { text: String }
/// # impl RecordFields for Note {
/// #     type Changes = String;
/// #     fn apply(&mut self, changes: String) { self.text = changes; }
/// # }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RecordStore::in_memory();
/// let created = store.create(NewRecord::new(Note { text: "A".into() })).await?;
/// assert_eq!(created.version, Version::INITIAL);
///
/// let updated = store.update(&created.id, "B".into(), Some(created.version)).await?;
/// assert_eq!(updated.version, Version::new(2));
///
/// // A second writer still holding version 1 is refused.
/// let err = store.update(&created.id, "C".into(), Some(created.version)).await;
/// assert!(err.is_err());
/// # Ok(())
/// # }
/// ```
pub struct RecordStore<F: RecordFields> {
    storage: Arc<dyn RecordStorage<F>>,
    clock: Arc<dyn Clock>,
}

impl<F: RecordFields> Clone for RecordStore<F> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<F: RecordFields> std::fmt::Debug for RecordStore<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

impl<F: RecordFields> RecordStore<F> {
    /// Create a store over `storage`, stamping times with `clock`.
    #[must_use]
    pub fn new(storage: Arc<dyn RecordStorage<F>>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Store backed by [`InMemoryStorage`] and the system clock.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStorage::new()), Arc::new(SystemClock))
    }

    /// Create a record at version 1. An id is generated when none is given.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Validation`] if the payload is rejected
    /// - [`StoreError::Conflict`] if the client supplied id is already taken
    pub async fn create(&self, new: NewRecord<F>) -> Result<Record<F>, StoreError<F>> {
        new.fields.validate()?;
        let id = new.id.unwrap_or_else(RecordId::generate);
        let record = Record::new(id, new.fields, self.clock.now());

        self.storage.insert(record.clone()).await?;
        tracing::debug!(record_id = %record.id, "Record created");
        Ok(record)
    }

    /// Read one record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record has this id.
    pub async fn read(&self, id: &RecordId) -> Result<Record<F>, StoreError<F>> {
        self.storage
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// List records, newest modification first.
    ///
    /// With a cursor only records modified strictly after it are returned, in
    /// the same relative order as the unfiltered listing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn list(&self, since: Option<SyncCursor>) -> Result<Vec<Record<F>>, StoreError<F>> {
        let mut records = self.storage.list().await?;
        if let Some(cursor) = since {
            records.retain(|record| record.updated_at_millis() > cursor.millis());
        }
        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    /// Apply `changes` to a record.
    ///
    /// With `expected` the write only succeeds if the stored version equals it.
    /// Without it the write is unconditional but still bumps the version.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the record does not exist
    /// - [`StoreError::Conflict`] with the server record if `expected` is stale
    /// - [`StoreError::Validation`] if the merged payload is rejected
    pub async fn update(
        &self,
        id: &RecordId,
        changes: F::Changes,
        expected: Option<Version>,
    ) -> Result<Record<F>, StoreError<F>> {
        loop {
            let current = self.read(id).await?;
            check_expected(&current, expected)?;

            let next = current.successor(changes.clone(), self.clock.now());
            next.fields.validate()?;

            match self
                .storage
                .compare_and_swap(current.version, next.clone())
                .await
            {
                Ok(()) => {
                    tracing::debug!(record_id = %id, version = %next.version, "Record updated");
                    return Ok(next);
                }
                // Lost a race with another unconditional writer: re-read and retry.
                Err(StorageError::VersionMismatch { .. }) if expected.is_none() => {}
                Err(error) => return Err(conflict_logged(error.into())),
            }
        }
    }

    /// Hard-delete a record, returning its last state.
    ///
    /// Same version policy as [`RecordStore::update`].
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the record does not exist
    /// - [`StoreError::Conflict`] with the server record if `expected` is stale
    pub async fn delete(
        &self,
        id: &RecordId,
        expected: Option<Version>,
    ) -> Result<Record<F>, StoreError<F>> {
        loop {
            let current = self.read(id).await?;
            check_expected(&current, expected)?;

            match self.storage.remove_if(id, current.version).await {
                Ok(removed) => {
                    tracing::debug!(record_id = %id, "Record deleted");
                    return Ok(removed);
                }
                Err(StorageError::VersionMismatch { .. }) if expected.is_none() => {}
                Err(error) => return Err(conflict_logged(error.into())),
            }
        }
    }

    /// Newest `updatedAt` across every record in epoch millis, 0 when empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn last_sync(&self) -> Result<i64, StoreError<F>> {
        let records = self.storage.list().await?;
        Ok(records
            .iter()
            .map(Record::updated_at_millis)
            .max()
            .unwrap_or(0))
    }
}

impl<F: Completable> RecordStore<F> {
    /// Totals over the whole store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn stats(&self) -> Result<StoreStats, StoreError<F>> {
        let records = self.storage.list().await?;
        let completed = records
            .iter()
            .filter(|record| record.fields.is_completed())
            .count();
        Ok(StoreStats {
            total: records.len(),
            completed,
            pending: records.len() - completed,
            last_sync: records
                .iter()
                .map(Record::updated_at_millis)
                .max()
                .unwrap_or(0),
        })
    }
}

fn check_expected<F: RecordFields>(
    current: &Record<F>,
    expected: Option<Version>,
) -> Result<(), StoreError<F>> {
    match expected {
        Some(version) if version != current.version => Err(conflict_logged(StoreError::Conflict {
            server: Box::new(current.clone()),
        })),
        _ => Ok(()),
    }
}

fn conflict_logged<F: RecordFields>(error: StoreError<F>) -> StoreError<F> {
    if let StoreError::Conflict { server } = &error {
        tracing::info!(
            record_id = %server.id,
            server_version = %server.version,
            "Rejected stale write"
        );
    }
    error
}
