//! Storage abstraction behind the record store.
//!
//! [`RecordStorage`] is deliberately small: point reads, a full scan, an insert
//! that refuses to overwrite, and two conditional writes keyed on the stored
//! version. Any backend that can do an atomic compare-and-swap on one key can
//! implement it, and the version-check contract of [`crate::RecordStore`] holds
//! on top of it.
//!
//! # Implementations
//!
//! - [`InMemoryStorage`]: `HashMap` behind a lock, the default backend.
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so that the
//! store can hold an `Arc<dyn RecordStorage<F>>`.

use crate::record::{Record, RecordFields, RecordId, Version};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T, F> =
    Pin<Box<dyn Future<Output = Result<T, StorageError<F>>> + Send + 'a>>;

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError<F: RecordFields> {
    /// No record with this id.
    #[error("Record not found: {0}")]
    NotFound(RecordId),

    /// Insert refused because the id is taken.
    #[error("Record already exists: {}", .0.id)]
    AlreadyExists(Box<Record<F>>),

    /// Conditional write refused: the stored version moved.
    #[error("Version mismatch for record {}: expected {expected}, found {}", current.id, current.version)]
    VersionMismatch {
        /// Version the caller based its write on.
        expected: Version,
        /// What is stored right now.
        current: Box<Record<F>>,
    },

    /// Backend failure (connection, I/O, serialization).
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Keyed storage with compare-and-swap semantics.
///
/// # Atomicity
///
/// [`RecordStorage::compare_and_swap`] and [`RecordStorage::remove_if`] must
/// check the stored version and write in one atomic step with respect to every
/// other writer of the same id.
pub trait RecordStorage<F: RecordFields>: Send + Sync {
    /// Load one record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the backend fails.
    fn get(&self, id: &RecordId) -> StorageFuture<'_, Option<Record<F>>, F>;

    /// Load every record, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the backend fails.
    fn list(&self) -> StorageFuture<'_, Vec<Record<F>>, F>;

    /// Store a record under a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] with the stored record if the id
    /// is taken.
    fn insert(&self, record: Record<F>) -> StorageFuture<'_, (), F>;

    /// Replace the stored record if its version is still `expected`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the record is gone
    /// - [`StorageError::VersionMismatch`] with the stored record otherwise
    fn compare_and_swap(&self, expected: Version, record: Record<F>)
    -> StorageFuture<'_, (), F>;

    /// Delete the stored record if its version is still `expected`, returning it.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the record is gone
    /// - [`StorageError::VersionMismatch`] with the stored record otherwise
    fn remove_if(&self, id: &RecordId, expected: Version) -> StorageFuture<'_, Record<F>, F>;
}

/// `HashMap`-backed storage. Lives as long as the process.
///
/// # Example
///
/// ```
/// use tasksync_core::storage::{InMemoryStorage, RecordStorage};
/// # use tasksync_core::record::{Record, RecordFields, RecordId};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// # struct Note { text: String }
/// # impl RecordFields for Note {
/// #     type Changes = String;
/// #     fn apply(&mut self, changes: String) { self.text = changes; }
/// # }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = InMemoryStorage::<Note>::new();
/// let record = Record::new(RecordId::new("n1"), Note { text: "hi".into() }, chrono::Utc::now());
/// storage.insert(record).await?;
/// assert!(storage.get(&RecordId::new("n1")).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryStorage<F> {
    records: Arc<RwLock<HashMap<RecordId, Record<F>>>>,
}

impl<F> Clone for InMemoryStorage<F> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl<F> Default for InMemoryStorage<F> {
    fn default() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<F> InMemoryStorage<F> {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the storage holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: RecordFields> RecordStorage<F> for InMemoryStorage<F> {
    fn get(&self, id: &RecordId) -> StorageFuture<'_, Option<Record<F>>, F> {
        let found = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        Box::pin(async move { Ok(found) })
    }

    fn list(&self) -> StorageFuture<'_, Vec<Record<F>>, F> {
        let all: Vec<Record<F>> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        Box::pin(async move { Ok(all) })
    }

    fn insert(&self, record: Record<F>) -> StorageFuture<'_, (), F> {
        let result = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = records.get(&record.id) {
                Err(StorageError::AlreadyExists(Box::new(existing.clone())))
            } else {
                records.insert(record.id.clone(), record);
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn compare_and_swap(
        &self,
        expected: Version,
        record: Record<F>,
    ) -> StorageFuture<'_, (), F> {
        let result = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            match records.get_mut(&record.id) {
                None => Err(StorageError::NotFound(record.id)),
                Some(current) if current.version != expected => Err(StorageError::VersionMismatch {
                    expected,
                    current: Box::new(current.clone()),
                }),
                Some(current) => {
                    *current = record;
                    Ok(())
                }
            }
        };
        Box::pin(async move { result })
    }

    fn remove_if(&self, id: &RecordId, expected: Version) -> StorageFuture<'_, Record<F>, F> {
        let result = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            match records.get(id) {
                None => Err(StorageError::NotFound(id.clone())),
                Some(current) if current.version != expected => Err(StorageError::VersionMismatch {
                    expected,
                    current: Box::new(current.clone()),
                }),
                Some(_) => records
                    .remove(id)
                    .ok_or_else(|| StorageError::NotFound(id.clone())),
            }
        };
        Box::pin(async move { result })
    }
}
