//! # tasksync core
//!
//! Core types and traits shared by every tasksync service.
//!
//! The crate holds the two pieces with real protocol content:
//!
//! - **Versioned records** ([`record`], [`storage`], [`store`]): an offline-first
//!   keyed store where every mutation carries an optional expected version and
//!   stale writers receive the current server record instead of overwriting it.
//! - **Event pipeline contract** ([`event`], [`routing`], [`broker`], [`checkout`]):
//!   the envelope published for checkout events, the topic routing rules, and the
//!   channel/delivery traits a broker adapter implements.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   expected version   ┌──────────────┐   CAS    ┌───────────────┐
//! │ HTTP client  │ ───────────────────▶ │ RecordStore  │ ───────▶ │ RecordStorage │
//! └──────────────┘   409 + serverRecord └──────┬───────┘          └───────────────┘
//!                                              │ checkout
//!                                              ▼
//!                                       ┌──────────────┐  topic   ┌──────────────┐
//!                                       │  Publisher   │ ───────▶ │   Broker     │
//!                                       └──────────────┘          └──────┬───────┘
//!                                                                 ┌──────┴───────┐
//!                                                                 ▼              ▼
//!                                                          notification     analytics
//! ```

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod broker;
pub mod checkout;
pub mod event;
pub mod record;
pub mod routing;
pub mod storage;
pub mod store;

pub use record::{NewRecord, Record, RecordFields, RecordId, ValidationError, Version};
pub use storage::{InMemoryStorage, RecordStorage, StorageError};
pub use store::{RecordStore, StoreError, StoreStats, SyncCursor};

/// Environment traits injected into the store and the publisher.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use tasksync_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
