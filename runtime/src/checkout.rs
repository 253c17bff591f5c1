//! Checkout orchestration: bulk completion, then one published event.

use crate::metrics::CheckoutMetrics;
use crate::publisher::EventPublisher;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tasksync_core::checkout::{CheckoutEvent, Completable, complete_pending};
use tasksync_core::environment::{Clock, SystemClock};
use tasksync_core::event::EventId;
use tasksync_core::{Record, RecordStore, StoreError};

/// What a caller learns about a checkout.
#[derive(Debug, Clone)]
pub struct CheckoutReceipt<F> {
    /// Records completed by this checkout, as stored.
    pub completed: Vec<Record<F>>,
    /// The published (or attempted) event.
    pub event: CheckoutEvent,
    /// Id stamped on the event.
    pub event_id: EventId,
    /// Capture time stamped on the event; clients correlate with it.
    pub timestamp: DateTime<Utc>,
    /// Whether the broker accepted the event.
    pub published: bool,
}

impl<F> CheckoutReceipt<F> {
    /// Number of records completed.
    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.event.total_tasks
    }
}

/// Completes a subject's pending records and announces it.
pub struct CheckoutService<F: Completable> {
    store: RecordStore<F>,
    publisher: Arc<EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl<F: Completable> Clone for CheckoutService<F> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            publisher: Arc::clone(&self.publisher),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<F: Completable> std::fmt::Debug for CheckoutService<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutService")
            .field("exchange", &self.publisher.exchange())
            .finish_non_exhaustive()
    }
}

impl<F: Completable> CheckoutService<F> {
    /// Create a service over `store` publishing through `publisher`.
    #[must_use]
    pub fn new(store: RecordStore<F>, publisher: Arc<EventPublisher>) -> Self {
        Self {
            store,
            publisher,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for `completedAt`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Complete every pending record of `subject` and publish one event.
    ///
    /// A failed publish does not undo the completions; it shows up as
    /// `published = false`.
    ///
    /// # Errors
    ///
    /// Returns the store error if listing or completing records fails. Records
    /// completed before the failure stay completed and no event is published.
    pub async fn checkout(&self, subject: &str) -> Result<CheckoutReceipt<F>, StoreError<F>> {
        let outcome = complete_pending(&self.store, subject, self.clock.now()).await?;
        CheckoutMetrics::record_checkout(outcome.event.total_tasks);

        let receipt = self.publisher.publish(outcome.event.clone()).await;
        if !receipt.accepted {
            tracing::warn!(
                user_id = %subject,
                event_id = %receipt.event_id,
                "Checkout event not delivered to broker"
            );
        }

        Ok(CheckoutReceipt {
            completed: outcome.completed,
            event: outcome.event,
            event_id: receipt.event_id,
            timestamp: receipt.timestamp,
            published: receipt.accepted,
        })
    }
}
