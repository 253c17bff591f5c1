//! Application state for the task HTTP server.
//!
//! Contains all shared resources needed by HTTP handlers:
//! - Record store (versioned tasks)
//! - Checkout service (bulk completion + event publishing)
//! - Components checked by the readiness endpoint

use super::health::ComponentHealth;
use crate::task::Task;
use std::sync::Arc;
use std::time::Instant;
use tasksync_core::RecordStore;
use tasksync_core::environment::{Clock, SystemClock};
use tasksync_runtime::metrics::MetricsRecorder;
use tasksync_runtime::{CheckoutService, EventPublisher};

/// Application state shared across all HTTP handlers.
///
/// Cloned (cheaply, everything is behind `Arc`) for each request.
#[derive(Clone)]
pub struct AppState {
    /// Versioned task store
    pub store: RecordStore<Task>,
    /// Publisher for checkout events
    pub publisher: Arc<EventPublisher>,
    /// Checkout over the same store
    pub checkout: Arc<CheckoutService<Task>>,
    /// Time source for `serverTime` and liveness
    pub clock: Arc<dyn Clock>,
    /// When the service started
    pub started: Instant,
    /// Prometheus recorder, if this process owns it
    pub metrics: Option<MetricsRecorder>,
    /// Components reported by `/api/ready`
    pub components: Arc<Vec<Arc<dyn ComponentHealth>>>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// The publisher is registered as the first readiness component.
    #[must_use]
    pub fn new(store: RecordStore<Task>, publisher: Arc<EventPublisher>) -> Self {
        let checkout = CheckoutService::new(store.clone(), Arc::clone(&publisher));
        Self {
            store,
            publisher: Arc::clone(&publisher),
            checkout: Arc::new(checkout),
            clock: Arc::new(SystemClock),
            started: Instant::now(),
            metrics: None,
            components: Arc::new(vec![publisher as Arc<dyn ComponentHealth>]),
        }
    }

    /// Use `clock` for checkout timestamps and response times.
    ///
    /// The store keeps the clock it was built with.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let checkout = CheckoutService::new(self.store.clone(), Arc::clone(&self.publisher))
            .with_clock(Arc::clone(&clock));
        self.checkout = Arc::new(checkout);
        self.clock = clock;
        self
    }

    /// Serve `/metrics` from `recorder`.
    #[must_use]
    pub fn with_metrics(mut self, recorder: MetricsRecorder) -> Self {
        self.metrics = Some(recorder);
        self
    }

    /// Add a component to the readiness report.
    #[must_use]
    pub fn with_component(mut self, component: Arc<dyn ComponentHealth>) -> Self {
        Arc::make_mut(&mut self.components).push(component);
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("store", &self.store)
            .field("components", &self.components.len())
            .finish_non_exhaustive()
    }
}
