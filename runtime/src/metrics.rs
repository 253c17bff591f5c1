//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for:
//! - Record store mutations and conflicts
//! - Event publishing
//! - Consumer deliveries, acknowledgements and session restarts
//! - Checkouts
//!
//! # Example
//!
//! ```rust,no_run
//! use tasksync_runtime::metrics::{MetricsRecorder, PublisherMetrics};
//!
//! let recorder = MetricsRecorder::install()?;
//! PublisherMetrics::record_unavailable();
//!
//! // Serve this from GET /metrics
//! let body = recorder.render();
//! # Ok::<(), tasksync_runtime::metrics::MetricsError>(())
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installed Prometheus recorder.
///
/// The process-wide recorder can only be installed once; keep the returned
/// value and render from it.
#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder").finish_non_exhaustive()
    }
}

impl MetricsRecorder {
    /// Register metric descriptions and install the global recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a recorder is already installed.
    pub fn install() -> Result<Self, MetricsError> {
        let builder = PrometheusBuilder::new()
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = builder
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();
        tracing::info!("Prometheus recorder installed");
        Ok(Self { handle })
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Record Store Metrics
    describe_counter!(
        "record_store_mutations_total",
        "Successful record mutations, labelled by operation"
    );
    describe_counter!(
        "record_store_conflicts_total",
        "Mutations refused because the expected version was stale"
    );

    // Publisher Metrics
    describe_counter!(
        "event_publisher_published_total",
        "Events accepted by the broker"
    );
    describe_counter!(
        "event_publisher_unavailable_total",
        "Events dropped because no broker connection was available"
    );
    describe_counter!(
        "event_publisher_errors_total",
        "Events the broker refused"
    );
    describe_histogram!(
        "event_publisher_publish_duration_seconds",
        "Time to hand an event to the broker"
    );

    // Consumer Metrics
    describe_counter!(
        "event_consumer_deliveries_total",
        "Deliveries received, labelled by queue"
    );
    describe_counter!(
        "event_consumer_acks_total",
        "Deliveries acknowledged after successful processing"
    );
    describe_counter!(
        "event_consumer_requeues_total",
        "Deliveries nacked with requeue after a processing failure"
    );
    describe_counter!(
        "event_consumer_rejects_total",
        "Deliveries dropped after exhausting the redelivery limit"
    );
    describe_counter!(
        "event_consumer_session_restarts_total",
        "Consumer sessions restarted after a close or connection error"
    );
    describe_gauge!(
        "event_consumer_state",
        "Consumer state: 0 disconnected, 1 connecting, 2 bound, 3 consuming, 4 nack-requeued"
    );
    describe_histogram!(
        "event_consumer_handle_duration_seconds",
        "Time spent in the message handler"
    );

    // Checkout Metrics
    describe_counter!("checkout_total", "Checkouts performed");
    describe_counter!(
        "checkout_completed_records_total",
        "Records force-completed by checkouts"
    );
}

/// Record store metrics recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record a successful mutation (`create`, `update` or `delete`).
    pub fn record_mutation(operation: &'static str) {
        counter!("record_store_mutations_total", "operation" => operation).increment(1);
    }

    /// Record a refused stale write.
    pub fn record_conflict(operation: &'static str) {
        counter!("record_store_conflicts_total", "operation" => operation).increment(1);
    }
}

/// Event publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record an accepted publish.
    pub fn record_publish(duration: Duration) {
        counter!("event_publisher_published_total").increment(1);
        histogram!("event_publisher_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish skipped for lack of a connection.
    pub fn record_unavailable() {
        counter!("event_publisher_unavailable_total").increment(1);
    }

    /// Record a publish refused by the broker.
    pub fn record_error() {
        counter!("event_publisher_errors_total").increment(1);
    }
}

/// Event consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a received delivery.
    pub fn record_delivery(queue: &str, redelivered: bool) {
        counter!(
            "event_consumer_deliveries_total",
            "queue" => queue.to_string(),
            "redelivered" => if redelivered { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Record a processed and acknowledged delivery.
    pub fn record_ack(queue: &str, duration: Duration) {
        counter!("event_consumer_acks_total", "queue" => queue.to_string()).increment(1);
        histogram!("event_consumer_handle_duration_seconds", "queue" => queue.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a delivery put back on the queue.
    pub fn record_requeue(queue: &str) {
        counter!("event_consumer_requeues_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a delivery dropped for good.
    pub fn record_reject(queue: &str) {
        counter!("event_consumer_rejects_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a session restart.
    pub fn record_restart(queue: &str) {
        counter!("event_consumer_session_restarts_total", "queue" => queue.to_string())
            .increment(1);
    }

    /// Record the consumer state as a number.
    pub fn record_state(queue: &str, state: f64) {
        gauge!("event_consumer_state", "queue" => queue.to_string()).set(state);
    }
}

/// Checkout metrics recorder.
pub struct CheckoutMetrics;

impl CheckoutMetrics {
    /// Record a checkout and how many records it completed.
    pub fn record_checkout(completed: u64) {
        counter!("checkout_total").increment(1);
        counter!("checkout_completed_records_total").increment(completed);
    }
}
