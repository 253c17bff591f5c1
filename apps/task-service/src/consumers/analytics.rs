//! Analytics consumer: running totals over checkout events.
//!
//! Totals live in memory and are served by a small dashboard router
//! (`GET /dashboard`). A redelivered event is counted again.

use crate::task::Priority;
use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tasksync_core::checkout::CheckoutEvent;
use tasksync_core::event::EventEnvelope;
use tasksync_runtime::consumer::{HandlerError, MessageHandler};
use tokio::sync::RwLock;

/// Queue the analytics consumer reads from.
pub const ANALYTICS_QUEUE: &str = "analytics_queue";

/// Checkouts kept in the history.
pub const HISTORY_LIMIT: usize = 10;

/// One entry of the checkout history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutEntry {
    /// Event capture time, ISO-8601
    pub timestamp: String,
    /// User who checked out
    pub user_id: String,
    /// Tasks completed by the checkout
    pub total_tasks: u64,
}

/// Aggregated checkout statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
    /// Checkouts processed
    pub total_checkouts: u64,
    /// Tasks completed across all checkouts
    pub total_tasks_completed: u64,
    /// Most recent checkouts, newest first
    pub checkout_history: VecDeque<CheckoutEntry>,
    /// Completed tasks per priority
    pub priority_stats: BTreeMap<String, u64>,
}

impl Default for Analytics {
    fn default() -> Self {
        Self {
            total_checkouts: 0,
            total_tasks_completed: 0,
            checkout_history: VecDeque::with_capacity(HISTORY_LIMIT),
            priority_stats: Priority::ALL
                .iter()
                .map(|priority| (priority.as_str().to_string(), 0))
                .collect(),
        }
    }
}

impl Analytics {
    /// Fold one checkout into the totals.
    pub fn record(&mut self, event: &CheckoutEvent, timestamp: DateTime<Utc>) {
        self.total_checkouts = self.total_checkouts.saturating_add(1);
        self.total_tasks_completed = self.total_tasks_completed.saturating_add(event.total_tasks);

        for (class, count) in &event.summary {
            let total = self.priority_stats.entry(class.clone()).or_insert(0);
            *total = total.saturating_add(*count);
        }

        self.checkout_history.push_front(CheckoutEntry {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            user_id: event.user_id.clone(),
            total_tasks: event.total_tasks,
        });
        self.checkout_history.truncate(HISTORY_LIMIT);
    }
}

/// Shared, lockable analytics.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsState {
    inner: Arc<RwLock<Analytics>>,
}

impl AnalyticsState {
    /// Start from zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current totals.
    pub async fn snapshot(&self) -> Analytics {
        self.inner.read().await.clone()
    }

    async fn record(&self, envelope: &EventEnvelope<CheckoutEvent>) -> Analytics {
        let mut analytics = self.inner.write().await;
        analytics.record(&envelope.payload, envelope.timestamp);
        analytics.clone()
    }
}

/// Handles checkout events by updating [`AnalyticsState`].
#[derive(Debug, Clone)]
pub struct AnalyticsHandler {
    state: AnalyticsState,
    delay: Duration,
}

impl AnalyticsHandler {
    /// Update `state`, after a simulated processing delay.
    #[must_use]
    pub const fn new(state: AnalyticsState, delay: Duration) -> Self {
        Self { state, delay }
    }
}

impl MessageHandler for AnalyticsHandler {
    type Event = CheckoutEvent;

    fn handle(
        &self,
        envelope: EventEnvelope<CheckoutEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                event_id = %envelope.event_id,
                timestamp = %envelope.timestamp,
                "Processing checkout analytics"
            );

            tokio::time::sleep(self.delay).await;
            let analytics = self.state.record(&envelope).await;

            tracing::info!(
                total_checkouts = analytics.total_checkouts,
                total_tasks_completed = analytics.total_tasks_completed,
                urgent = analytics.priority_stats.get("urgent").copied().unwrap_or(0),
                high = analytics.priority_stats.get("high").copied().unwrap_or(0),
                medium = analytics.priority_stats.get("medium").copied().unwrap_or(0),
                low = analytics.priority_stats.get("low").copied().unwrap_or(0),
                "Analytics dashboard updated"
            );
            Ok(())
        })
    }
}

/// Dashboard response body.
#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    /// Always `true`
    pub success: bool,
    /// Current totals
    pub analytics: Analytics,
}

/// Current analytics.
///
/// # Endpoint
///
/// ```text
/// GET /dashboard
/// ```
pub async fn dashboard(State(state): State<AnalyticsState>) -> Json<DashboardResponse> {
    Json(DashboardResponse {
        success: true,
        analytics: state.snapshot().await,
    })
}

/// Router serving the dashboard.
pub fn dashboard_router(state: AnalyticsState) -> Router {
    tasksync_web::with_common_layers(Router::new().route("/dashboard", get(dashboard)))
        .with_state(state)
}
