//! Notification consumer: tells a user their checkout went through.
//!
//! Delivery is at-least-once, so a redelivered checkout sends the same
//! notification twice. Sinks that care can deduplicate on the event id.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tasksync_core::checkout::CheckoutEvent;
use tasksync_core::event::{EventEnvelope, EventId};
use tasksync_runtime::consumer::{HandlerError, MessageHandler};
use tokio::sync::Mutex;

/// Queue the notification consumer reads from.
pub const NOTIFICATION_QUEUE: &str = "notification_queue";

/// A message for one user, sent by email and push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Event that triggered the notification
    pub event_id: EventId,
    /// User being notified
    pub user_id: String,
    /// Email address of the user
    pub email: String,
    /// Message text
    pub message: String,
}

impl Notification {
    /// Compose the notification for a checkout.
    #[must_use]
    pub fn for_checkout(envelope: &EventEnvelope<CheckoutEvent>) -> Self {
        let event = &envelope.payload;
        Self {
            event_id: envelope.event_id.clone(),
            user_id: event.user_id.clone(),
            email: format!("user-{}@example.com", event.user_id),
            message: format!("Congratulations! You completed {} tasks!", event.total_tasks),
        }
    }
}

/// Where notifications go.
pub trait NotificationSink: Send + Sync {
    /// Deliver `notification`.
    fn send(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>>;
}

/// Sink that logs what would be sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

impl NotificationSink for LoggingSink {
    fn send(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                event_id = %notification.event_id,
                email = %notification.email,
                "Email sent"
            );
            tracing::info!(user_id = %notification.user_id, "Push notification sent");
            tracing::info!(message = %notification.message, "Notification delivered");
            Ok(())
        })
    }
}

/// Sink that keeps every notification in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far, oldest first.
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

impl NotificationSink for RecordingSink {
    fn send(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            self.sent.lock().await.push(notification);
            Ok(())
        })
    }
}

/// Handles checkout events by notifying the user.
pub struct NotificationHandler {
    sink: Arc<dyn NotificationSink>,
    delay: Duration,
}

impl std::fmt::Debug for NotificationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHandler")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl NotificationHandler {
    /// Notify through `sink`, after a simulated delivery delay.
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>, delay: Duration) -> Self {
        Self { sink, delay }
    }
}

impl MessageHandler for NotificationHandler {
    type Event = CheckoutEvent;

    fn handle(
        &self,
        envelope: EventEnvelope<CheckoutEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                event_id = %envelope.event_id,
                timestamp = %envelope.timestamp,
                user_id = %envelope.payload.user_id,
                total_tasks = envelope.payload.total_tasks,
                urgent = envelope.payload.count("urgent"),
                high = envelope.payload.count("high"),
                medium = envelope.payload.count("medium"),
                low = envelope.payload.count("low"),
                "Checkout received, sending notification"
            );

            tokio::time::sleep(self.delay).await;
            self.sink.send(Notification::for_checkout(&envelope)).await
        })
    }
}
