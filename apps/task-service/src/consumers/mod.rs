//! Downstream consumers of checkout events.
//!
//! Each consumer owns a durable queue bound to `task.checkout.#` on the task
//! exchange, so every checkout reaches both of them.

pub mod analytics;
pub mod notification;

pub use analytics::{ANALYTICS_QUEUE, AnalyticsHandler, AnalyticsState, dashboard_router};
pub use notification::{
    LoggingSink, NOTIFICATION_QUEUE, NotificationHandler, NotificationSink, RecordingSink,
};

use crate::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tasksync_core::broker::Connector;
use tasksync_runtime::consumer::{Consumer, MessageHandler};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Consumer sending notifications through `sink`.
#[must_use]
pub fn notification_consumer(
    connector: Arc<dyn Connector>,
    config: &Config,
    sink: Arc<dyn NotificationSink>,
) -> Consumer<NotificationHandler> {
    let handler = NotificationHandler::new(
        sink,
        Duration::from_millis(config.consumers.notification_delay_ms),
    );
    Consumer::new(
        connector,
        Arc::new(handler),
        config.consumer_settings(NOTIFICATION_QUEUE),
    )
}

/// Consumer folding checkouts into `state`.
#[must_use]
pub fn analytics_consumer(
    connector: Arc<dyn Connector>,
    config: &Config,
    state: AnalyticsState,
) -> Consumer<AnalyticsHandler> {
    let handler = AnalyticsHandler::new(
        state,
        Duration::from_millis(config.consumers.analytics_delay_ms),
    );
    Consumer::new(
        connector,
        Arc::new(handler),
        config.consumer_settings(ANALYTICS_QUEUE),
    )
}

/// Run `consumer` on its own task until shutdown.
///
/// A consumer that exhausts its restarts stops and logs the last failure;
/// it shows up as degraded in the readiness report.
pub fn spawn<H: MessageHandler>(
    consumer: Arc<Consumer<H>>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match consumer.run(shutdown).await {
            Ok(()) => tracing::info!(queue = %consumer.queue(), "Consumer stopped"),
            Err(error) => tracing::error!(
                queue = %consumer.queue(),
                error = %error,
                "Consumer gave up"
            ),
        }
    })
}

/// Both consumers running in this process.
#[derive(Debug)]
pub struct Workers {
    /// Notification consumer
    pub notification: Arc<Consumer<NotificationHandler>>,
    /// Analytics consumer
    pub analytics: Arc<Consumer<AnalyticsHandler>>,
    /// Totals maintained by the analytics consumer
    pub analytics_state: AnalyticsState,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Start both consumers; they stop when `shutdown` flips to `true`.
    #[must_use]
    pub fn start(
        connector: &Arc<dyn Connector>,
        config: &Config,
        sink: Arc<dyn NotificationSink>,
        shutdown: &watch::Receiver<bool>,
    ) -> Self {
        let analytics_state = AnalyticsState::new();
        let notification = Arc::new(notification_consumer(Arc::clone(connector), config, sink));
        let analytics = Arc::new(analytics_consumer(
            Arc::clone(connector),
            config,
            analytics_state.clone(),
        ));

        let handles = vec![
            spawn(Arc::clone(&notification), shutdown.clone()),
            spawn(Arc::clone(&analytics), shutdown.clone()),
        ];

        Self {
            notification,
            analytics,
            analytics_state,
            handles,
        }
    }

    /// Wait for both consumers to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(error) = handle.await {
                tracing::error!(error = %error, "Consumer task panicked");
            }
        }
    }
}
