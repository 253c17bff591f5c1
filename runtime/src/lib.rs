//! # tasksync runtime
//!
//! Runtime pieces of the tasksync event pipeline.
//!
//! ## Core Components
//!
//! - **[`publisher::EventPublisher`]**: stamps, serializes and publishes events;
//!   degrades to a reported no-op while the broker is unreachable
//! - **[`consumer::Consumer`]**: one supervised, cancellable consumer per queue
//!   with manual ack/nack and restart-with-backoff
//! - **[`checkout::CheckoutService`]**: bulk completion followed by one event
//! - **[`metrics`]**: Prometheus recorders
//! - **[`health`]**: per-component checks rolled up for `/api/ready`
//! - **[`retry`]**: backoff for reconnects and session restarts
//!
//! ## Example
//!
//! ```ignore
//! use tasksync_runtime::consumer::{Consumer, ConsumerSettings};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let consumer = Consumer::new(connector, handler, ConsumerSettings::new(binding));
//! let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });
//!
//! // Later
//! shutdown_tx.send(true)?;
//! task.await??;
//! ```

pub mod checkout;
pub mod consumer;
pub mod health;
pub mod metrics;
pub mod publisher;
pub mod retry;

pub use checkout::{CheckoutReceipt, CheckoutService};
pub use consumer::{
    Consumer, ConsumerError, ConsumerSettings, ConsumerState, HandlerError, MessageHandler,
    RedeliveryPolicy,
};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use publisher::{EventPublisher, PublishReceipt};

/// Resolve when `shutdown` flips to `true` or its sender is gone.
pub async fn shutdown_signalled(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)] // Test code can use panic
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_resolves_on_true_or_dropped_sender() {
        let (tx, mut rx) = tokio::sync::watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_signalled(&mut rx).await });
        tx.send_replace(true);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_else(|| panic!("shutdown not observed"));

        let (tx, mut rx) = tokio::sync::watch::channel(false);
        drop(tx);
        shutdown_signalled(&mut rx).await;
    }
}
