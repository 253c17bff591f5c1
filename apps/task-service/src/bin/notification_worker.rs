//! Notification Worker
//!
//! Consumes checkout events from `notification_queue` and notifies the user.
//!
//! # Usage
//!
//! ```bash
//! cargo run --features amqp --bin notification-worker
//! ```

use std::sync::Arc;
use tasksync_amqp::AmqpConnector;
use tasksync_task_service::consumers::{self, LoggingSink};
use tasksync_task_service::{Config, init_tracing, shutdown_signal};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env()?;
    tracing::info!(
        exchange = %config.broker.exchange,
        queue = consumers::NOTIFICATION_QUEUE,
        "Starting notification worker"
    );

    let connector = Arc::new(AmqpConnector::new(config.broker.url.clone()));
    let consumer = consumers::notification_consumer(connector, &config, Arc::new(LoggingSink));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    consumer.run(shutdown_rx).await?;
    tracing::info!("Notification worker stopped");
    Ok(())
}
