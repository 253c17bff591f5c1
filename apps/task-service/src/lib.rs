//! # Task Service
//!
//! Offline-first task sync API with a checkout pipeline, built on tasksync.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  versioned CRUD   ┌─────────────┐
//! │  clients   │ ────────────────▶ │  task-api   │
//! └────────────┘  POST /checkout   └──────┬──────┘
//!                                         │ task.checkout.completed
//!                                         ▼
//!                                  ┌─────────────┐
//!                                  │ task_events │ (topic exchange)
//!                                  └──────┬──────┘
//!                         task.checkout.# │ task.checkout.#
//!                    ┌────────────────────┴────────────────────┐
//!                    ▼                                         ▼
//!           notification_queue                         analytics_queue
//!          (notification-worker)                     (analytics-worker)
//! ```
//!
//! ## Deployment
//!
//! - `task-api`: HTTP API and publisher. Without the `amqp` feature it runs
//!   an in-process broker and both consumers, so the whole pipeline works in
//!   one process. That broker is the in-memory one from `tasksync-testing`,
//!   pulled in only by the default `in-process` feature; build with
//!   `--no-default-features --features amqp` to leave it out.
//! - `notification-worker`, `analytics-worker` (feature `amqp`): consumers
//!   connected to `RabbitMQ`.

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod config;
pub mod consumers;
pub mod server;
pub mod task;

pub use config::{Config, ConfigError};
pub use server::{AppState, build_router, shutdown_signal};
pub use task::{Priority, Task, TaskChanges, TaskRecord};

use tasksync_core::{NewRecord, RecordStore, StoreError};

/// Initialize tracing for a binary: `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the sample tasks into `store`.
///
/// # Errors
///
/// Returns the store error if a sample task is rejected.
pub async fn seed(store: &RecordStore<Task>) -> Result<(), StoreError<Task>> {
    for task in task::seed_tasks() {
        store.create(NewRecord::new(task)).await?;
    }
    tracing::info!("Sample tasks created");
    Ok(())
}
