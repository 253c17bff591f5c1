//! HTTP handler building blocks shared by tasksync services.

pub mod health;
pub mod metrics;

pub use health::{liveness, readiness};
