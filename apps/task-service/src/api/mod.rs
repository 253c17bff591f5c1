//! HTTP API handlers, mounted under `/api`.

pub mod checkout;
pub mod stats;
pub mod tasks;
