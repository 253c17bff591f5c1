//! Health of the pipeline's moving parts.
//!
//! Each component (publisher, consumers) reports a [`HealthCheck`]; a
//! [`HealthReport`] rolls them up. Statuses are ordered from best to worst so
//! the report's status is simply the maximum.

use serde::Serialize;
use std::fmt;

/// How well a component is doing, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Serving, but a dependency is missing (e.g. the broker is unreachable)
    Degraded,
    /// Not serving
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase name, as serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// `true` only for [`HealthStatus::Healthy`].
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One component's status, with an explanation when it is not healthy.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Component name, e.g. `publisher` or `consumer:analytics_queue`
    pub component: String,
    /// Its status
    pub status: HealthStatus,
    /// Why it is not healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    fn report(component: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message,
        }
    }

    /// A healthy component.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::report(component, HealthStatus::Healthy, None)
    }

    /// A component that still serves but lacks something.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::report(component, HealthStatus::Degraded, Some(message.into()))
    }

    /// A component that has stopped serving.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::report(component, HealthStatus::Unhealthy, Some(message.into()))
    }
}

/// All component checks and the worst of their statuses.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status among `checks`; healthy when there are none
    pub status: HealthStatus,
    /// Per-component results
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Roll up `checks`.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self { status, checks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_takes_worst_status() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("api"),
            HealthCheck::degraded("publisher", "not connected"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);

        let report = HealthReport::new(vec![
            HealthCheck::unhealthy("consumer", "restarts exhausted"),
            HealthCheck::degraded("publisher", "not connected"),
        ]);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn empty_report_is_healthy() {
        assert!(HealthReport::new(Vec::new()).status.is_healthy());
    }

    #[test]
    fn healthy_checks_omit_the_message() {
        let json = serde_json::to_value(HealthCheck::healthy("publisher")).ok();
        assert_eq!(
            json,
            Some(serde_json::json!({"component": "publisher", "status": "healthy"}))
        );
    }
}
