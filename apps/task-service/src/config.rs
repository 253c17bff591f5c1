//! Configuration management for the task service.
//!
//! Loads configuration from environment variables with local defaults.
//! Unlike plain string settings, numeric values that fail to parse are
//! reported instead of silently replaced by the default.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tasksync_core::broker::QueueBinding;
use tasksync_core::routing::CHECKOUT_ALL;
use tasksync_runtime::consumer::{ConsumerSettings, RedeliveryPolicy};
use tasksync_runtime::retry::RetryPolicy;
use thiserror::Error;

/// Errors raised while reading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set to a value of the wrong shape.
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Raw value found.
        value: String,
        /// Parser message.
        reason: String,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Message broker configuration
    pub broker: BrokerConfig,
    /// Consumer configuration (notification + analytics)
    pub consumers: ConsumerConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port of the task API
    pub port: u16,
    /// Port of the analytics dashboard
    pub analytics_port: u16,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// AMQP URL, e.g. `amqp://localhost:5672`
    pub url: String,
    /// Topic exchange checkout events are published to
    pub exchange: String,
}

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries per consumer (default: 1)
    pub prefetch: u16,
    /// Pause before reconnecting after the broker closed a session (default: 5000 ms)
    pub reconnect_delay_ms: u64,
    /// Consecutive failed sessions tolerated before a consumer gives up (default: 5)
    pub max_session_restarts: u32,
    /// Failed attempts per message before it is dropped; unset means requeue forever
    pub max_redeliveries: Option<u32>,
    /// Simulated delivery time of a notification (default: 1000 ms)
    pub notification_delay_ms: u64,
    /// Simulated processing time of an analytics update (default: 800 ms)
    pub analytics_delay_ms: u64,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a numeric variable does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        Ok(Self {
            server: ServerConfig {
                host: string("HOST", "0.0.0.0"),
                port: parse(&lookup, "PORT", 3000)?,
                analytics_port: parse(&lookup, "ANALYTICS_PORT", 3001)?,
            },
            broker: BrokerConfig {
                url: string("AMQP_URL", "amqp://localhost:5672"),
                exchange: string("EVENT_EXCHANGE", "task_events"),
            },
            consumers: ConsumerConfig {
                prefetch: parse(&lookup, "CONSUMER_PREFETCH", 1)?,
                reconnect_delay_ms: parse(&lookup, "RECONNECT_DELAY_MS", 5000)?,
                max_session_restarts: parse(&lookup, "MAX_SESSION_RESTARTS", 5)?,
                max_redeliveries: parse_optional(&lookup, "MAX_REDELIVERIES")?,
                notification_delay_ms: parse(&lookup, "NOTIFICATION_DELAY_MS", 1000)?,
                analytics_delay_ms: parse(&lookup, "ANALYTICS_DELAY_MS", 800)?,
            },
        })
    }

    /// Interval between publisher reconnect attempts.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.consumers.reconnect_delay_ms)
    }

    /// Consumer settings for `queue`, bound to every checkout event.
    #[must_use]
    pub fn consumer_settings(&self, queue: &str) -> ConsumerSettings {
        let binding = QueueBinding::new(self.broker.exchange.clone(), CHECKOUT_ALL, queue);
        let redelivery = self
            .consumers
            .max_redeliveries
            .map_or(RedeliveryPolicy::Unbounded, |max_attempts| {
                RedeliveryPolicy::Bounded { max_attempts }
            });

        ConsumerSettings::new(binding)
            .prefetch(self.consumers.prefetch)
            .reconnect_delay(self.reconnect_delay())
            .restart_policy(
                RetryPolicy::builder()
                    .max_retries(self.consumers.max_session_restarts)
                    .build(),
            )
            .redelivery(redelivery)
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(lookup, name)?.unwrap_or(default))
}

fn parse_optional<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(name).filter(|value| !value.trim().is_empty()) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    match parsed {
        Ok(parsed) => Ok(Some(parsed)),
        Err(error) => Err(ConfigError::Invalid {
            name,
            reason: error.to_string(),
            value,
        }),
    }
}
