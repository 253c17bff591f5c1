//! Event publisher.
//!
//! [`EventPublisher::publish`] stamps a fresh event id and capture time,
//! serializes the envelope to JSON and hands it to the broker as a persistent
//! `application/json` message. It never fails: when no channel is available,
//! or the broker refuses the message, it logs, counts the miss and reports
//! `accepted = false` in the [`PublishReceipt`]. The mutation that produced the
//! event stands either way.
//!
//! A connection lost mid-publish clears the channel; the reconnect loop
//! ([`EventPublisher::run_reconnect_loop`]) brings it back.

use crate::metrics::PublisherMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::{HealthCheck, shutdown_signalled};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tasksync_core::broker::{BrokerError, Channel, Connector, OutboundMessage};
use tasksync_core::environment::{Clock, SystemClock};
use tasksync_core::event::{Event, EventEnvelope, EventId};
use tokio::sync::{RwLock, watch};

/// Outcome of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Id stamped on the event.
    pub event_id: EventId,
    /// Capture time stamped on the event.
    pub timestamp: DateTime<Utc>,
    /// Whether the broker accepted the message.
    pub accepted: bool,
}

/// Publishes events to one topic exchange.
pub struct EventPublisher {
    connector: Arc<dyn Connector>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    exchange: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("exchange", &self.exchange)
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    /// Create a disconnected publisher for `exchange`.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, exchange: impl Into<String>) -> Self {
        Self {
            connector,
            channel: RwLock::new(None),
            exchange: exchange.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp events with `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Exchange events are published to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Open a channel and assert the exchange.
    ///
    /// # Errors
    ///
    /// Returns the broker error if connecting or declaring fails.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let channel = self.connector.connect().await?;
        channel.declare_exchange(&self.exchange).await?;
        *self.channel.write().await = Some(channel);
        tracing::info!(exchange = %self.exchange, "Publisher connected to broker");
        Ok(())
    }

    /// [`EventPublisher::connect`], retrying connection errors with backoff.
    ///
    /// # Errors
    ///
    /// Returns the last error once `policy` is exhausted, or the first
    /// non-connection error.
    pub async fn connect_with_retry(&self, policy: &RetryPolicy) -> Result<(), BrokerError> {
        retry_with_predicate(policy, || self.connect(), BrokerError::is_connection_error).await
    }

    /// Close the channel, if any.
    pub async fn disconnect(&self) {
        let channel = self.channel.write().await.take();
        if let Some(channel) = channel {
            if let Err(error) = channel.close().await {
                tracing::debug!(error = %error, "Error closing publisher channel");
            }
            tracing::info!(exchange = %self.exchange, "Publisher disconnected");
        }
    }

    /// Whether a usable channel is held.
    pub async fn is_connected(&self) -> bool {
        self.channel
            .read()
            .await
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Publish `event` under its routing key.
    pub async fn publish<E: Event>(&self, event: E) -> PublishReceipt {
        let routing_key = event.routing_key();
        self.publish_to(routing_key, event).await
    }

    /// Publish `payload` under an explicit routing key.
    pub async fn publish_to<E: Event>(&self, routing_key: &str, payload: E) -> PublishReceipt {
        let envelope = EventEnvelope::stamp(payload, self.clock.now());
        let mut receipt = PublishReceipt {
            event_id: envelope.event_id.clone(),
            timestamp: envelope.timestamp,
            accepted: false,
        };

        let body = match envelope.to_bytes() {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(event_id = %receipt.event_id, error = %error, "Failed to serialize event");
                PublisherMetrics::record_error();
                return receipt;
            }
        };

        let channel = self.channel.read().await.clone();
        let Some(channel) = channel.filter(|channel| channel.is_open()) else {
            tracing::warn!(
                event_id = %receipt.event_id,
                routing_key,
                "Broker not connected, event not published"
            );
            PublisherMetrics::record_unavailable();
            return receipt;
        };

        let started = Instant::now();
        match channel
            .publish(&self.exchange, OutboundMessage::json(routing_key, body))
            .await
        {
            Ok(accepted) => {
                receipt.accepted = accepted;
                PublisherMetrics::record_publish(started.elapsed());
                tracing::info!(
                    event_id = %receipt.event_id,
                    routing_key,
                    accepted,
                    "Event published"
                );
            }
            Err(error) => {
                PublisherMetrics::record_error();
                tracing::error!(
                    event_id = %receipt.event_id,
                    routing_key,
                    error = %error,
                    "Failed to publish event"
                );
                if error.is_connection_error() {
                    self.channel.write().await.take();
                }
            }
        }
        receipt
    }

    /// Keep the publisher connected until `shutdown` fires.
    ///
    /// Every `interval` a missing or closed channel is replaced; publishing
    /// degrades to a no-op in between.
    pub async fn run_reconnect_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if !self.is_connected().await {
                if let Err(error) = self.connect().await {
                    tracing::warn!(
                        exchange = %self.exchange,
                        error = %error,
                        retry_in_ms = interval.as_millis(),
                        "Publisher could not reach broker"
                    );
                }
            }

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = shutdown_signalled(&mut shutdown) => break,
            }
        }
        self.disconnect().await;
    }

    /// Health of the broker connection.
    pub async fn health(&self) -> HealthCheck {
        if self.is_connected().await {
            HealthCheck::healthy("publisher")
        } else {
            HealthCheck::degraded("publisher", "not connected to broker")
        }
    }
}
