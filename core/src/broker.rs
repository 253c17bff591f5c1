//! Broker contract for the event pipeline.
//!
//! Events flow from the publisher through a durable topic exchange to one
//! durable queue per downstream concern:
//!
//! ```text
//! ┌─────────────┐  task.checkout.completed  ┌──────────────────┐
//! │  Publisher  │ ────────────────────────▶ │ exchange (topic) │
//! └─────────────┘                           └────────┬─────────┘
//!                                  task.checkout.#   │   task.checkout.#
//!                                  ┌─────────────────┴──────────────┐
//!                                  ▼                                ▼
//!                        ┌────────────────────┐          ┌────────────────────┐
//!                        │ notification_queue │          │  analytics_queue   │
//!                        └─────────┬──────────┘          └─────────┬──────────┘
//!                                  ▼                               ▼
//!                              consumer                         consumer
//! ```
//!
//! # Key Principles
//!
//! - **Fan-out**: every queue whose pattern matches gets its own copy
//! - **Load balancing**: only between consumers of the same queue
//! - **At-least-once delivery**: a delivery stays unacknowledged until
//!   [`Delivery::ack`]; if the channel dies first the broker requeues it and the
//!   next delivery is flagged `redelivered`
//! - **Idempotency**: consumers must tolerate duplicates
//!
//! # Implementations
//!
//! - `InMemoryBroker` in `tasksync-testing`: in-process, with fault hooks
//! - `AmqpConnector` in `tasksync-amqp`: RabbitMQ via `lapin`
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so that services can hold
//! `Arc<dyn Connector>` and `Arc<dyn Channel>`.

use crate::routing::RoutingPattern;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not open a connection or channel.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection went away.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Declaring an exchange or queue, or binding, was refused.
    #[error("Topology declaration failed: {0}")]
    DeclareFailed(String),

    /// The broker refused a publish.
    #[error("Publish failed for routing key '{routing_key}': {reason}")]
    PublishFailed {
        /// Routing key of the refused message
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Acknowledging or rejecting a delivery failed.
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// Generic error for other failures
    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether the error means the underlying connection is gone.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::ConnectionLost(_))
    }
}

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Binding of a durable queue to a topic exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueBinding {
    /// Exchange to bind to.
    pub exchange_name: String,
    /// Pattern matched against routing keys.
    pub routing_pattern: RoutingPattern,
    /// Queue receiving matches.
    pub queue_name: String,
}

impl QueueBinding {
    /// Create a binding.
    #[must_use]
    pub fn new(
        exchange_name: impl Into<String>,
        routing_pattern: impl Into<RoutingPattern>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            routing_pattern: routing_pattern.into(),
            queue_name: queue_name.into(),
        }
    }
}

/// A message handed to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Topic used for routing.
    pub routing_key: String,
    /// Serialized body.
    pub body: Vec<u8>,
    /// MIME type of `body`.
    pub content_type: String,
    /// Whether the broker should write the message to disk.
    pub persistent: bool,
}

impl OutboundMessage {
    /// A persistent `application/json` message.
    #[must_use]
    pub fn json(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            content_type: "application/json".to_string(),
            persistent: true,
        }
    }
}

/// Settles one delivery with the broker.
///
/// Each delivery owns exactly one acknowledger; settling consumes it.
pub trait Acknowledger: Send + Sync {
    /// Positive acknowledgement: the broker may forget the message.
    fn ack(self: Box<Self>) -> BrokerFuture<'static, ()>;

    /// Negative acknowledgement, optionally putting the message back.
    fn nack(self: Box<Self>, requeue: bool) -> BrokerFuture<'static, ()>;
}

/// A message received from a queue, not yet settled.
pub struct Delivery {
    /// Channel scoped sequence number.
    pub delivery_tag: u64,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw body.
    pub body: Vec<u8>,
    /// Set when the message was delivered before and not acknowledged.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Build a delivery settled through `acker`.
    #[must_use]
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] or a connection error if the channel
    /// is gone; the broker will then redeliver the message.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject the delivery. With `requeue` the broker redelivers it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] or a connection error if the channel
    /// is gone.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one queue.
///
/// `Some(Err(_))` means the connection was lost; the stream ends after it.
/// `None` without a preceding error means the broker closed the consumer
/// gracefully.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// An open channel to the broker.
///
/// Declarations are idempotent: asserting an exchange, queue or binding that
/// already exists with the same properties succeeds.
pub trait Channel: Send + Sync {
    /// Assert a durable topic exchange.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] or a connection error.
    fn declare_exchange(&self, exchange: &str) -> BrokerFuture<'_, ()>;

    /// Assert a durable queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] or a connection error.
    fn declare_queue(&self, queue: &str) -> BrokerFuture<'_, ()>;

    /// Bind a queue to an exchange with a routing pattern.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] if the exchange or queue does not
    /// exist, or a connection error.
    fn bind_queue(&self, binding: &QueueBinding) -> BrokerFuture<'_, ()>;

    /// Limit unacknowledged deliveries per consumer on this channel.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the channel is gone.
    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()>;

    /// Publish a message to an exchange.
    ///
    /// Resolves to whether the broker accepted the message into its buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] or a connection error.
    fn publish(&self, exchange: &str, message: OutboundMessage) -> BrokerFuture<'_, bool>;

    /// Start consuming a queue with manual acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] if the queue does not exist, or a
    /// connection error.
    fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerFuture<'_, DeliveryStream>;

    /// Whether the channel can still be used.
    fn is_open(&self) -> bool;

    /// Close the channel and its connection.
    ///
    /// # Errors
    ///
    /// Returns a connection error if closing fails.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// Opens channels to a broker.
pub trait Connector: Send + Sync {
    /// Connect and open a channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the broker is unreachable.
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn Channel>>;
}

/// Assert the exchange, the queue and its binding, then set the prefetch limit.
///
/// # Errors
///
/// Returns the first failing declaration.
pub async fn assert_topology(
    channel: &dyn Channel,
    binding: &QueueBinding,
    prefetch: u16,
) -> Result<(), BrokerError> {
    channel.declare_exchange(&binding.exchange_name).await?;
    channel.declare_queue(&binding.queue_name).await?;
    channel.bind_queue(binding).await?;
    channel.set_prefetch(prefetch).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_message_is_persistent() {
        let message = OutboundMessage::json("task.checkout.completed", b"{}".to_vec());
        assert!(message.persistent);
        assert_eq!(message.content_type, "application/json");
    }

    #[test]
    fn connection_errors_are_classified() {
        assert!(BrokerError::ConnectionLost("gone".into()).is_connection_error());
        assert!(BrokerError::ConnectionFailed("refused".into()).is_connection_error());
        assert!(!BrokerError::DeclareFailed("bad".into()).is_connection_error());
    }

    #[test]
    fn binding_serializes_camel_case() {
        let binding = QueueBinding::new("task_events", "task.checkout.#", "analytics_queue");
        let json = serde_json::to_value(&binding).unwrap_or_default();
        assert_eq!(json["exchangeName"], "task_events");
        assert_eq!(json["routingPattern"], "task.checkout.#");
        assert_eq!(json["queueName"], "analytics_queue");
    }
}
