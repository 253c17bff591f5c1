//! Supervised queue consumer with manual acknowledgement.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Bound ──▶ Consuming ◀──▶ NackRequeued
//!      ▲                                        │
//!      └──────────── close / connection error ──┘
//! ```
//!
//! A *session* connects, asserts the exchange, the durable queue and its
//! binding, sets the prefetch limit and consumes until the stream ends. Each
//! delivery is parsed, handed to the [`MessageHandler`] and acknowledged only
//! after the handler succeeds. Parse or handler failures are nacked with
//! requeue, so the broker redelivers them.
//!
//! [`Consumer::run`] supervises sessions:
//!
//! - a graceful close waits `reconnect_delay`, then starts a new session
//! - a connection error ends the session with an error value and the next
//!   session starts after an exponential backoff
//! - after `restart_policy.max_retries` consecutive failed sessions the
//!   supervisor gives up and returns [`ConsumerError::RestartsExhausted`]
//! - the shutdown signal cancels the session at any point; unsettled deliveries
//!   go back to the queue
//!
//! # Poison Messages
//!
//! With [`RedeliveryPolicy::Unbounded`] (the default) a message that always
//! fails is redelivered forever. [`RedeliveryPolicy::Bounded`] counts failed
//! attempts per message body within one consumer process and rejects the
//! message without requeue once the limit is reached.

use crate::metrics::ConsumerMetrics;
use crate::retry::RetryPolicy;
use crate::{HealthCheck, shutdown_signalled};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tasksync_core::broker::{BrokerError, Connector, Delivery, QueueBinding, assert_topology};
use tasksync_core::event::EventEnvelope;
use thiserror::Error;
use tokio::sync::watch;

/// Failure reported by a [`MessageHandler`]; the delivery is requeued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors that end a consumer session or the supervisor.
#[derive(Error, Debug, Clone)]
pub enum ConsumerError {
    /// The broker could not be reached.
    #[error("Consumer could not connect: {0}")]
    ConnectionFailed(#[source] BrokerError),

    /// Exchange, queue, binding or prefetch setup failed.
    #[error("Consumer topology setup failed: {0}")]
    TopologyFailed(#[source] BrokerError),

    /// The connection dropped while consuming.
    #[error("Consumer connection lost: {0}")]
    ConnectionLost(#[source] BrokerError),

    /// The supervisor gave up restarting sessions.
    #[error("Consumer gave up after {restarts} failed sessions: {last}")]
    RestartsExhausted {
        /// Consecutive failed sessions.
        restarts: u32,
        /// Error of the final session.
        #[source]
        last: Box<ConsumerError>,
    },
}

/// Consumer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// No connection.
    Disconnected,
    /// Opening a connection.
    Connecting,
    /// Topology asserted, not yet consuming.
    Bound,
    /// Receiving deliveries.
    Consuming,
    /// Last delivery was nacked with requeue; still consuming.
    NackRequeued,
}

impl ConsumerState {
    const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Bound => 2.0,
            Self::Consuming => 3.0,
            Self::NackRequeued => 4.0,
        }
    }

    /// Whether the consumer is attached to its queue.
    #[must_use]
    pub const fn is_consuming(self) -> bool {
        matches!(self, Self::Consuming | Self::NackRequeued)
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Bound => "bound",
            Self::Consuming => "consuming",
            Self::NackRequeued => "nack-requeued",
        };
        f.write_str(name)
    }
}

/// What happens to a message whose processing keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedeliveryPolicy {
    /// Always requeue.
    #[default]
    Unbounded,
    /// Reject without requeue after `max_attempts` failed attempts.
    Bounded {
        /// Failed attempts allowed per message.
        max_attempts: u32,
    },
}

/// Side effect performed for each event taken from a queue.
///
/// Handlers must tolerate duplicates: delivery is at-least-once.
pub trait MessageHandler: Send + Sync + 'static {
    /// Payload type the message body is parsed into.
    type Event: DeserializeOwned + Send + 'static;

    /// Process one event. An error requeues the delivery.
    fn handle(
        &self,
        event: EventEnvelope<Self::Event>,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>>;
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Queue, exchange and routing pattern.
    pub binding: QueueBinding,
    /// Unacknowledged deliveries allowed in flight.
    pub prefetch: u16,
    /// Tag identifying this consumer to the broker.
    pub consumer_tag: String,
    /// Pause before reconnecting after a graceful close.
    pub reconnect_delay: Duration,
    /// Backoff and limit for sessions that fail.
    pub restart_policy: RetryPolicy,
    /// Handling of messages that keep failing.
    pub redelivery: RedeliveryPolicy,
}

impl ConsumerSettings {
    /// Defaults: prefetch 1, 5 s reconnect delay, 5 restarts, unbounded redelivery.
    #[must_use]
    pub fn new(binding: QueueBinding) -> Self {
        let consumer_tag = format!("{}-consumer", binding.queue_name);
        Self {
            binding,
            prefetch: 1,
            consumer_tag,
            reconnect_delay: Duration::from_secs(5),
            restart_policy: RetryPolicy::default(),
            redelivery: RedeliveryPolicy::Unbounded,
        }
    }

    /// Set the prefetch limit.
    #[must_use]
    pub const fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the delay before reconnecting after a graceful close.
    #[must_use]
    pub const fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the restart policy for failed sessions.
    #[must_use]
    pub fn restart_policy(mut self, policy: RetryPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Set the redelivery policy.
    #[must_use]
    pub const fn redelivery(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The broker closed the consumer.
    Closed,
    /// Shutdown was requested.
    Shutdown,
}

/// Result of processing one delivery.
enum Settlement {
    Ack,
    Requeue,
    Reject,
}

/// Queue consumer driving a [`MessageHandler`].
pub struct Consumer<H: MessageHandler> {
    connector: Arc<dyn Connector>,
    handler: Arc<H>,
    settings: ConsumerSettings,
    state: watch::Sender<ConsumerState>,
    attempts: Mutex<HashMap<u64, u32>>,
}

impl<H: MessageHandler> std::fmt::Debug for Consumer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.settings.binding.queue_name)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<H: MessageHandler> Consumer<H> {
    /// Create a consumer; nothing happens until [`Consumer::run`].
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, handler: Arc<H>, settings: ConsumerSettings) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            connector,
            handler,
            settings,
            state,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Queue this consumer reads.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.settings.binding.queue_name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Health derived from the current state.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let component = format!("consumer:{}", self.queue());
        match self.state() {
            ConsumerState::Consuming => HealthCheck::healthy(component),
            ConsumerState::NackRequeued => {
                HealthCheck::degraded(component, "last delivery failed and was requeued")
            }
            other => HealthCheck::degraded(component, format!("consumer is {other}")),
        }
    }

    fn set_state(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            ConsumerMetrics::record_state(self.queue(), next.as_gauge());
            tracing::debug!(queue = %self.queue(), from = %previous, to = %next, "Consumer state changed");
        }
    }

    /// Supervise sessions until shutdown or until restarts are exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::RestartsExhausted`] once more than
    /// `restart_policy.max_retries` consecutive sessions failed. A session that
    /// reached [`ConsumerState::Consuming`] resets the count.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let mut reached_consuming = false;
            let outcome = self.session(&mut shutdown, &mut reached_consuming).await;
            self.set_state(ConsumerState::Disconnected);
            if reached_consuming {
                failures = 0;
            }

            let delay = match outcome {
                Ok(SessionEnd::Shutdown) => {
                    tracing::info!(queue = %self.queue(), "Consumer stopped");
                    return Ok(());
                }
                Ok(SessionEnd::Closed) => {
                    tracing::warn!(
                        queue = %self.queue(),
                        reconnect_in_ms = self.settings.reconnect_delay.as_millis(),
                        "Broker closed consumer, reconnecting"
                    );
                    self.settings.reconnect_delay
                }
                Err(error) => {
                    failures += 1;
                    if !self.settings.restart_policy.allows_retry(failures) {
                        tracing::error!(
                            queue = %self.queue(),
                            failures,
                            error = %error,
                            "Consumer restarts exhausted"
                        );
                        return Err(ConsumerError::RestartsExhausted {
                            restarts: failures,
                            last: Box::new(error),
                        });
                    }
                    let delay = self.settings.restart_policy.delay_for_attempt(failures - 1);
                    tracing::warn!(
                        queue = %self.queue(),
                        failures,
                        error = %error,
                        restart_in_ms = delay.as_millis(),
                        "Consumer session failed, restarting"
                    );
                    delay
                }
            };

            ConsumerMetrics::record_restart(self.queue());
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown_signalled(&mut shutdown) => return Ok(()),
            }
        }
    }

    async fn session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        reached_consuming: &mut bool,
    ) -> Result<SessionEnd, ConsumerError> {
        let binding = &self.settings.binding;

        self.set_state(ConsumerState::Connecting);
        let channel = self
            .connector
            .connect()
            .await
            .map_err(ConsumerError::ConnectionFailed)?;

        assert_topology(channel.as_ref(), binding, self.settings.prefetch)
            .await
            .map_err(ConsumerError::TopologyFailed)?;
        self.set_state(ConsumerState::Bound);

        let mut deliveries = channel
            .consume(&binding.queue_name, &self.settings.consumer_tag)
            .await
            .map_err(ConsumerError::TopologyFailed)?;
        self.set_state(ConsumerState::Consuming);
        *reached_consuming = true;
        tracing::info!(
            queue = %binding.queue_name,
            exchange = %binding.exchange_name,
            pattern = %binding.routing_pattern,
            prefetch = self.settings.prefetch,
            "Consumer waiting for events"
        );

        loop {
            let next = tokio::select! {
                next = deliveries.next() => Some(next),
                () = shutdown_signalled(shutdown) => None,
            };

            let Some(next) = next else {
                drop(deliveries);
                if let Err(error) = channel.close().await {
                    tracing::debug!(error = %error, "Error closing consumer channel");
                }
                return Ok(SessionEnd::Shutdown);
            };

            match next {
                None => return Ok(SessionEnd::Closed),
                Some(Err(error)) => return Err(ConsumerError::ConnectionLost(error)),
                Some(Ok(delivery)) => self.process(delivery).await?,
            }
        }
    }

    async fn process(&self, delivery: Delivery) -> Result<(), ConsumerError> {
        let queue = self.queue().to_string();
        ConsumerMetrics::record_delivery(&queue, delivery.redelivered);
        tracing::debug!(
            queue = %queue,
            delivery_tag = delivery.delivery_tag,
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered,
            "Delivery received"
        );

        let started = Instant::now();
        let fingerprint = fingerprint(&delivery.body);
        let failure = match EventEnvelope::<H::Event>::from_bytes(&delivery.body) {
            Err(error) => Some(format!("malformed message: {error}")),
            Ok(event) => self.handler.handle(event).await.err().map(|e| e.to_string()),
        };

        let settlement = match failure {
            None => {
                self.forget(fingerprint);
                Settlement::Ack
            }
            Some(reason) => {
                let settlement = self.settle_failure(fingerprint);
                tracing::warn!(
                    queue = %queue,
                    delivery_tag = delivery.delivery_tag,
                    reason = %reason,
                    requeue = matches!(settlement, Settlement::Requeue),
                    "Processing failed"
                );
                settlement
            }
        };

        let result = match settlement {
            Settlement::Ack => {
                let result = delivery.ack().await;
                if result.is_ok() {
                    ConsumerMetrics::record_ack(&queue, started.elapsed());
                    self.set_state(ConsumerState::Consuming);
                }
                result
            }
            Settlement::Requeue => {
                let result = delivery.nack(true).await;
                if result.is_ok() {
                    ConsumerMetrics::record_requeue(&queue);
                    self.set_state(ConsumerState::NackRequeued);
                }
                result
            }
            Settlement::Reject => {
                let result = delivery.nack(false).await;
                if result.is_ok() {
                    ConsumerMetrics::record_reject(&queue);
                    self.set_state(ConsumerState::Consuming);
                }
                result
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) if error.is_connection_error() => Err(ConsumerError::ConnectionLost(error)),
            Err(error) => {
                tracing::warn!(queue = %queue, error = %error, "Failed to settle delivery");
                Ok(())
            }
        }
    }

    fn settle_failure(&self, fingerprint: u64) -> Settlement {
        match self.settings.redelivery {
            RedeliveryPolicy::Unbounded => Settlement::Requeue,
            RedeliveryPolicy::Bounded { max_attempts } => {
                let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
                let count = attempts.entry(fingerprint).or_insert(0);
                *count += 1;
                if *count >= max_attempts {
                    attempts.remove(&fingerprint);
                    Settlement::Reject
                } else {
                    Settlement::Requeue
                }
            }
        }
    }

    fn forget(&self, fingerprint: u64) {
        if matches!(self.settings.redelivery, RedeliveryPolicy::Bounded { .. }) {
            self.attempts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&fingerprint);
        }
    }
}

fn fingerprint(body: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    hasher.finish()
}
