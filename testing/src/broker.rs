//! In-memory topic broker for tests and single-process deployments.
//!
//! Implements [`Connector`] and [`Channel`] with the routing and
//! acknowledgement semantics of a durable topic exchange:
//!
//! - each queue whose binding matches gets one copy of a message
//! - a queue's consumers are served round-robin, bounded by prefetch
//! - unacknowledged messages return to the head of their queue, flagged
//!   `redelivered`, when nacked with requeue or when their consumer or
//!   connection goes away
//!
//! Queues and bindings outlive connections, like durable queues on a real
//! broker, so messages published while no consumer is attached wait.
//!
//! # Fault Injection
//!
//! - [`InMemoryBroker::drop_connections`]: every open stream yields a
//!   connection error, then ends
//! - [`InMemoryBroker::close_connections`]: every open stream ends gracefully
//! - [`InMemoryBroker::refuse_connections`]: `connect` fails until re-enabled

use futures::Stream;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tasksync_core::broker::{
    Acknowledger, BrokerError, BrokerFuture, Channel, Connector, Delivery, DeliveryStream,
    OutboundMessage, QueueBinding,
};
use tokio::sync::mpsc;

type Shared = Arc<Mutex<BrokerState>>;
type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    id: u64,
    connection: u64,
    sender: DeliverySender,
    prefetch: u16,
    in_flight: usize,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    message: Message,
    consumer: u64,
    connection: u64,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    bindings: Vec<QueueBinding>,
    queues: HashMap<String, QueueState>,
    open_connections: HashSet<u64>,
    next_id: u64,
    refuse: bool,
    published: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, connection: u64) -> Result<(), BrokerError> {
        if self.open_connections.contains(&connection) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionLost("channel is closed".to_string()))
        }
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, BrokerState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hand ready messages of `queue` to consumers with spare capacity.
fn dispatch(shared: &Shared, state: &mut BrokerState, queue_name: &str) {
    loop {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        queue.consumers.retain(|slot| !slot.sender.is_closed());
        if queue.ready.is_empty() || queue.consumers.is_empty() {
            return;
        }

        let count = queue.consumers.len();
        let Some(index) = (0..count)
            .map(|offset| (queue.cursor + offset) % count)
            .find(|&index| queue.consumers[index].has_capacity())
        else {
            return;
        };
        queue.cursor = (index + 1) % count;

        let Some(message) = queue.ready.pop_front() else {
            return;
        };
        state.next_id += 1;
        let tag = state.next_id;
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let slot = &mut queue.consumers[index];

        let acker = InMemoryAcker {
            shared: Arc::clone(shared),
            queue: queue_name.to_string(),
            tag,
            connection: slot.connection,
        };
        let delivery = Delivery::new(
            tag,
            message.routing_key.clone(),
            message.body.clone(),
            message.redelivered,
            Box::new(acker),
        );

        if slot.sender.send(Ok(delivery)).is_err() {
            queue.ready.push_front(message);
            continue;
        }
        slot.in_flight += 1;
        let unacked = Unacked {
            message,
            consumer: slot.id,
            connection: slot.connection,
        };
        queue.unacked.insert(tag, unacked);
    }
}

/// Put unacknowledged messages matching `owned` back at the head of their queue.
fn requeue_where(state: &mut BrokerState, owned: impl Fn(&Unacked) -> bool) -> Vec<String> {
    let mut touched = Vec::new();
    for (name, queue) in &mut state.queues {
        let mut tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, unacked)| owned(unacked))
            .map(|(tag, _)| *tag)
            .collect();
        if tags.is_empty() {
            continue;
        }
        // Oldest delivery ends up first.
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = queue.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                if let Some(slot) = queue
                    .consumers
                    .iter_mut()
                    .find(|slot| slot.id == unacked.consumer)
                {
                    slot.in_flight = slot.in_flight.saturating_sub(1);
                }
            }
        }
        touched.push(name.clone());
    }
    touched
}

/// Tear down connections. With `error` open streams first yield a connection error.
fn shut_connections(shared: &Shared, connections: &[u64], error: Option<&BrokerError>) {
    let mut state = lock(shared);
    for connection in connections {
        state.open_connections.remove(connection);
    }
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|slot| {
            if !connections.contains(&slot.connection) {
                return true;
            }
            if let Some(error) = error {
                let _ = slot.sender.send(Err(error.clone()));
            }
            false
        });
    }
    let touched = requeue_where(&mut state, |unacked| connections.contains(&unacked.connection));
    for queue in touched {
        dispatch(shared, &mut state, &queue);
    }
}

/// In-process broker implementing [`Connector`].
///
/// Clones share the same exchanges, queues and connections.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Shared,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared);
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("open_connections", &state.open_connections.len())
            .finish()
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel without going through the async [`Connector`] API.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] while connections are refused.
    pub fn open_channel(&self) -> Result<InMemoryChannel, BrokerError> {
        let mut state = lock(&self.shared);
        if state.refuse {
            return Err(BrokerError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }
        let connection = state.next_id();
        state.open_connections.insert(connection);
        tracing::debug!(connection, "In-memory broker connection opened");
        Ok(InMemoryChannel {
            shared: Arc::clone(&self.shared),
            connection,
            prefetch: AtomicU16::new(0),
        })
    }

    /// Kill every open connection. Streams yield a connection error, then end.
    pub fn drop_connections(&self) {
        let connections = self.open_connection_ids();
        shut_connections(
            &self.shared,
            &connections,
            Some(&BrokerError::ConnectionLost("connection reset".to_string())),
        );
    }

    /// Close every open connection gracefully. Streams end without an error.
    pub fn close_connections(&self) {
        let connections = self.open_connection_ids();
        shut_connections(&self.shared, &connections, None);
    }

    /// Refuse (`true`) or accept (`false`) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.shared).refuse = refuse;
    }

    /// Route a raw body through `exchange` as if a client had published it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the exchange was never declared.
    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        route(&self.shared, exchange, routing_key, body)
    }

    /// Messages waiting in `queue`, not yet delivered.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.shared)
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.shared)
            .queues
            .get(queue)
            .map_or(0, |queue| queue.unacked.len())
    }

    /// Consumers currently attached to `queue`.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.shared).queues.get(queue).map_or(0, |queue| {
            queue
                .consumers
                .iter()
                .filter(|slot| !slot.sender.is_closed())
                .count()
        })
    }

    /// Messages accepted by any exchange since creation.
    #[must_use]
    pub fn published_count(&self) -> usize {
        lock(&self.shared).published
    }

    /// Connections currently open.
    #[must_use]
    pub fn open_connection_count(&self) -> usize {
        lock(&self.shared).open_connections.len()
    }

    fn open_connection_ids(&self) -> Vec<u64> {
        lock(&self.shared).open_connections.iter().copied().collect()
    }
}

impl Connector for InMemoryBroker {
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn Channel>> {
        let result = self
            .open_channel()
            .map(|channel| Arc::new(channel) as Arc<dyn Channel>);
        Box::pin(async move { result })
    }
}

fn route(shared: &Shared, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
    let mut state = lock(shared);
    if !state.exchanges.contains(exchange) {
        return Err(BrokerError::PublishFailed {
            routing_key: routing_key.to_string(),
            reason: format!("no exchange '{exchange}'"),
        });
    }

    let mut targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|binding| {
            binding.exchange_name == exchange && binding.routing_pattern.matches(routing_key)
        })
        .map(|binding| binding.queue_name.clone())
        .collect();
    targets.sort();
    targets.dedup();

    state.published += 1;
    for queue_name in &targets {
        if let Some(queue) = state.queues.get_mut(queue_name) {
            queue.ready.push_back(Message {
                routing_key: routing_key.to_string(),
                body: body.clone(),
                redelivered: false,
            });
        }
        dispatch(shared, &mut state, queue_name);
    }
    tracing::trace!(exchange, routing_key, queues = targets.len(), "Message routed");
    Ok(())
}

/// A channel on one in-memory connection.
pub struct InMemoryChannel {
    shared: Shared,
    connection: u64,
    prefetch: AtomicU16,
}

impl InMemoryChannel {
    fn with_open<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T, BrokerError>) -> Result<T, BrokerError> {
        let mut state = lock(&self.shared);
        state.ensure_open(self.connection)?;
        f(&mut state)
    }
}

impl Channel for InMemoryChannel {
    fn declare_exchange(&self, exchange: &str) -> BrokerFuture<'_, ()> {
        let result = self.with_open(|state| {
            state.exchanges.insert(exchange.to_string());
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn declare_queue(&self, queue: &str) -> BrokerFuture<'_, ()> {
        let result = self.with_open(|state| {
            state.queues.entry(queue.to_string()).or_default();
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn bind_queue(&self, binding: &QueueBinding) -> BrokerFuture<'_, ()> {
        let result = self.with_open(|state| {
            if !state.exchanges.contains(&binding.exchange_name) {
                return Err(BrokerError::DeclareFailed(format!(
                    "no exchange '{}'",
                    binding.exchange_name
                )));
            }
            if !state.queues.contains_key(&binding.queue_name) {
                return Err(BrokerError::DeclareFailed(format!(
                    "no queue '{}'",
                    binding.queue_name
                )));
            }
            if !state.bindings.contains(binding) {
                state.bindings.push(binding.clone());
            }
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn set_prefetch(&self, count: u16) -> BrokerFuture<'_, ()> {
        let result = self.with_open(|_| Ok(()));
        if result.is_ok() {
            self.prefetch.store(count, Ordering::SeqCst);
        }
        Box::pin(async move { result })
    }

    fn publish(&self, exchange: &str, message: OutboundMessage) -> BrokerFuture<'_, bool> {
        let open = lock(&self.shared).ensure_open(self.connection);
        let result = open
            .and_then(|()| route(&self.shared, exchange, &message.routing_key, message.body))
            .map(|()| true);
        Box::pin(async move { result })
    }

    fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerFuture<'_, DeliveryStream> {
        let result = self.with_open(|state| {
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::DeclareFailed(format!("no queue '{queue}'")));
            }
            let id = state.next_id();
            let (sender, receiver) = mpsc::unbounded_channel();
            if let Some(queue_state) = state.queues.get_mut(queue) {
                queue_state.consumers.push(ConsumerSlot {
                    id,
                    connection: self.connection,
                    sender,
                    prefetch: self.prefetch.load(Ordering::SeqCst),
                    in_flight: 0,
                });
            }
            tracing::debug!(queue, consumer_tag, consumer = id, "Consumer attached");
            Ok((id, receiver))
        });

        let result = result.map(|(id, receiver)| {
            dispatch(&self.shared, &mut lock(&self.shared), queue);
            Box::pin(ConsumerStream {
                receiver,
                _guard: ConsumerGuard {
                    shared: Arc::clone(&self.shared),
                    consumer: id,
                },
            }) as DeliveryStream
        });
        Box::pin(async move { result })
    }

    fn is_open(&self) -> bool {
        lock(&self.shared).open_connections.contains(&self.connection)
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        shut_connections(&self.shared, &[self.connection], None);
        Box::pin(async { Ok(()) })
    }
}

struct ConsumerStream {
    receiver: mpsc::UnboundedReceiver<Result<Delivery, BrokerError>>,
    _guard: ConsumerGuard,
}

impl Stream for ConsumerStream {
    type Item = Result<Delivery, BrokerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Detaches the consumer and requeues its unsettled messages when the stream is dropped.
struct ConsumerGuard {
    shared: Shared,
    consumer: u64,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|slot| slot.id != self.consumer);
        }
        let consumer = self.consumer;
        let touched = requeue_where(&mut state, |unacked| unacked.consumer == consumer);
        for queue in touched {
            dispatch(&self.shared, &mut state, &queue);
        }
    }
}

struct InMemoryAcker {
    shared: Shared,
    queue: String,
    tag: u64,
    connection: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let mut state = lock(&self.shared);
        state.ensure_open(self.connection)?;

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(BrokerError::AckFailed(format!("no queue '{}'", self.queue)));
        };
        let Some(unacked) = queue.unacked.remove(&self.tag) else {
            return Err(BrokerError::AckFailed(format!(
                "unknown delivery tag {}",
                self.tag
            )));
        };
        if let Some(slot) = queue
            .consumers
            .iter_mut()
            .find(|slot| slot.id == unacked.consumer)
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        if requeue == Some(true) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }

        dispatch(&self.shared, &mut state, &self.queue);
        Ok(())
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack(self: Box<Self>) -> BrokerFuture<'static, ()> {
        let result = self.settle(None);
        Box::pin(async move { result })
    }

    fn nack(self: Box<Self>, requeue: bool) -> BrokerFuture<'static, ()> {
        let result = self.settle(Some(requeue));
        Box::pin(async move { result })
    }
}
