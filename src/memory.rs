// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process implementation of the broker abstraction, for tests and
//! local development without a RabbitMQ server. It models the parts of
//! RabbitMQ the pipelines depend on:
//!
//! - direct, fanout and topic routing, the default exchange and
//!   exchange-to-exchange bindings
//! - idempotent declarations (re-declaring with other parameters fails)
//! - per-channel prefetch and round-robin delivery between consumers
//! - per-message and per-queue TTL with dead-lettering on expiry
//! - `x-dead-letter-exchange`, `x-dead-letter-routing-key` and the quorum
//!   `x-delivery-limit`
//! - requeue of unacknowledged messages when their channel closes
//! - queue deletion, which cancels consumers with a null delivery
//!
//! Every broker call is recorded in an operation log that keeps the most
//! recent `DEFAULT_OPERATION_LIMIT` entries.
//!
//! ```no_run
//! use amqp_core::memory::InMemoryBroker;
//! use amqp_core::connection::ConnectionRegistry;
//!
//! let broker = InMemoryBroker::new();
//! let registry = ConnectionRegistry::new(broker.factory());
//! ```

use crate::{
    broker::{BrokerChannel, BrokerConnection, ConnectionFactory, Delivery, DeliveryStream, QueueOptions},
    configs::ConnectionOptions,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    headers,
    queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_DELIVERY_LIMIT},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedSender},
    time::Instant,
};
use tracing::{debug, warn};

/// Per-queue message TTL argument
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header naming the queue a message was first dead-lettered from
pub const AMQP_HEADERS_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
/// Header naming why a message was first dead-lettered
pub const AMQP_HEADERS_FIRST_DEATH_REASON: &str = "x-first-death-reason";

/// Operations kept in the log before the oldest are dropped
pub const DEFAULT_OPERATION_LIMIT: usize = 10_000;

/// One recorded broker call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect,
    CloseConnection,
    CreateChannel(u64),
    CloseChannel(u64),
    AssertExchange(String),
    AssertQueue(String),
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    BindExchange {
        destination: String,
        source: String,
        routing_key: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
    },
    Qos(u16),
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Cancel(String),
    Ack(u64),
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
    Get(String),
}

/// A message sitting in a queue.
#[derive(Debug, Clone)]
pub struct MemoryMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    /// How many times the message was handed to a consumer
    pub delivery_count: u32,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    message: MemoryMessage,
    expires_at: Option<Instant>,
}

struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    sender: UnboundedSender<Result<Option<Delivery>, AmqpError>>,
}

struct QueueEntry {
    options: QueueOptions,
    arguments: FieldTable,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

impl QueueEntry {
    fn argument(&self, key: &str) -> Option<&AMQPValue> {
        self.arguments.inner().get(key)
    }
}

#[derive(Default)]
struct ChannelEntry {
    prefetch: u16,
    unacked: usize,
}

impl ChannelEntry {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked < self.prefetch as usize
    }
}

struct Unacked {
    channel_id: u64,
    queue: String,
    stored: StoredMessage,
}

#[derive(Clone, PartialEq)]
enum Destination {
    Queue(String),
    Exchange(String),
}

#[derive(Clone, PartialEq)]
struct Binding {
    source: String,
    destination: Destination,
    routing_key: String,
}

struct BrokerState {
    myself: Weak<Mutex<BrokerState>>,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelEntry>,
    unacked: HashMap<u64, Unacked>,
    operations: VecDeque<Operation>,
    operation_limit: usize,
    next_id: u64,
    open_connections: usize,
    refuse_connections: bool,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether a topic binding pattern matches a routing key. `*` matches one
/// word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern = pattern.split('.').collect::<Vec<_>>();
    let key = if routing_key.is_empty() {
        vec![]
    } else {
        routing_key.split('.').collect::<Vec<_>>()
    };

    matches(&pattern, &key)
}

/// The original properties minus the expiration, as RabbitMQ strips it when
/// dead-lettering.
fn without_expiration(props: &BasicProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(v) = props.content_type() {
        out = out.with_content_type(v.clone());
    }
    if let Some(v) = props.content_encoding() {
        out = out.with_content_encoding(v.clone());
    }
    if let Some(v) = props.headers() {
        out = out.with_headers(v.clone());
    }
    if let Some(v) = props.delivery_mode() {
        out = out.with_delivery_mode(*v);
    }
    if let Some(v) = props.priority() {
        out = out.with_priority(*v);
    }
    if let Some(v) = props.correlation_id() {
        out = out.with_correlation_id(v.clone());
    }
    if let Some(v) = props.reply_to() {
        out = out.with_reply_to(v.clone());
    }
    if let Some(v) = props.message_id() {
        out = out.with_message_id(v.clone());
    }
    if let Some(v) = props.timestamp() {
        out = out.with_timestamp(*v);
    }
    if let Some(v) = props.kind() {
        out = out.with_type(v.clone());
    }
    if let Some(v) = props.user_id() {
        out = out.with_user_id(v.clone());
    }
    if let Some(v) = props.app_id() {
        out = out.with_app_id(v.clone());
    }
    if let Some(v) = props.cluster_id() {
        out = out.with_cluster_id(v.clone());
    }
    out
}

impl BrokerState {
    fn record(&mut self, op: Operation) {
        if self.operation_limit == 0 {
            return;
        }
        while self.operations.len() >= self.operation_limit {
            self.operations.pop_front();
        }
        self.operations.push_back(op);
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel_id: u64) -> Result<(), AmqpError> {
        if self.channels.contains_key(&channel_id) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError(format!("channel {} is closed", channel_id)))
        }
    }

    /// Queues a message reaches through `exchange`, following exchange-to-exchange bindings.
    fn resolve(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect());
        }

        if !self.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError(format!("no exchange `{}`", exchange)));
        }

        let mut queues = vec![];
        let mut visited = HashSet::new();
        let mut pending = vec![exchange.to_owned()];

        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(def) = self.exchanges.get(&current) else {
                continue;
            };

            for binding in self.bindings.iter().filter(|b| b.source == current) {
                let matched = match def.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                };
                if !matched {
                    continue;
                }

                match &binding.destination {
                    Destination::Queue(queue) if !queues.contains(queue) => queues.push(queue.clone()),
                    Destination::Queue(_) => {}
                    Destination::Exchange(next) => pending.push(next.clone()),
                }
            }
        }

        Ok(queues)
    }

    fn route(&mut self, message: MemoryMessage) -> Result<(), AmqpError> {
        let queues = self.resolve(&message.exchange, &message.routing_key)?;
        if queues.is_empty() {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "unroutable message dropped"
            );
        }

        for queue in queues {
            self.enqueue(&queue, message.clone());
        }

        Ok(())
    }

    fn enqueue(&mut self, queue: &str, message: MemoryMessage) {
        let id = self.next_id();

        let per_message = message
            .properties
            .expiration()
            .as_ref()
            .and_then(|e| e.as_str().parse::<u64>().ok());
        let Some(entry) = self.queues.get_mut(queue) else {
            return;
        };
        let per_queue = entry
            .argument(AMQP_HEADERS_MESSAGE_TTL)
            .and_then(headers::as_i64)
            .and_then(|ttl| u64::try_from(ttl).ok());

        let ttl = match (per_message, per_queue) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let expires_at = ttl.map(|ttl| Instant::now() + Duration::from_millis(ttl));
        entry.ready.push_back(StoredMessage {
            id,
            message,
            expires_at,
        });

        if let Some(ttl) = ttl {
            self.schedule_expiry(queue, id, Duration::from_millis(ttl));
        }
    }

    fn schedule_expiry(&self, queue: &str, id: u64, after: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(queue, "no runtime available, message expiration ignored");
            return;
        };

        let state = self.myself.clone();
        let queue = queue.to_owned();
        handle.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(state) = state.upgrade() {
                let mut state = lock(&state);
                state.expire(&queue, id);
                state.dispatch_all();
            }
        });
    }

    fn expire(&mut self, queue: &str, id: u64) {
        let Some(entry) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(position) = entry.ready.iter().position(|stored| stored.id == id) else {
            return;
        };
        if let Some(stored) = entry.ready.remove(position) {
            debug!(queue, "message expired");
            self.dead_letter(queue, stored.message, "expired");
        }
    }

    fn dead_letter(&mut self, queue: &str, message: MemoryMessage, reason: &str) {
        let Some(entry) = self.queues.get(queue) else {
            return;
        };

        let Some(exchange) = entry
            .argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
            .and_then(headers::as_string)
        else {
            debug!(queue, reason, "message discarded, no dead-letter exchange");
            return;
        };

        let routing_key = entry
            .argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .and_then(headers::as_string)
            .unwrap_or_else(|| message.routing_key.clone());

        let mut table = message
            .properties
            .headers()
            .clone()
            .unwrap_or_default()
            .inner()
            .clone();
        table
            .entry(ShortString::from(AMQP_HEADERS_FIRST_DEATH_QUEUE))
            .or_insert_with(|| AMQPValue::LongString(LongString::from(queue.to_owned())));
        table
            .entry(ShortString::from(AMQP_HEADERS_FIRST_DEATH_REASON))
            .or_insert_with(|| AMQPValue::LongString(LongString::from(reason.to_owned())));

        let dead = MemoryMessage {
            exchange,
            routing_key,
            properties: without_expiration(&message.properties).with_headers(FieldTable::from(table)),
            data: message.data,
            delivery_count: 0,
        };

        if let Err(err) = self.route(dead) {
            warn!(queue, error = err.to_string(), "failure to dead-letter message");
        }
    }

    /// Puts a delivered message back at the head of its queue, or
    /// dead-letters it once expired or over the delivery limit.
    fn requeue(&mut self, queue: &str, stored: StoredMessage) {
        let Some(entry) = self.queues.get_mut(queue) else {
            return;
        };

        let limit = entry
            .argument(AMQP_HEADERS_DELIVERY_LIMIT)
            .and_then(headers::as_i64)
            .and_then(|l| u32::try_from(l).ok());

        if limit.is_some_and(|limit| stored.message.delivery_count >= limit) {
            debug!(queue, "delivery limit reached");
            self.dead_letter(queue, stored.message, "delivery_limit");
            return;
        }

        if stored.expires_at.is_some_and(|at| at <= Instant::now()) {
            self.dead_letter(queue, stored.message, "expired");
            return;
        }

        entry.ready.push_front(stored);
    }

    fn settle(&mut self, channel_id: u64, delivery_tag: u64) -> Option<Unacked> {
        let belongs = self
            .unacked
            .get(&delivery_tag)
            .is_some_and(|u| u.channel_id == channel_id);
        if !belongs {
            return None;
        }

        let unacked = self.unacked.remove(&delivery_tag)?;
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.unacked = channel.unacked.saturating_sub(1);
        }
        Some(unacked)
    }

    fn dispatch_all(&mut self) {
        let names = self
            .queues
            .iter()
            .filter(|(_, entry)| !entry.consumers.is_empty() && !entry.ready.is_empty())
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        for name in names {
            self.dispatch(&name);
        }
    }

    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(entry) = self.queues.get_mut(queue) else {
                return;
            };
            if entry.ready.is_empty() || entry.consumers.is_empty() {
                return;
            }

            let count = entry.consumers.len();
            let channels = &self.channels;
            let chosen = (0..count)
                .map(|offset| (entry.next_consumer + offset) % count)
                .find(|idx| {
                    channels
                        .get(&entry.consumers[*idx].channel_id)
                        .is_some_and(ChannelEntry::has_capacity)
                });
            let Some(idx) = chosen else {
                return;
            };

            let Some(mut stored) = entry.ready.pop_front() else {
                return;
            };

            self.next_id += 1;
            let delivery_tag = self.next_id;

            let delivery = Delivery {
                delivery_tag,
                exchange: stored.message.exchange.clone(),
                routing_key: stored.message.routing_key.clone(),
                redelivered: stored.message.delivery_count > 0,
                properties: stored.message.properties.clone(),
                data: stored.message.data.clone(),
            };
            stored.message.delivery_count += 1;

            let consumer = &entry.consumers[idx];
            if consumer.sender.send(Ok(Some(delivery))).is_err() {
                debug!(queue, consumer = %consumer.tag, "consumer stream dropped");
                stored.message.delivery_count -= 1;
                entry.ready.push_front(stored);
                entry.consumers.remove(idx);
                continue;
            }

            let channel_id = consumer.channel_id;
            entry.next_consumer = (idx + 1) % count;
            if let Some(channel) = self.channels.get_mut(&channel_id) {
                channel.unacked += 1;
            }
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    channel_id,
                    queue: queue.to_owned(),
                    stored,
                },
            );
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }
        self.record(Operation::CloseChannel(channel_id));

        for entry in self.queues.values_mut() {
            entry.consumers.retain(|c| c.channel_id != channel_id);
        }

        let mut tags = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect::<Vec<_>>();
        tags.sort_unstable();

        // reverse so that push_front restores delivery order
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(&unacked.queue, unacked.stored);
            }
        }

        self.dispatch_all();
    }
}

/// In-process broker. Cloning shares the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        let state = Arc::new_cyclic(|myself| {
            Mutex::new(BrokerState {
                myself: myself.clone(),
                exchanges: HashMap::default(),
                queues: HashMap::default(),
                bindings: vec![],
                channels: HashMap::default(),
                unacked: HashMap::default(),
                operations: VecDeque::new(),
                operation_limit: DEFAULT_OPERATION_LIMIT,
                next_id: 0,
                open_connections: 0,
                refuse_connections: false,
            })
        });

        InMemoryBroker { state }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// This broker as a `ConnectionFactory` for a `ConnectionRegistry`.
    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }

    /// Makes every following connect fail, as a refused connection would.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    pub fn open_connections(&self) -> usize {
        self.state().open_connections
    }

    /// Recorded operations, oldest first.
    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.iter().cloned().collect()
    }

    /// Caps the operation log at `limit` entries; 0 disables recording.
    pub fn operation_limit(&self, limit: usize) {
        let mut state = self.state();
        state.operation_limit = limit;
        let excess = state.operations.len().saturating_sub(limit);
        state.operations.drain(..excess);
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.state().queues.get(name).map(|q| q.arguments.clone())
    }

    /// Whether `queue` is bound to `exchange` with `routing_key`.
    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state().bindings.iter().any(|b| {
            b.source == exchange
                && b.destination == Destination::Queue(queue.to_owned())
                && b.routing_key == routing_key
        })
    }

    /// Messages ready for delivery in `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<MemoryMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn message_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.ready.len()).unwrap_or_default()
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state().unacked.values().filter(|u| u.queue == queue).count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Publishes straight into the broker, bypassing any client.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.route(MemoryMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: body.to_vec(),
            delivery_count: 0,
        })?;
        state.dispatch_all();
        Ok(())
    }

    /// Deletes a queue. Its consumers receive a null delivery and its
    /// messages are dropped.
    pub fn delete_queue(&self, name: &str) -> bool {
        let mut state = self.state();
        let Some(entry) = state.queues.remove(name) else {
            return false;
        };

        for consumer in entry.consumers {
            let _ = consumer.sender.send(Ok(None));
        }
        state
            .bindings
            .retain(|b| b.destination != Destination::Queue(name.to_owned()));

        let tags = state
            .unacked
            .iter()
            .filter(|(_, u)| u.queue == name)
            .map(|(tag, u)| (*tag, u.channel_id))
            .collect::<Vec<_>>();
        for (tag, channel_id) in tags {
            state.settle(channel_id, tag);
        }

        true
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn connect(
        &self,
        urls: &[String],
        _options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state();
        if state.refuse_connections {
            return Err(AmqpError::ConnectionError(format!(
                "connection refused: {}",
                urls.join(", ")
            )));
        }

        state.open_connections += 1;
        state.record(Operation::Connect);

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            channels: Mutex::new(vec![]),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connection to the in-memory broker.
pub struct MemoryConnection {
    broker: InMemoryBroker,
    channels: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let mut state = self.broker.state();
        let id = state.next_id();
        state.channels.insert(id, ChannelEntry::default());
        state.record(Operation::CreateChannel(id));
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channels = std::mem::take(&mut *self.channels.lock().unwrap_or_else(PoisonError::into_inner));
        let mut state = self.broker.state();
        for id in channels {
            state.close_channel(id);
        }
        state.open_connections = state.open_connections.saturating_sub(1);
        state.record(Operation::CloseConnection);

        Ok(())
    }
}

/// A channel on the in-memory broker.
pub struct MemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        state.record(Operation::AssertExchange(def.name.clone()));

        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => Err(AmqpError::DeclareExchangeError(
                def.name.clone(),
                "PRECONDITION_FAILED - inequivalent arguments".to_owned(),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        state.record(Operation::AssertQueue(name.to_owned()));

        match state.queues.get(name) {
            Some(existing) if existing.options != options || existing.arguments.inner() != arguments.inner() => {
                Err(AmqpError::DeclareQueueError(
                    name.to_owned(),
                    "PRECONDITION_FAILED - inequivalent arguments".to_owned(),
                ))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_owned(),
                    QueueEntry {
                        options,
                        arguments,
                        ready: VecDeque::default(),
                        consumers: vec![],
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        state.record(Operation::BindQueue {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });

        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError {
                exchange: exchange.to_owned(),
                queue: queue.to_owned(),
                reason: "NOT_FOUND".to_owned(),
            });
        }

        let binding = Binding {
            source: exchange.to_owned(),
            destination: Destination::Queue(queue.to_owned()),
            routing_key: routing_key.to_owned(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }

        Ok(())
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        state.record(Operation::BindExchange {
            destination: destination.to_owned(),
            source: source.to_owned(),
            routing_key: routing_key.to_owned(),
        });

        if !state.exchanges.contains_key(source) || !state.exchanges.contains_key(destination) {
            return Err(AmqpError::BindingExchangeToExchangeError {
                origin: source.to_owned(),
                destination: destination.to_owned(),
                reason: "NOT_FOUND".to_owned(),
            });
        }

        let binding = Binding {
            source: source.to_owned(),
            destination: Destination::Exchange(destination.to_owned()),
            routing_key: routing_key.to_owned(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_open(self.id)?;
        state.record(Operation::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });

        state.route(MemoryMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: body.to_vec(),
            delivery_count: 0,
        })?;
        state.dispatch_all();

        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.record(Operation::Qos(prefetch));

        let Some(channel) = state.channels.get_mut(&self.id) else {
            return Err(AmqpError::QoSDeclarationError(format!("channel {} is closed", self.id)));
        };
        channel.prefetch = prefetch;
        state.dispatch_all();

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.broker.state();
        state
            .channel_open(self.id)
            .map_err(|err| AmqpError::ConsumerDeclarationError(queue.to_owned(), err.to_string()))?;
        state.record(Operation::Consume {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
        });

        let (sender, receiver) = unbounded_channel();
        let Some(entry) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(
                queue.to_owned(),
                "NOT_FOUND".to_owned(),
            ));
        };
        entry.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_owned(),
            channel_id: self.id,
            sender,
        });
        state.dispatch(queue);

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });

        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.record(Operation::Cancel(consumer_tag.to_owned()));

        for entry in state.queues.values_mut() {
            entry
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        }

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.record(Operation::Ack(delivery_tag));

        if state.settle(self.id, delivery_tag).is_none() {
            return Err(AmqpError::AckMessageError(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        }
        state.dispatch_all();

        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.record(Operation::Nack {
            delivery_tag,
            requeue,
        });

        let Some(unacked) = state.settle(self.id, delivery_tag) else {
            return Err(AmqpError::NackMessageError(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        };

        if requeue {
            state.requeue(&unacked.queue, unacked.stored);
        } else {
            state.dead_letter(&unacked.queue, unacked.stored.message, "rejected");
        }
        state.dispatch_all();

        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        let mut state = self.broker.state();
        state
            .channel_open(self.id)
            .map_err(|err| AmqpError::GetMessageError(queue.to_owned(), err.to_string()))?;
        state.record(Operation::Get(queue.to_owned()));

        let delivery_tag = state.next_id();
        let Some(entry) = state.queues.get_mut(queue) else {
            return Err(AmqpError::GetMessageError(queue.to_owned(), "NOT_FOUND".to_owned()));
        };
        let Some(mut stored) = entry.ready.pop_front() else {
            return Ok(None);
        };

        let delivery = Delivery {
            delivery_tag,
            exchange: stored.message.exchange.clone(),
            routing_key: stored.message.routing_key.clone(),
            redelivered: stored.message.delivery_count > 0,
            properties: stored.message.properties.clone(),
            data: stored.message.data.clone(),
        };
        stored.message.delivery_count += 1;

        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.unacked += 1;
        }
        state.unacked.insert(
            delivery_tag,
            Unacked {
                channel_id: self.id,
                queue: queue.to_owned(),
                stored,
            },
        );

        Ok(Some(delivery))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().close_channel(self.id);
        Ok(())
    }
}
