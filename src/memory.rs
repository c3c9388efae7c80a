// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the tests.
//!
//! Supports direct/fanout exchanges, the default exchange, per-queue message
//! TTL with dead-lettering, per-channel unacked deliveries that are requeued
//! when the channel dies, push consumers, injected channel faults and
//! reconnects gated by the test.

use crate::{
    channel::{AmqpChannel, Connector, DeliveryStream, RawDelivery},
    client::RecoveryTrigger,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub(crate) struct Stored {
    id: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MemQueue {
    def: QueueDefinition,
    ready: VecDeque<Stored>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<QueueBinding>,
    faults: Vec<&'static str>,
    published: Vec<(String, String)>,
    acks: Vec<u64>,
    next_id: u64,
}

/// Shared broker state; clones see the same queues.
#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The next call of `op` on any channel kills that channel.
    pub fn fail_next(&self, op: &'static str) {
        self.lock().faults.push(op);
    }

    fn take_fault(&self, op: &str) -> bool {
        let mut state = self.lock();
        match state.faults.iter().position(|f| *f == op) {
            Some(idx) => {
                state.faults.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Forgets exchanges, queues and bindings, as a broker restart would for
    /// transient topology.
    pub fn reset_topology(&self) {
        let mut state = self.lock();
        state.exchanges.clear();
        state.queues.clear();
        state.bindings.clear();
    }

    /// Deletes one exchange; publishing to it fails afterwards.
    pub fn delete_exchange(&self, name: &str) {
        self.lock().exchanges.remove(name);
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_definition(&self, name: &str) -> Option<QueueDefinition> {
        self.lock().queues.get(name).map(|q| q.def.clone())
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Removes and returns every ready message of the queue.
    pub fn drain(&self, queue: &str) -> Vec<Stored> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    /// Puts raw bytes straight into a queue.
    pub fn inject(&self, queue: &str, data: &[u8], properties: BasicProperties) {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let stored = Stored {
            id,
            exchange: String::new(),
            routing_key: queue.to_owned(),
            redelivered: false,
            properties,
            data: data.to_vec(),
        };
        state
            .queues
            .entry(queue.to_owned())
            .or_insert_with(|| MemQueue {
                def: QueueDefinition::new(queue),
                ready: VecDeque::new(),
            })
            .ready
            .push_back(stored);
    }

    /// Number of publishes accepted for `routing_key`, whatever the exchange.
    pub fn published_to(&self, routing_key: &str) -> usize {
        self.lock()
            .published
            .iter()
            .filter(|(_, key)| key == routing_key)
            .count()
    }

    /// Every delivery tag acked so far, across channels.
    pub fn acked_tags(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    fn route(&self, exchange: &str, routing_key: &str, properties: BasicProperties, data: Vec<u8>) {
        let targets: Vec<String> = {
            let state = self.lock();
            if exchange.is_empty() {
                vec![routing_key.to_owned()]
            } else {
                let fanout = state
                    .exchanges
                    .get(exchange)
                    .is_some_and(|e| e.kind == ExchangeKind::Fanout);
                let mut seen = HashSet::new();
                state
                    .bindings
                    .iter()
                    .filter(|b| b.exchange_name == exchange && (fanout || b.routing_key == routing_key))
                    .filter(|b| seen.insert(b.queue_name.clone()))
                    .map(|b| b.queue_name.clone())
                    .collect()
            }
        };

        for queue in targets {
            let ttl = {
                let mut state = self.lock();
                let id = state.next_id;
                state.next_id += 1;
                let Some(q) = state.queues.get_mut(&queue) else {
                    continue;
                };
                q.ready.push_back(Stored {
                    id,
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                    properties: properties.clone(),
                    data: data.clone(),
                });
                q.def.ttl.map(|ttl| (id, ttl))
            };

            if let Some((id, ttl)) = ttl {
                let broker = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ttl.max(0) as u64)).await;
                    broker.expire(&queue, id);
                });
            }
        }
    }

    fn expire(&self, queue: &str, id: u64) {
        let expired = {
            let mut state = self.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(pos) = q.ready.iter().position(|m| m.id == id) else {
                return;
            };
            let msg = q.ready.remove(pos);
            msg.map(|m| (m, q.def.clone()))
        };

        if let Some((msg, def)) = expired {
            self.dead_letter(&def, msg);
        }
    }

    fn dead_letter(&self, def: &QueueDefinition, msg: Stored) {
        if let Some(exchange) = &def.dead_letter_exchange {
            let key = def
                .dead_letter_routing_key
                .clone()
                .unwrap_or(msg.routing_key.clone());
            self.route(exchange, &key, msg.properties, msg.data);
        }
    }

    fn requeue(&self, queue: &str, mut msg: Stored) {
        msg.redelivered = true;
        if let Some(q) = self.lock().queues.get_mut(queue) {
            q.ready.push_front(msg);
        }
    }

    fn pop(&self, queue: &str) -> Result<Option<Stored>, AmqpError> {
        let mut state = self.lock();
        match state.queues.get_mut(queue) {
            Some(q) => Ok(q.ready.pop_front()),
            None => Err(AmqpError::GetMessageError(queue.to_owned())),
        }
    }
}

/// One channel on the in-memory broker.
pub(crate) struct MemoryChannel {
    inner: Arc<ChannelState>,
}

struct ChannelState {
    broker: MemoryBroker,
    open: AtomicBool,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, (String, Stored)>>,
    cancelled: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl ChannelState {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Closes the channel and requeues its unacked deliveries in order.
    fn kill(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let mut unacked: Vec<_> = self.unacked.lock().unwrap().drain().collect();
            unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, (queue, msg)) in unacked {
                self.broker.requeue(&queue, msg);
            }
        }
    }

    fn deliver(&self, queue: &str, msg: Stored) -> RawDelivery {
        let tag = self.next_tag.fetch_add(1, Ordering::AcqRel);
        let raw = RawDelivery {
            delivery_tag: tag,
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            redelivered: msg.redelivered,
            properties: msg.properties.clone(),
            data: msg.data.clone(),
        };
        self.unacked
            .lock()
            .unwrap()
            .insert(tag, (queue.to_owned(), msg));
        raw
    }
}

impl MemoryChannel {
    fn new(broker: &MemoryBroker) -> Arc<MemoryChannel> {
        Arc::new(MemoryChannel {
            inner: Arc::new(ChannelState {
                broker: broker.clone(),
                open: AtomicBool::new(true),
                next_tag: AtomicU64::new(1),
                unacked: Mutex::default(),
                cancelled: Mutex::default(),
            }),
        })
    }

    pub fn kill(&self) {
        self.inner.kill();
    }

    fn broker(&self) -> &MemoryBroker {
        &self.inner.broker
    }

    fn check(&self, op: &'static str) -> Result<(), AmqpError> {
        if !self.inner.is_open() {
            return Err(AmqpError::ChannelClosed("channel is closed".to_owned()));
        }
        if self.broker().take_fault(op) {
            self.kill();
            return Err(AmqpError::ChannelClosed(format!("injected fault on {op}")));
        }
        Ok(())
    }

    fn settle(&self, delivery_tag: u64) -> Option<(String, Stored)> {
        let entry = self.inner.unacked.lock().unwrap().remove(&delivery_tag);
        if entry.is_none() {
            // unknown tags close the channel on a real broker
            self.kill();
        }
        entry
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.check("publish")?;
        {
            let mut state = self.broker().lock();
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(AmqpError::PublishingError(format!(
                    "no exchange `{exchange}`"
                )));
            }
            state
                .published
                .push((exchange.to_owned(), routing_key.to_owned()));
        }
        self.broker()
            .route(exchange, routing_key, properties, payload.to_vec());
        Ok(())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<RawDelivery>, AmqpError> {
        self.check("get")?;
        Ok(self
            .broker()
            .pop(queue)?
            .map(|msg| self.inner.deliver(queue, msg)))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.check("ack")?;
        self.settle(delivery_tag)
            .ok_or(AmqpError::AckMessageError)?;
        self.broker().lock().acks.push(delivery_tag);
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.check("reject")?;
        let (queue, msg) = self
            .settle(delivery_tag)
            .ok_or(AmqpError::RejectMessageError)?;
        if requeue {
            self.broker().requeue(&queue, msg);
        } else if let Some(def) = self.broker().queue_definition(&queue) {
            self.broker().dead_letter(&def, msg);
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.check("consume")?;
        if !self.broker().has_queue(queue) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.inner
            .cancelled
            .lock()
            .unwrap()
            .insert(consumer_tag.to_owned(), cancelled.clone());

        let state = (self.inner.clone(), queue.to_owned(), cancelled);

        Ok(stream::unfold(state, |(channel, queue, cancelled)| async move {
            loop {
                if cancelled.load(Ordering::Acquire) || !channel.is_open() {
                    return None;
                }
                let next = channel.broker.pop(&queue);
                match next {
                    Ok(Some(msg)) => {
                        let raw = channel.deliver(&queue, msg);
                        return Some((Ok(raw), (channel, queue, cancelled)));
                    }
                    Ok(None) => tokio::time::sleep(Duration::from_millis(2)).await,
                    Err(err) => return Some((Err(err), (channel, queue, cancelled))),
                }
            }
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.check("cancel")?;
        if let Some(flag) = self.inner.cancelled.lock().unwrap().remove(consumer_tag) {
            flag.store(true, Ordering::Release);
        }
        Ok(())
    }

    async fn basic_qos(&self, _prefetch: u16) -> Result<(), AmqpError> {
        self.check("qos")
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.check("exchange_declare")?;
        self.broker()
            .lock()
            .exchanges
            .insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.check("queue_declare")?;
        self.broker()
            .lock()
            .queues
            .entry(def.name.clone())
            .or_default()
            .def = def.clone();
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.check("queue_bind")?;
        let mut state = self.broker().lock();
        if !state.exchanges.contains_key(&binding.exchange_name) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.check("queue_purge")?;
        Ok(self.broker().drain(queue).len() as u32)
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.check("message_count")?;
        if !self.broker().has_queue(queue) {
            return Err(AmqpError::UnknownQueue(queue.to_owned()));
        }
        Ok(self.broker().ready_count(queue) as u32)
    }

    async fn close(&self) {
        self.kill();
    }
}

/// Hands out in-memory channels; reconnects can be held back by the test.
#[derive(Clone)]
pub(crate) struct MemoryConnector {
    broker: MemoryBroker,
    allow: Arc<Semaphore>,
    connects: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<(Arc<MemoryChannel>, RecoveryTrigger)>>>,
}

impl MemoryConnector {
    /// Connects as often as asked.
    pub fn new(broker: &MemoryBroker) -> MemoryConnector {
        MemoryConnector::gated(broker, Semaphore::MAX_PERMITS)
    }

    /// Allows `permits` connects; further ones wait for `allow_reconnect`.
    pub fn gated(broker: &MemoryBroker, permits: usize) -> MemoryConnector {
        MemoryConnector {
            broker: broker.clone(),
            allow: Arc::new(Semaphore::new(permits)),
            connects: Arc::default(),
            last: Arc::default(),
        }
    }

    pub fn allow_reconnect(&self) {
        self.allow.add_permits(1);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// Kills the current channel and reports the connection loss.
    pub fn fire_connection_loss(&self) {
        let last = self.last.lock().unwrap().clone();
        if let Some((channel, trigger)) = last {
            channel.kill();
            trigger.fire();
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, on_loss: RecoveryTrigger) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let permit = self
            .allow
            .acquire()
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))?;
        permit.forget();

        self.connects.fetch_add(1, Ordering::AcqRel);
        let channel = MemoryChannel::new(&self.broker);
        *self.last.lock().unwrap() = Some((channel.clone(), on_loss));
        Ok(channel)
    }
}
