// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient Broker Client
//!
//! Every channel operation goes through a single execution gate. An operation
//! runs only while the channel is marked available; when it fails because the
//! channel or its connection went away, the channel is marked as recovering
//! and the caller parks on the status channel until the background recovery
//! task has reconnected, replayed the recorded topology and marked the channel
//! available again. The caller then retries its own operation.
//!
//! Operations are therefore never reported successful unless they ran on a
//! live channel, and never lost to a transient disconnect. Errors that are not
//! channel faults are returned to the caller immediately.

use crate::{
    channel::{AmqpChannel, Connector, DeliveryStream, RawDelivery},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::Declaration,
};
use futures_util::{future::BoxFuture, FutureExt};
use lapin::BasicProperties;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// Availability of the channel behind the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Available,
    Recovering,
    Closed,
}

/// Handle given to a [`Connector`] to report that the connection behind a
/// channel failed.
///
/// The trigger only holds a weak reference to the client and remembers the
/// channel generation it was issued for, so a late notification from a
/// superseded connection is ignored.
#[derive(Clone)]
pub struct RecoveryTrigger {
    shared: Weak<Shared>,
    generation: u64,
}

impl RecoveryTrigger {
    /// Marks the channel as recovering and wakes the recovery task.
    pub fn fire(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.request_recovery(self.generation, "connection lost");
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Gate {
    channel: Option<Arc<dyn AmqpChannel>>,
    declarations: Vec<Declaration>,
    prefetch: Option<u16>,
}

impl Gate {
    fn record(&mut self, declaration: Declaration) {
        match self
            .declarations
            .iter_mut()
            .find(|d| d.same_object(&declaration))
        {
            Some(existing) => *existing = declaration,
            None => self.declarations.push(declaration),
        }
    }
}

struct Shared {
    me: Weak<Shared>,
    gate: Mutex<Gate>,
    status: watch::Sender<ChannelStatus>,
    generation: AtomicU64,
    wake: Notify,
    connector: Arc<dyn Connector>,
    backoff: (Duration, Duration),
}

impl Shared {
    fn trigger(&self, generation: u64) -> RecoveryTrigger {
        RecoveryTrigger {
            shared: self.me.clone(),
            generation,
        }
    }

    fn request_recovery(&self, generation: u64, reason: &str) {
        if generation != self.generation.load(Ordering::Acquire) {
            debug!(generation, "ignoring recovery request of a superseded channel");
            return;
        }

        let changed = self.status.send_if_modified(|status| {
            if *status == ChannelStatus::Available {
                *status = ChannelStatus::Recovering;
                true
            } else {
                false
            }
        });

        if changed {
            warn!(generation, reason, "channel unavailable, starting recovery");
            self.wake.notify_one();
        }
    }

    fn is_closed(&self) -> bool {
        *self.status.borrow() == ChannelStatus::Closed
    }

    async fn recovery_loop(self: Arc<Self>) {
        loop {
            self.wake.notified().await;

            let status = *self.status.borrow();
            match status {
                ChannelStatus::Closed => return,
                ChannelStatus::Available => continue,
                ChannelStatus::Recovering => self.recover().await,
            }
        }
    }

    async fn recover(&self) {
        let (min, max) = self.backoff;
        let mut delay = min;

        loop {
            if self.is_closed() {
                return;
            }

            let next = self.generation.load(Ordering::Acquire) + 1;
            match self.connector.connect(self.trigger(next)).await {
                Ok(channel) => {
                    let mut gate = self.gate.lock().await;
                    if self.is_closed() {
                        drop(gate);
                        channel.close().await;
                        return;
                    }

                    match replay(channel.as_ref(), &gate).await {
                        Ok(()) => {
                            let old = gate.channel.replace(channel);
                            self.generation.store(next, Ordering::Release);
                            self.status.send_replace(ChannelStatus::Available);
                            drop(gate);

                            info!(generation = next, "channel recovered");
                            if let Some(old) = old {
                                old.close().await;
                            }
                            return;
                        }
                        Err(err) => {
                            drop(gate);
                            warn!(error = err.to_string(), "failure to replay topology");
                            channel.close().await;
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        retry_in_ms = delay.as_millis() as u64,
                        "failure to reconnect"
                    );
                }
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max);
        }
    }
}

/// Re-applies every recorded declaration and the QoS setting.
///
/// A channel fault aborts the replay so the recovery task reconnects again;
/// any other failure is logged and the declaration skipped.
async fn replay(channel: &dyn AmqpChannel, gate: &Gate) -> Result<(), AmqpError> {
    for declaration in &gate.declarations {
        let result = match declaration {
            Declaration::Exchange(def) => channel.exchange_declare(def).await,
            Declaration::Queue(def) => channel.queue_declare(def).await,
            Declaration::Binding(binding) => channel.queue_bind(binding).await,
        };

        match result {
            Err(err) if err.is_recoverable() => return Err(err),
            Err(err) => error!(
                error = err.to_string(),
                declaration = ?declaration,
                "failure to replay declaration"
            ),
            Ok(()) => {}
        }
    }

    if let Some(prefetch) = gate.prefetch {
        match channel.basic_qos(prefetch).await {
            Err(err) if err.is_recoverable() => return Err(err),
            Err(err) => error!(error = err.to_string(), "failure to replay qos"),
            Ok(()) => {}
        }
    }

    debug!(declarations = gate.declarations.len(), "topology replayed");
    Ok(())
}

/// Thread safe, reconnecting access to one AMQP channel.
///
/// Cloning is cheap; all clones share the same channel and gate. Call
/// [`BrokerClient::close`] to stop the background recovery task.
#[derive(Clone)]
pub struct BrokerClient {
    shared: Arc<Shared>,
}

impl BrokerClient {
    /// Opens the first channel and starts the recovery task.
    ///
    /// A failure to reach the broker here is a startup fault and is returned
    /// as is; nothing is left running.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        reconnect_backoff: (Duration, Duration),
    ) -> Result<BrokerClient, AmqpError> {
        let (status, _) = watch::channel(ChannelStatus::Recovering);
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            gate: Mutex::new(Gate {
                channel: None,
                declarations: vec![],
                prefetch: None,
            }),
            status,
            generation: AtomicU64::new(0),
            wake: Notify::new(),
            connector,
            backoff: reconnect_backoff,
        });

        let channel = shared.connector.connect(shared.trigger(1)).await?;
        shared.gate.lock().await.channel = Some(channel);
        shared.generation.store(1, Ordering::Release);
        shared.status.send_replace(ChannelStatus::Available);

        tokio::spawn(shared.clone().recovery_loop());
        info!("broker client connected");

        Ok(BrokerClient { shared })
    }

    pub fn status(&self) -> ChannelStatus {
        *self.shared.status.borrow()
    }

    /// Generation of the current channel; bumped on every recovery.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Declarations that will be replayed after a reconnect.
    pub async fn declarations(&self) -> Vec<Declaration> {
        self.shared.gate.lock().await.declarations.clone()
    }

    /// Waits until the channel is available. Fails once the client is closed.
    pub async fn wait_available(&self) -> Result<(), AmqpError> {
        let mut status = self.shared.status.subscribe();
        let current = *status
            .wait_for(|s| *s != ChannelStatus::Recovering)
            .await
            .map_err(|_| AmqpError::ClientClosed)?;

        match current {
            ChannelStatus::Closed => Err(AmqpError::ClientClosed),
            _ => Ok(()),
        }
    }

    /// Runs `op` against the live channel, waiting out recoveries.
    async fn execute<'a, T, F>(
        &self,
        name: &str,
        record: Option<Declaration>,
        op: F,
    ) -> Result<T, AmqpError>
    where
        F: Fn(Arc<dyn AmqpChannel>, u64) -> BoxFuture<'a, Result<T, AmqpError>>,
    {
        loop {
            self.wait_available().await?;

            let mut gate = self.shared.gate.lock().await;
            // the status may have changed while waiting for the lock
            if *self.shared.status.borrow() != ChannelStatus::Available {
                continue;
            }
            let Some(channel) = gate.channel.clone() else {
                continue;
            };
            let generation = self.generation();

            match op(channel, generation).await {
                Ok(value) => {
                    if let Some(declaration) = &record {
                        gate.record(declaration.clone());
                    }
                    return Ok(value);
                }
                Err(err) if err.is_recoverable() => {
                    drop(gate);
                    warn!(
                        operation = name,
                        error = err.to_string(),
                        "channel fault, waiting for recovery"
                    );
                    self.shared.request_recovery(generation, name);
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &BasicProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.execute("publish", None, |channel, _| {
            let properties = properties.clone();
            async move {
                channel
                    .basic_publish(exchange, routing_key, properties, payload)
                    .await
            }
            .boxed()
        })
        .await
    }

    /// Fetches one message; the returned generation scopes its delivery tag.
    pub async fn get(&self, queue: &str) -> Result<Option<(RawDelivery, u64)>, AmqpError> {
        self.execute("get", None, |channel, generation| {
            async move {
                let delivery = channel.basic_get(queue).await?;
                Ok::<_, AmqpError>(delivery.map(|delivery| (delivery, generation)))
            }
            .boxed()
        })
        .await
    }

    /// Acks a delivery. Tags issued by a previous channel are refused with
    /// [`AmqpError::StaleDelivery`]: the broker already requeued them.
    pub async fn ack(&self, delivery_tag: u64, generation: u64) -> Result<(), AmqpError> {
        self.execute("ack", None, |channel, current| {
            async move {
                if current != generation {
                    return Err(AmqpError::StaleDelivery(delivery_tag));
                }
                channel.basic_ack(delivery_tag).await
            }
            .boxed()
        })
        .await
    }

    pub async fn reject(
        &self,
        delivery_tag: u64,
        generation: u64,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.execute("reject", None, |channel, current| {
            async move {
                if current != generation {
                    return Err(AmqpError::StaleDelivery(delivery_tag));
                }
                channel.basic_reject(delivery_tag, requeue).await
            }
            .boxed()
        })
        .await
    }

    /// Registers a push consumer; the returned generation scopes the delivery
    /// tags of the stream.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<(DeliveryStream, u64), AmqpError> {
        self.execute("consume", None, |channel, generation| {
            async move {
                let stream = channel.basic_consume(queue, consumer_tag).await?;
                Ok::<_, AmqpError>((stream, generation))
            }
            .boxed()
        })
        .await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.execute("cancel", None, |channel, _| {
            async move { channel.basic_cancel(consumer_tag).await }.boxed()
        })
        .await
    }

    /// Sets the prefetch count; replayed after a reconnect.
    pub async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.execute("qos", None, |channel, _| {
            async move { channel.basic_qos(prefetch).await }.boxed()
        })
        .await?;

        self.shared.gate.lock().await.prefetch = Some(prefetch);
        Ok(())
    }

    pub async fn declare_exchange(&self, def: ExchangeDefinition) -> Result<(), AmqpError> {
        let record = Declaration::Exchange(def.clone());
        self.execute("exchange.declare", Some(record), |channel, _| {
            let def = def.clone();
            async move { channel.exchange_declare(&def).await }.boxed()
        })
        .await
    }

    pub async fn declare_queue(&self, def: QueueDefinition) -> Result<(), AmqpError> {
        let record = Declaration::Queue(def.clone());
        self.execute("queue.declare", Some(record), |channel, _| {
            let def = def.clone();
            async move { channel.queue_declare(&def).await }.boxed()
        })
        .await
    }

    pub async fn bind_queue(&self, binding: QueueBinding) -> Result<(), AmqpError> {
        let record = Declaration::Binding(binding.clone());
        self.execute("queue.bind", Some(record), |channel, _| {
            let binding = binding.clone();
            async move { channel.queue_bind(&binding).await }.boxed()
        })
        .await
    }

    pub async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.execute("queue.purge", None, |channel, _| {
            async move { channel.queue_purge(queue).await }.boxed()
        })
        .await
    }

    pub async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.execute("message_count", None, |channel, _| {
            async move { channel.message_count(queue).await }.boxed()
        })
        .await
    }

    /// Closes the channel, stops the recovery task and fails every pending
    /// and future operation with [`AmqpError::ClientClosed`].
    pub async fn close(&self) {
        self.shared.status.send_replace(ChannelStatus::Closed);
        self.shared.wake.notify_one();

        let channel = self.shared.gate.lock().await.channel.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        info!("broker client closed");
    }
}
