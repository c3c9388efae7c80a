// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Input Queue Consumer
//!
//! One consumer per input queue. It registers a push consumer on the broker
//! and turns every delivery into a [`Task`](crate::task_queue::Task): a worker
//! slot is acquired before the body is decoded, so a flood of deliveries is
//! held back by the broker and not buffered here. Bodies that cannot be
//! decoded are discarded through the fail-fast rule and give their slot back
//! at once.
//!
//! When the delivery stream ends without a stop request, for example after a
//! channel recovery, the consumer subscribes again.

use crate::{
    broker::MessageBroker,
    channel::{DeliveryStream, RawDelivery},
    task_queue::TaskQueue,
};
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

pub(crate) struct Consumer {
    queue: String,
    priority: i32,
    tag: String,
    broker: Arc<MessageBroker>,
    tasks: Arc<TaskQueue>,
    shutdown: watch::Receiver<bool>,
}

impl Consumer {
    pub(crate) fn new(
        app: &str,
        queue: &str,
        priority: i32,
        broker: Arc<MessageBroker>,
        tasks: Arc<TaskQueue>,
        shutdown: watch::Receiver<bool>,
    ) -> Consumer {
        Consumer {
            queue: queue.to_owned(),
            priority,
            tag: consumer_tag(app, queue),
            broker,
            tasks,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(queue = self.queue.as_str(), tag = self.tag.as_str(), "consumer started");

        while !self.stopping() {
            let subscribed = tokio::select! {
                subscribed = self.broker.consume(&self.queue, &self.tag) => subscribed,
                _ = self.shutdown.changed() => break,
            };

            let (mut stream, generation) = match subscribed {
                Ok(subscription) => subscription,
                Err(err) => {
                    error!(
                        queue = self.queue.as_str(),
                        error = err.to_string(),
                        "failure to create the consumer"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                        _ = self.shutdown.changed() => break,
                    }
                }
            };

            if self.deliver_all(&mut stream, generation).await {
                self.stop(stream, generation).await;
                return;
            }

            warn!(queue = self.queue.as_str(), "delivery stream ended, subscribing again");
        }

        info!(queue = self.queue.as_str(), "consumer stopped");
    }

    /// Feeds deliveries to the task queue until the stream ends (`false`) or
    /// a stop is requested (`true`).
    async fn deliver_all(&mut self, stream: &mut DeliveryStream, generation: u64) -> bool {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = self.shutdown.changed() => return true,
            };

            match next {
                Some(Ok(raw)) => {
                    if !self.dispatch(raw, generation).await {
                        return true;
                    }
                }
                Some(Err(err)) => {
                    error!(queue = self.queue.as_str(), error = err.to_string(), "errors consume msg")
                }
                None => return false,
            }
        }
    }

    /// Hands one delivery to the workers. Returns `false` when the engine is
    /// stopping and the delivery was given back to the broker.
    async fn dispatch(&mut self, raw: RawDelivery, generation: u64) -> bool {
        let slot = tokio::select! {
            slot = self.tasks.acquire() => slot,
            _ = self.shutdown.changed() => None,
        };

        let Some(slot) = slot else {
            self.give_back(&raw, generation).await;
            return false;
        };

        match self.broker.decode(&raw, generation, &self.queue) {
            Ok(message) => {
                debug!(queue = self.queue.as_str(), tag = raw.delivery_tag, "message received");
                self.tasks.push(slot, message, self.priority, None);
            }
            Err(err) => {
                drop(slot);
                warn!(queue = self.queue.as_str(), error = err.to_string(), "malformed message");
                if let Err(err) = self
                    .broker
                    .discard_malformed(&raw, generation, &self.queue)
                    .await
                {
                    error!(
                        queue = self.queue.as_str(),
                        error = err.to_string(),
                        "failure to discard malformed message"
                    );
                }
            }
        }

        true
    }

    /// Cancels the broker consumer and requeues what it still delivers.
    async fn stop(&self, mut stream: DeliveryStream, generation: u64) {
        if let Err(err) = self.broker.cancel(&self.tag).await {
            error!(queue = self.queue.as_str(), error = err.to_string(), "failure to cancel consumer");
        }

        while let Ok(Some(next)) = tokio::time::timeout(DRAIN_TIMEOUT, stream.next()).await {
            if let Ok(raw) = next {
                self.give_back(&raw, generation).await;
            }
        }

        info!(queue = self.queue.as_str(), "consumer stopped");
    }

    async fn give_back(&self, raw: &RawDelivery, generation: u64) {
        if let Err(err) = self.broker.requeue(raw, generation).await {
            warn!(
                queue = self.queue.as_str(),
                error = err.to_string(),
                "failure to requeue delivery"
            );
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// `<app>.<queue>.<uuid>`
pub(crate) fn consumer_tag(app: &str, queue: &str) -> String {
    format!("{app}.{queue}.{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::BrokerClient,
        codec::JsonSerializer,
        memory::{MemoryBroker, MemoryConnector},
        message::Message,
        policy::FailurePolicy,
    };
    use lapin::BasicProperties;
    use serde_json::json;

    const BACKOFF: (Duration, Duration) = (Duration::from_millis(5), Duration::from_millis(20));

    async fn setup(capacity: usize) -> (MemoryBroker, MemoryConnector, Arc<MessageBroker>, Arc<TaskQueue>) {
        let memory = MemoryBroker::new();
        let connector = MemoryConnector::new(&memory);
        let client = BrokerClient::connect(Arc::new(connector.clone()), BACKOFF)
            .await
            .unwrap();
        let broker = MessageBroker::new(
            client,
            Arc::new(JsonSerializer),
            "jobs",
            vec![FailurePolicy::new("q.in")],
            vec![],
        )
        .await
        .unwrap();
        (memory, connector, Arc::new(broker), Arc::new(TaskQueue::new(capacity)))
    }

    #[test]
    fn tag_names_app_and_queue() {
        let tag = consumer_tag("orders", "q.in");
        assert!(tag.starts_with("orders.q.in."));
        assert!(Uuid::parse_str(&tag["orders.q.in.".len()..]).is_ok());
    }

    #[tokio::test]
    async fn deliveries_become_prioritized_tasks() {
        let (_memory, _connector, broker, tasks) = setup(2).await;
        let (stop, shutdown) = watch::channel(false);
        let consumer = tokio::spawn(
            Consumer::new("app", "q.in", 7, broker.clone(), tasks.clone(), shutdown).run(),
        );

        broker
            .send(Some("q.in"), &Message::new(json!("a")).with_tracing_id("t1"))
            .await
            .unwrap();

        let task = tasks.next(Duration::from_secs(2)).await.unwrap();
        assert_eq!(task.priority(), 7);
        assert_eq!(task.message().tracing_id(), Some("t1"));
        assert_eq!(task.message().envelope().source(), Some("q.in"));

        stop.send_replace(true);
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn waits_for_a_free_slot() {
        let (memory, _connector, broker, tasks) = setup(1).await;
        let (stop, shutdown) = watch::channel(false);
        let consumer = tokio::spawn(
            Consumer::new("app", "q.in", 0, broker.clone(), tasks.clone(), shutdown).run(),
        );

        for n in 0..3 {
            broker.send(Some("q.in"), &Message::new(json!(n))).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.in_flight(), 1);
        // one taken by the consumer and waiting for a slot, one still queued
        assert_eq!(memory.ready_count("q.in"), 1);

        let first = tasks.next(Duration::from_millis(10)).await.unwrap();
        broker.ack(first.message()).await.unwrap();
        drop(first);

        let second = tasks.next(Duration::from_secs(2)).await.unwrap();
        assert_eq!(second.message().payload(), &json!(1));

        stop.send_replace(true);
        consumer.await.unwrap();
        drop(second);
        // the delivery held while waiting for a slot went back to the queue
        assert_eq!(memory.ready_count("q.in"), 1);
    }

    #[tokio::test]
    async fn malformed_deliveries_release_their_slot() {
        let (memory, _connector, broker, tasks) = setup(1).await;
        let (stop, shutdown) = watch::channel(false);
        let consumer = tokio::spawn(
            Consumer::new("app", "q.in", 0, broker.clone(), tasks.clone(), shutdown).run(),
        );

        memory.inject("q.in", b"{broken", BasicProperties::default());
        broker.send(Some("q.in"), &Message::new(json!("ok"))).await.unwrap();

        let task = tasks.next(Duration::from_secs(2)).await.unwrap();
        assert_eq!(task.message().payload(), &json!("ok"));
        assert_eq!(memory.drain("q.in.failed")[0].data, b"{broken");

        stop.send_replace(true);
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn resubscribes_after_recovery() {
        let (_memory, connector, broker, tasks) = setup(1).await;
        let (stop, shutdown) = watch::channel(false);
        let consumer = tokio::spawn(
            Consumer::new("app", "q.in", 0, broker.clone(), tasks.clone(), shutdown).run(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        connector.fire_connection_loss();
        broker.client().wait_available().await.unwrap();
        assert_eq!(broker.client().generation(), 2);

        broker.send(Some("q.in"), &Message::new(json!(1))).await.unwrap();
        let task = tasks.next(Duration::from_secs(3)).await.unwrap();
        assert_eq!(task.message().envelope().delivery().unwrap().generation, 2);

        stop.send_replace(true);
        consumer.await.unwrap();
    }
}
