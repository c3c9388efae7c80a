// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Queue
//!
//! Bounded, priority ordered hand-off between consumers and workers. A
//! counting semaphore holds one permit per worker: a consumer acquires a
//! [`Slot`] before decoding a delivery and the slot travels with the
//! [`Task`] until the worker is done with it. The engine therefore never
//! holds more messages in memory than it has workers.

use crate::{flow::Outcome, message::Message};
use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time::Instant,
};

/// One-shot completion callback of a task.
pub type Callback = Box<dyn FnOnce(&Outcome) + Send>;

/// A reserved worker slot. Dropping it gives the slot back.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

/// A message waiting for, or held by, a worker.
pub struct Task {
    message: Message,
    priority: i32,
    sequence: u64,
    callback: Option<Callback>,
    _slot: Slot,
}

impl Task {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Fires the completion callback and frees the slot.
    pub fn complete(mut self, outcome: &Outcome) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    // max-heap: higher priority first, then earlier arrival
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

pub struct TaskQueue {
    capacity: usize,
    slots: Arc<Semaphore>,
    heap: Mutex<BinaryHeap<Task>>,
    ready: Notify,
    sequence: AtomicU64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> TaskQueue {
        let capacity = capacity.max(1);
        TaskQueue {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            heap: Mutex::new(BinaryHeap::with_capacity(capacity)),
            ready: Notify::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Waits for a free slot. Returns `None` once the queue is closed.
    pub async fn acquire(&self) -> Option<Slot> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    /// Queues `message` in the slot reserved for it.
    pub fn push(&self, slot: Slot, message: Message, priority: i32, callback: Option<Callback>) {
        let task = Task {
            message,
            priority,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            callback,
            _slot: slot,
        };

        self.heap().push(task);
        self.ready.notify_one();
    }

    /// Waits for a slot and queues `message`. Returns `false` once the queue
    /// is closed.
    pub async fn enqueue(&self, message: Message, priority: i32) -> bool {
        match self.acquire().await {
            Some(slot) => {
                self.push(slot, message, priority, None);
                true
            }
            None => false,
        }
    }

    /// Pops the highest priority task, waiting at most `timeout` for one.
    pub async fn next(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.ready.notified();
            let popped = self.heap().pop();
            if popped.is_some() {
                return popped;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.heap().pop();
            }
        }
    }

    /// Refuses further slots; queued tasks can still be taken.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots held by queued or running tasks.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Tasks waiting for a worker.
    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Task>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn msg(n: i64) -> Message {
        Message::new(json!(n))
    }

    #[tokio::test]
    async fn bounded_by_capacity() {
        let queue = TaskQueue::new(2);
        assert!(queue.enqueue(msg(1), 0).await);
        assert!(queue.enqueue(msg(2), 0).await);
        assert_eq!(queue.in_flight(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.acquire()).await;
        assert!(blocked.is_err());

        let task = queue.next(Duration::from_millis(10)).await.unwrap();
        assert_eq!(queue.in_flight(), 2);
        drop(task);
        assert_eq!(queue.in_flight(), 1);
        assert!(queue.acquire().await.is_some());
    }

    #[tokio::test]
    async fn higher_priority_first_then_arrival() {
        let queue = TaskQueue::new(4);
        queue.enqueue(msg(1), 0).await;
        queue.enqueue(msg(2), 5).await;
        queue.enqueue(msg(3), 0).await;
        queue.enqueue(msg(4), 5).await;

        let mut order = vec![];
        while let Some(task) = queue.next(Duration::from_millis(5)).await {
            order.push(task.message().payload().as_i64().unwrap());
        }
        assert_eq!(order, [2, 4, 1, 3]);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn next_times_out_when_empty() {
        let queue = TaskQueue::new(1);
        let started = Instant::now();
        assert!(queue.next(Duration::from_millis(20)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn next_wakes_on_push() {
        let queue = Arc::new(TaskQueue::new(1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(msg(9), 0).await;

        let task = waiter.await.unwrap().unwrap();
        assert_eq!(task.message().payload(), &json!(9));
    }

    #[tokio::test]
    async fn callback_fires_once_on_complete() {
        let queue = TaskQueue::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let slot = queue.acquire().await.unwrap();
        queue.push(
            slot,
            msg(1),
            0,
            Some(Box::new(move |outcome: &Outcome| {
                assert!(matches!(outcome, Outcome::Skipped { .. }));
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let task = queue.next(Duration::from_millis(10)).await.unwrap();
        task.complete(&Outcome::Skipped {
            reason: "noop".to_owned(),
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_queue_refuses_slots() {
        let queue = TaskQueue::new(1);
        queue.close();
        assert!(queue.acquire().await.is_none());
        assert!(!queue.enqueue(msg(1), 0).await);
    }
}
