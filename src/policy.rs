// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Failure Policy
//!
//! Per input queue retry and dead-letter routing. The policy is a plain value:
//! it derives defaults from the queue name and answers where a failed message
//! goes next. The broker uses it to settle messages and the topology uses it
//! to know which auxiliary queues to declare.

use std::time::Duration;

/// Default number of redeliveries before a message is failed.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default delay before a retried message becomes visible again.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);

/// Where a failed message is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureRoute {
    /// Publish to the retry exchange with this routing key.
    Retry(String),
    /// Publish to the main exchange with this failed routing key.
    Fail(String),
    /// No destination configured; reject without requeue.
    Drop,
}

/// Retry and dead-letter routing of one input queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    input_queue: String,
    retry_routing_key: Option<String>,
    failed_routing_key: Option<String>,
    max_retries: u32,
    backoff: Duration,
}

impl FailurePolicy {
    /// Creates the default policy: `<queue>.retry`, `<queue>.failed`, five
    /// retries thirty seconds apart.
    pub fn new(queue: &str) -> FailurePolicy {
        FailurePolicy {
            input_queue: queue.to_owned(),
            retry_routing_key: Some(format!("{queue}.retry")),
            failed_routing_key: Some(format!("{queue}.failed")),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_routing_key(mut self, key: &str) -> Self {
        self.retry_routing_key = Some(key.to_owned());
        self
    }

    pub fn with_failed_routing_key(mut self, key: &str) -> Self {
        self.failed_routing_key = Some(key.to_owned());
        self
    }

    /// Disables the retry destination; failures go straight to the failed one.
    pub fn without_retry(mut self) -> Self {
        self.retry_routing_key = None;
        self
    }

    /// Disables the failed destination; exhausted messages are dropped.
    pub fn without_failed(mut self) -> Self {
        self.failed_routing_key = None;
        self
    }

    pub fn input_queue(&self) -> &str {
        &self.input_queue
    }

    pub fn retry_routing_key(&self) -> Option<&str> {
        self.retry_routing_key.as_deref()
    }

    pub fn failed_routing_key(&self) -> Option<&str> {
        self.failed_routing_key.as_deref()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Name of the retry queue; it is declared with the routing key as name.
    pub fn retry_queue(&self) -> Option<&str> {
        self.retry_routing_key()
    }

    /// Name of the failed queue; it is declared with the routing key as name.
    pub fn failed_queue(&self) -> Option<&str> {
        self.failed_routing_key()
    }

    /// Route for a retryable failure of a message redelivered `retries` times.
    pub fn route_for(&self, retries: u32) -> FailureRoute {
        match &self.retry_routing_key {
            Some(key) if retries < self.max_retries => FailureRoute::Retry(key.clone()),
            _ => self.terminal_route(),
        }
    }

    /// Route for a failure that must not be retried.
    pub fn terminal_route(&self) -> FailureRoute {
        match &self.failed_routing_key {
            Some(key) => FailureRoute::Fail(key.clone()),
            None => FailureRoute::Drop,
        }
    }
}
