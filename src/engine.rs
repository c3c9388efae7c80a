// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Engine
//!
//! Wires consumers, the task queue and a fixed pool of workers around one
//! [`MessageBroker`] and one [`Pipeline`].
//!
//! ```text
//! Consumer ─┐                        ┌─ Worker ─ Pipeline ─┐
//! Consumer ─┼─ TaskQueue (bounded) ──┼─ Worker ─ Pipeline ─┼─ MessageBroker
//! Consumer ─┘                        └─ Worker ─ Pipeline ─┘
//! ```

use crate::{
    broker::MessageBroker,
    channel::LapinConnector,
    client::BrokerClient,
    codec::JsonSerializer,
    config::AppConfigs,
    consumer::Consumer,
    errors::EngineError,
    flow::Pipeline,
    task_queue::TaskQueue,
    worker::Worker,
};
use futures_util::future::join_all;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

/// Runtime settings of an [`Engine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Prefix of the consumer tags.
    pub name: String,
    pub workers: usize,
    pub poll_interval: Duration,
    /// basic.qos prefetch count; 0 means one per worker.
    pub prefetch: u16,
    /// Task priority per input queue; missing queues get 0.
    pub priorities: HashMap<String, i32>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            name: "flowline".to_owned(),
            workers: 4,
            poll_interval: Duration::from_millis(250),
            prefetch: 0,
            priorities: HashMap::new(),
        }
    }
}

impl EngineOptions {
    pub fn from_configs(cfg: &AppConfigs) -> EngineOptions {
        EngineOptions {
            name: cfg.app.name.clone(),
            workers: cfg.engine.workers,
            poll_interval: cfg.engine.poll_interval(),
            prefetch: cfg.rabbitmq.prefetch,
            priorities: cfg
                .engine
                .inputs
                .iter()
                .map(|input| (input.queue.clone(), input.priority))
                .collect(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_priority(mut self, queue: &str, priority: i32) -> Self {
        self.priorities.insert(queue.to_owned(), priority);
        self
    }

    fn prefetch_count(&self) -> u16 {
        match self.prefetch {
            0 => u16::try_from(self.workers.max(1)).unwrap_or(u16::MAX),
            prefetch => prefetch,
        }
    }
}

/// Snapshot of the engine load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub running: bool,
    /// Messages held by workers or waiting for one.
    pub in_flight: usize,
    /// Messages waiting for a worker.
    pub queued: usize,
}

struct Running {
    tasks: Arc<TaskQueue>,
    stop_consumers: watch::Sender<bool>,
    stop_workers: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

pub struct Engine {
    broker: Arc<MessageBroker>,
    pipeline: Arc<dyn Pipeline>,
    options: EngineOptions,
    running: tokio::sync::Mutex<Option<Running>>,
    tasks: Mutex<Option<Arc<TaskQueue>>>,
}

impl Engine {
    pub fn new(
        broker: Arc<MessageBroker>,
        pipeline: Arc<dyn Pipeline>,
        options: EngineOptions,
    ) -> Engine {
        Engine {
            broker,
            pipeline,
            options,
            running: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(None),
        }
    }

    /// Connects to RabbitMQ, provisions the topology and builds a stopped
    /// engine with the JSON codec.
    pub async fn from_configs(
        cfg: &AppConfigs,
        pipeline: Arc<dyn Pipeline>,
    ) -> Result<Engine, EngineError> {
        cfg.engine.validate()?;

        let connector = LapinConnector::from_configs(cfg);
        let client =
            BrokerClient::connect(Arc::new(connector), cfg.rabbitmq.reconnect_backoff()).await?;

        let broker = MessageBroker::new(
            client,
            Arc::new(JsonSerializer),
            &cfg.engine.exchange,
            cfg.engine.policies(),
            cfg.engine.outputs.clone(),
        )
        .await?;

        Ok(Engine::new(
            Arc::new(broker),
            pipeline,
            EngineOptions::from_configs(cfg),
        ))
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    /// Sets the prefetch, then starts the workers and one consumer per input
    /// queue.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let workers = self.options.workers.max(1);
        self.broker.qos(self.options.prefetch_count()).await?;

        let tasks = Arc::new(TaskQueue::new(workers));
        let (stop_workers, workers_shutdown) = watch::channel(false);
        let (stop_consumers, consumers_shutdown) = watch::channel(false);

        let worker_handles = (0..workers)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    tasks.clone(),
                    self.broker.clone(),
                    self.pipeline.clone(),
                    self.options.poll_interval,
                    workers_shutdown.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let consumer_handles = self
            .broker
            .inputs()
            .iter()
            .map(|policy| {
                let queue = policy.input_queue();
                let priority = self.options.priorities.get(queue).copied().unwrap_or_default();
                let consumer = Consumer::new(
                    &self.options.name,
                    queue,
                    priority,
                    self.broker.clone(),
                    tasks.clone(),
                    consumers_shutdown.clone(),
                );
                tokio::spawn(consumer.run())
            })
            .collect();

        *self.current_tasks() = Some(tasks.clone());
        *running = Some(Running {
            tasks,
            stop_consumers,
            stop_workers,
            consumers: consumer_handles,
            workers: worker_handles,
        });

        info!(
            pipeline = self.pipeline.name(),
            workers,
            inputs = self.broker.inputs().len(),
            "engine started"
        );
        Ok(())
    }

    /// Stops the consumers, then lets the workers finish every queued and
    /// running task. Does nothing on a stopped engine.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            return;
        };

        state.stop_consumers.send_replace(true);
        state.tasks.close();
        log_join_errors("consumer", join_all(state.consumers).await);

        state.stop_workers.send_replace(true);
        log_join_errors("worker", join_all(state.workers).await);

        *self.current_tasks() = None;
        info!(pipeline = self.pipeline.name(), "engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.current_tasks().is_some()
    }

    pub fn stats(&self) -> EngineStats {
        match self.current_tasks().as_ref() {
            Some(tasks) => EngineStats {
                running: true,
                in_flight: tasks.in_flight(),
                queued: tasks.len(),
            },
            None => EngineStats::default(),
        }
    }

    fn current_tasks(&self) -> MutexGuard<'_, Option<Arc<TaskQueue>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_join_errors(kind: &str, results: Vec<Result<(), tokio::task::JoinError>>) {
    for err in results.into_iter().filter_map(Result::err) {
        error!(kind, error = err.to_string(), "task ended abnormally");
    }
}
