// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Workers
//!
//! A fixed pool of workers drains the task queue. Each task runs the
//! pipeline once and is settled on the broker from its outcome.

use crate::{
    broker::{Disposition, MessageBroker},
    errors::AmqpError,
    flow::{panic_reason, Outcome, Pipeline},
    message::Message,
    otel,
    task_queue::{Task, TaskQueue},
};
use futures_util::FutureExt;
use opentelemetry::{
    trace::{Status, TraceContextExt},
    Context,
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

/// Takes tasks off the queue one at a time, runs the pipeline and settles the
/// message according to the outcome.
pub(crate) struct Worker {
    id: usize,
    tasks: Arc<TaskQueue>,
    broker: Arc<MessageBroker>,
    pipeline: Arc<dyn Pipeline>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        tasks: Arc<TaskQueue>,
        broker: Arc<MessageBroker>,
        pipeline: Arc<dyn Pipeline>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Worker {
        Worker {
            id,
            tasks,
            broker,
            pipeline,
            poll_interval,
            shutdown,
        }
    }

    /// Runs until shutdown is requested and the queue is drained.
    pub(crate) async fn run(self) {
        debug!(worker = self.id, "worker started");

        loop {
            match self.tasks.next(self.poll_interval).await {
                Some(task) => self.handle(task).await,
                None if *self.shutdown.borrow() => break,
                None => {}
            }
        }

        debug!(worker = self.id, "worker stopped");
    }

    async fn handle(&self, task: Task) {
        let message = task.message();
        let source = message.envelope().source().unwrap_or_default();
        let ctx = otel::process_context(message.envelope().properties(), self.pipeline.name());

        let span = info_span!(
            "process",
            worker = self.id,
            pipeline = self.pipeline.name(),
            queue = source,
            tracing_id = message.tracing_id(),
            retries = message.envelope().retries(),
        );

        let outcome = async {
            let outcome = match AssertUnwindSafe(self.pipeline.process(message))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let reason = panic_reason(panic.as_ref());
                    error!(reason = reason.as_str(), "pipeline panicked");
                    Outcome::Retry { reason }
                }
            };
            if let Err(err) = self.settle(&ctx, message, &outcome).await {
                error!(error = err.to_string(), "failure to settle message");
                ctx.span().record_error(&err);
            }
            outcome
        }
        .instrument(span)
        .await;

        match &outcome {
            Outcome::Completed(_) | Outcome::Skipped { .. } => ctx.span().set_status(Status::Ok),
            Outcome::Retry { reason } | Outcome::Failed { reason } => {
                ctx.span().set_status(Status::Error {
                    description: Cow::from(reason.clone()),
                })
            }
        }
        ctx.span().end();

        task.complete(&outcome);
    }

    async fn settle(
        &self,
        ctx: &Context,
        message: &Message,
        outcome: &Outcome,
    ) -> Result<Disposition, AmqpError> {
        let disposition = match outcome {
            Outcome::Completed(outputs) => {
                for output in outputs {
                    if let Err(err) = self.broker.send_in(ctx, None, output).await {
                        error!(error = err.to_string(), "failure to send output, retrying message");
                        return self.broker.reject(message).await;
                    }
                }
                self.broker.ack(message).await?
            }
            Outcome::Skipped { reason } => {
                info!(reason = reason.as_str(), "message skipped");
                self.broker.ack(message).await?
            }
            Outcome::Retry { .. } => self.broker.reject(message).await?,
            Outcome::Failed { .. } => self.broker.fail(message).await?,
        };

        debug!(disposition = ?disposition, "message settled");
        Ok(disposition)
    }
}
