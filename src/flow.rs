// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Flows
//!
//! A [`Flow`] is the user pipeline run for every message: a `reader` that
//! extracts what it needs from the message, an optional `transformer`, and a
//! `writer` that produces the outgoing messages. Stages are async and run
//! strictly in that order. Their result is classified into an [`Outcome`]
//! that the worker turns into an ack, a retry or a failure.
//!
//! Flows never talk to the broker.

use crate::{errors::CodecError, message::Message};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use std::{
    any::Any,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure signal of a stage.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Transient failure; the message goes through the retry route.
    #[error("retryable failure: {0}")]
    Retry(BoxError),

    /// Permanent failure; the message goes straight to the failed route.
    #[error("terminal failure: {0}")]
    Stop(BoxError),

    /// Nothing to do for this message; it is acked without output.
    #[error("skipped: {0}")]
    Skip(String),
}

impl FlowError {
    pub fn retry(err: impl Into<BoxError>) -> Self {
        FlowError::Retry(err.into())
    }

    pub fn stop(err: impl Into<BoxError>) -> Self {
        FlowError::Stop(err.into())
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        FlowError::Skip(reason.into())
    }
}

// Plain errors raised with `?` inside a stage are retryable.

impl From<BoxError> for FlowError {
    fn from(err: BoxError) -> Self {
        FlowError::Retry(err)
    }
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::retry(err)
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::retry(err)
    }
}

impl From<CodecError> for FlowError {
    fn from(err: CodecError) -> Self {
        FlowError::retry(err)
    }
}

/// Classified result of one pipeline run.
#[derive(Debug)]
pub enum Outcome {
    Completed(Vec<Message>),
    Retry { reason: String },
    Failed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    Retry,
    Failed,
    Skipped,
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Completed(_) => OutcomeKind::Completed,
            Outcome::Retry { .. } => OutcomeKind::Retry,
            Outcome::Failed { .. } => OutcomeKind::Failed,
            Outcome::Skipped { .. } => OutcomeKind::Skipped,
        }
    }

    /// Number of outgoing messages.
    pub fn outputs(&self) -> usize {
        match self {
            Outcome::Completed(messages) => messages.len(),
            _ => 0,
        }
    }
}

impl From<FlowError> for Outcome {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Retry(err) => Outcome::Retry {
                reason: err.to_string(),
            },
            FlowError::Stop(err) => Outcome::Failed {
                reason: err.to_string(),
            },
            FlowError::Skip(reason) => Outcome::Skipped { reason },
        }
    }
}

/// What the engine runs for every message.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, message: &Message) -> Outcome;
}

/// Metrics of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowReport {
    pub flow: String,
    pub source: Option<String>,
    pub tracing_id: Option<String>,
    pub outcome: OutcomeKind,
    pub duration: Duration,
    pub outputs: usize,
}

/// Receives a report after every run. Must return quickly.
#[cfg_attr(test, mockall::automock)]
pub trait FlowMonitor: Send + Sync {
    fn report(&self, report: &FlowReport);
}

/// Logs every report through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl FlowMonitor for TracingMonitor {
    fn report(&self, report: &FlowReport) {
        let duration_ms = report.duration.as_millis() as u64;
        match report.outcome {
            OutcomeKind::Completed | OutcomeKind::Skipped => info!(
                flow = report.flow.as_str(),
                queue = report.source.as_deref(),
                tracing_id = report.tracing_id.as_deref(),
                outcome = ?report.outcome,
                outputs = report.outputs,
                duration_ms,
                "flow finished"
            ),
            OutcomeKind::Retry | OutcomeKind::Failed => warn!(
                flow = report.flow.as_str(),
                queue = report.source.as_deref(),
                tracing_id = report.tracing_id.as_deref(),
                outcome = ?report.outcome,
                duration_ms,
                "flow failed"
            ),
        }
    }
}

type Stage<I, O> = Box<dyn Fn(I) -> BoxFuture<'static, Result<O, FlowError>> + Send + Sync>;

type Cleanup = Arc<dyn Fn() + Send + Sync>;

fn stage<I, O, F, Fut>(f: F) -> Stage<I, O>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, FlowError>> + Send + 'static,
{
    Box::new(move |input: I| f(input).boxed())
}

/// Runs the cleanup hook when dropped, whatever way the run ended.
struct CleanupGuard(Option<Cleanup>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            if catch_unwind(AssertUnwindSafe(|| cleanup())).is_err() {
                error!("flow cleanup panicked");
            }
        }
    }
}

/// Reader, transformer and writer stages plus optional cleanup and monitor.
pub struct Flow<R, W> {
    name: String,
    reader: Stage<Message, R>,
    transformer: Stage<R, W>,
    writer: Stage<W, Vec<Message>>,
    cleanup: Option<Cleanup>,
    monitor: Option<Arc<dyn FlowMonitor>>,
}

impl<R: Send + 'static> Flow<R, R> {
    /// Flow without a transformer.
    pub fn new<RF, RFut, WF, WFut>(reader: RF, writer: WF) -> Self
    where
        RF: Fn(Message) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<R, FlowError>> + Send + 'static,
        WF: Fn(R) -> WFut + Send + Sync + 'static,
        WFut: Future<Output = Result<Vec<Message>, FlowError>> + Send + 'static,
    {
        Flow::with_transformer(reader, |r| async move { Ok(r) }, writer)
    }
}

impl<R: Send + 'static, W: Send + 'static> Flow<R, W> {
    pub fn with_transformer<RF, RFut, TF, TFut, WF, WFut>(
        reader: RF,
        transformer: TF,
        writer: WF,
    ) -> Self
    where
        RF: Fn(Message) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<R, FlowError>> + Send + 'static,
        TF: Fn(R) -> TFut + Send + Sync + 'static,
        TFut: Future<Output = Result<W, FlowError>> + Send + 'static,
        WF: Fn(W) -> WFut + Send + Sync + 'static,
        WFut: Future<Output = Result<Vec<Message>, FlowError>> + Send + 'static,
    {
        Flow {
            name: "flow".to_owned(),
            reader: stage(reader),
            transformer: stage(transformer),
            writer: stage(writer),
            cleanup: None,
            monitor: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    /// Hook run after every message, panics included.
    pub fn cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.cleanup = Some(Arc::new(cleanup));
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn FlowMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    async fn run(&self, message: &Message) -> Result<Vec<Message>, FlowError> {
        let read = (self.reader)(message.clone()).await?;
        let transformed = (self.transformer)(read).await?;
        (self.writer)(transformed).await
    }

    fn report(&self, message: &Message, outcome: &Outcome, duration: Duration) {
        let Some(monitor) = &self.monitor else {
            return;
        };

        let report = FlowReport {
            flow: self.name.clone(),
            source: message.envelope().source().map(str::to_owned),
            tracing_id: message.tracing_id().map(str::to_owned),
            outcome: outcome.kind(),
            duration,
            outputs: outcome.outputs(),
        };

        if catch_unwind(AssertUnwindSafe(|| monitor.report(&report))).is_err() {
            error!(flow = self.name.as_str(), "flow monitor panicked");
        }
    }
}

#[async_trait]
impl<R: Send + 'static, W: Send + 'static> Pipeline for Flow<R, W> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, message: &Message) -> Outcome {
        let _cleanup = CleanupGuard(self.cleanup.clone());
        let started = Instant::now();

        let outcome = match AssertUnwindSafe(self.run(message)).catch_unwind().await {
            Ok(Ok(mut outputs)) => {
                for output in &mut outputs {
                    output.inherit_tracing(message);
                }
                Outcome::Completed(outputs)
            }
            Ok(Err(err)) => Outcome::from(err),
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                error!(flow = self.name.as_str(), reason = reason.as_str(), "flow panicked");
                Outcome::Retry { reason }
            }
        };

        debug!(flow = self.name.as_str(), outcome = ?outcome.kind(), "message processed");
        self.report(message, &outcome, started.elapsed());
        outcome
    }
}

pub(crate) fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        format!("panic: {reason}")
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        format!("panic: {reason}")
    } else {
        "panic".to_owned()
    }
}
