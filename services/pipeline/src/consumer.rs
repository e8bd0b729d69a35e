//! Batch consumers driving handlers off a queue buffer.
//!
//! A consumer receives up to `batch_size` messages (waiting at most
//! `max_wait` for the batch to fill), hands them to its handler and acks each
//! message that succeeded. Failed messages are reported per message and left
//! in flight; the queue makes them visible again once their visibility
//! timeout passes, and redrives them to the dead-letter queue when their
//! receive budget is spent. An invocation exceeding its timeout acks nothing.

use crate::config::QueueConfig;
use crate::queue::{QueueBuffer, QueueMessage};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors a handler reports for a single message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth retrying: store or transport hiccup
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Will fail on every delivery; ends up in the dead-letter queue
    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl HandlerError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, HandlerError::Malformed(_))
    }
}

/// Handler trait for processing queue messages
#[async_trait::async_trait]
pub trait MessageHandler<T: Send + Sync + 'static>: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: &QueueMessage<T>) -> Result<(), HandlerError>;

    /// Process a batch; one result per message, in order.
    ///
    /// The default runs every message concurrently so one failure never
    /// affects the others.
    async fn handle_batch(&self, batch: &[QueueMessage<T>]) -> Vec<Result<(), HandlerError>> {
        join_all(batch.iter().map(|message| self.handle(message))).await
    }

    /// Called when processing of a message fails
    async fn on_error(&self, message: &QueueMessage<T>, error: &HandlerError) {
        warn!(
            message_id = %message.id,
            receive_count = message.receive_count,
            error = %error,
            "Message processing failed"
        );
    }
}

/// Function-based message handler
pub struct FnHandler<F> {
    handler: F,
}

impl<F> FnHandler<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait::async_trait]
impl<T, F, Fut> MessageHandler<T> for FnHandler<F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(QueueMessage<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &QueueMessage<T>) -> Result<(), HandlerError> {
        (self.handler)(message.clone()).await
    }
}

/// Polling parameters of a consumer
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub max_wait: Duration,
    pub invocation_timeout: Duration,
    pub concurrency: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        ConsumerSettings::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for ConsumerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_wait: config.max_wait(),
            invocation_timeout: config.invocation_timeout(),
            concurrency: config.concurrency,
        }
    }
}

/// Outcome of one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub acked: usize,
    pub failed: usize,
    pub timed_out: bool,
}

/// Consumer binding a handler to a queue
pub struct BatchConsumer<T, H> {
    name: String,
    queue: Arc<QueueBuffer<T>>,
    handler: Arc<H>,
    settings: ConsumerSettings,
}

impl<T, H> BatchConsumer<T, H>
where
    T: Clone + Send + Sync + 'static,
    H: MessageHandler<T> + 'static,
{
    pub fn new(
        name: impl Into<String>,
        queue: Arc<QueueBuffer<T>>,
        handler: Arc<H>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            handler,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<QueueBuffer<T>> {
        &self.queue
    }

    /// Receive one batch and process it
    pub async fn run_once(&self) -> BatchReport {
        let batch = self
            .queue
            .receive(self.settings.batch_size, self.settings.max_wait)
            .await;
        self.process(batch).await
    }

    /// Process an already received batch
    #[instrument(skip(self, batch), fields(consumer = %self.name, size = batch.len()))]
    pub async fn process(&self, batch: Vec<QueueMessage<T>>) -> BatchReport {
        let mut report = BatchReport {
            received: batch.len(),
            ..Default::default()
        };

        if batch.is_empty() {
            return report;
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.settings.invocation_timeout,
            self.handler.handle_batch(&batch),
        )
        .await;

        metrics::histogram!("pipeline.consumer.batch_duration_seconds", "consumer" => self.name.clone())
            .record(started.elapsed().as_secs_f64());

        let results = match outcome {
            Ok(results) => results,
            Err(_) => {
                error!(
                    timeout = ?self.settings.invocation_timeout,
                    "Invocation timed out, batch will be redelivered"
                );
                metrics::counter!("pipeline.consumer.timeouts", "consumer" => self.name.clone())
                    .increment(1);
                report.timed_out = true;
                report.failed = batch.len();
                return report;
            }
        };

        for (message, result) in batch.iter().zip(results) {
            match result {
                Ok(()) => match self.queue.ack(message.id) {
                    Ok(()) => report.acked += 1,
                    Err(e) => {
                        // Visibility lapsed mid-batch; the message is already redelivered
                        warn!(error = %e, "Late acknowledgement");
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    self.handler.on_error(message, &e).await;
                    report.failed += 1;
                }
            }
        }

        debug!(acked = report.acked, failed = report.failed, "Processed batch");
        metrics::counter!("pipeline.consumer.acked", "consumer" => self.name.clone())
            .increment(report.acked as u64);
        metrics::counter!("pipeline.consumer.failed", "consumer" => self.name.clone())
            .increment(report.failed as u64);

        report
    }

    /// Poll until `shutdown` is cancelled, with `concurrency` invocations in parallel
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            consumer = %self.name,
            queue = %self.queue.name(),
            concurrency = self.settings.concurrency,
            batch_size = self.settings.batch_size,
            "Starting consumer"
        );

        let workers = (0..self.settings.concurrency.max(1)).map(|_| self.worker(shutdown.clone()));
        join_all(workers).await;

        info!(consumer = %self.name, "Consumer stopped");
    }

    async fn worker(&self, shutdown: CancellationToken) {
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = self
                    .queue
                    .receive(self.settings.batch_size, self.settings.max_wait) => batch,
            };

            // A received batch is always finished, even during shutdown
            self.process(batch).await;
        }
    }
}
