//! In-process queue buffer with visibility timeouts and dead-letter redrive.
//!
//! Delivery is at-least-once. A received message stays hidden for the
//! visibility timeout; if it is not acked in that window (or is nacked) it
//! becomes visible again. Once a message has been received
//! `max_receive_count` times, the next failed delivery moves it to the
//! dead-letter queue instead. This is the only retry mechanism in the
//! pipeline: consumers never loop on a message themselves.

use crate::config::QueueConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier assigned to a message when it is first enqueued
pub type MessageId = Uuid;

/// Errors returned by acknowledgement calls
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Message {id} is not in flight on queue {queue}")]
    NotInFlight { id: MessageId, queue: String },
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct QueueMessage<T> {
    pub id: MessageId,
    pub body: T,
    /// Number of times the message has been received, this delivery included
    pub receive_count: u32,
    /// When the message was first enqueued
    pub sent_at: DateTime<Utc>,
    /// When the message becomes visible again unless acked
    pub visibility_deadline: Instant,
}

/// What happened to a message after a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Visible again on the source queue
    Requeued,
    /// Moved to the dead-letter queue
    DeadLettered,
}

/// Behavioural settings of a queue
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub visibility_timeout: Duration,
    pub retention: Option<Duration>,
    pub max_receive_count: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            visibility_timeout: config.visibility_timeout(),
            retention: config.retention(),
            max_receive_count: config.max_receive_count,
        }
    }
}

/// Point-in-time queue depth
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub visible: usize,
    pub in_flight: usize,
    pub dead_letter_queue: Option<String>,
}

struct Entry<T> {
    seq: u64,
    id: MessageId,
    body: T,
    receive_count: u32,
    sent_at: DateTime<Utc>,
    enqueued_at: Instant,
}

struct InFlight<T> {
    entry: Entry<T>,
    deadline: Instant,
}

struct State<T> {
    visible: VecDeque<Entry<T>>,
    in_flight: HashMap<MessageId, InFlight<T>>,
    next_seq: u64,
}

/// Buffer between a topic subscription and a consumer
pub struct QueueBuffer<T> {
    name: String,
    options: QueueOptions,
    dead_letter: Option<Arc<QueueBuffer<T>>>,
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: Clone + Send + Sync + 'static> QueueBuffer<T> {
    pub fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            name: name.into(),
            options,
            dead_letter: None,
            state: Mutex::new(State {
                visible: VecDeque::new(),
                in_flight: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Redrive messages that exhaust their receive budget into `queue`.
    ///
    /// The dead-letter queue must not itself redrive back into this queue.
    pub fn with_dead_letter(mut self, queue: Arc<QueueBuffer<T>>) -> Self {
        self.dead_letter = Some(queue);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn dead_letter(&self) -> Option<&Arc<QueueBuffer<T>>> {
        self.dead_letter.as_ref()
    }

    /// Append a message and wake one waiting receiver
    pub fn enqueue(&self, body: T) -> MessageId {
        let id = Uuid::new_v4();
        self.push(id, body, Utc::now());

        metrics::counter!("pipeline.queue.enqueued", "queue" => self.name.clone()).increment(1);

        id
    }

    fn push(&self, id: MessageId, body: T, sent_at: DateTime<Utc>) {
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.visible.push_back(Entry {
                seq,
                id,
                body,
                receive_count: 0,
                sent_at,
                enqueued_at: Instant::now(),
            });
        }
        self.notify.notify_one();
    }

    /// Receive up to `max_messages` messages.
    ///
    /// Waits until the batch is full or `max_wait` has elapsed, then returns
    /// whatever was collected, possibly nothing. Every returned message is
    /// hidden until its visibility deadline.
    pub async fn receive(&self, max_messages: usize, max_wait: Duration) -> Vec<QueueMessage<T>> {
        let max_messages = max_messages.max(1);
        let deadline = Instant::now() + max_wait;
        let mut batch = Vec::with_capacity(max_messages);

        loop {
            let now = Instant::now();
            let next_expiry = {
                let mut state = self.state.lock();
                self.reclaim_expired(&mut state, now);
                self.drop_retired(&mut state, now);

                while batch.len() < max_messages {
                    let Some(mut entry) = state.visible.pop_front() else {
                        break;
                    };
                    entry.receive_count += 1;
                    let visibility_deadline = now + self.options.visibility_timeout;

                    batch.push(QueueMessage {
                        id: entry.id,
                        body: entry.body.clone(),
                        receive_count: entry.receive_count,
                        sent_at: entry.sent_at,
                        visibility_deadline,
                    });
                    state.in_flight.insert(
                        entry.id,
                        InFlight {
                            entry,
                            deadline: visibility_deadline,
                        },
                    );
                }

                state.in_flight.values().map(|f| f.deadline).min()
            };

            if batch.len() >= max_messages || now >= deadline {
                break;
            }

            let wake_at = next_expiry.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        if !batch.is_empty() {
            debug!(queue = %self.name, count = batch.len(), "Received batch");
            metrics::counter!("pipeline.queue.received", "queue" => self.name.clone())
                .increment(batch.len() as u64);
        }

        batch
    }

    /// Delete an in-flight message
    pub fn ack(&self, id: MessageId) -> Result<(), QueueError> {
        let removed = self.state.lock().in_flight.remove(&id);

        match removed {
            Some(_) => {
                metrics::counter!("pipeline.queue.acked", "queue" => self.name.clone())
                    .increment(1);
                Ok(())
            }
            None => Err(QueueError::NotInFlight {
                id,
                queue: self.name.clone(),
            }),
        }
    }

    /// Report a failed delivery without waiting for the visibility timeout
    pub fn nack(&self, id: MessageId) -> Result<NackOutcome, QueueError> {
        let mut state = self.state.lock();
        let in_flight = state.in_flight.remove(&id).ok_or_else(|| QueueError::NotInFlight {
            id,
            queue: self.name.clone(),
        })?;

        Ok(self.fail_delivery(&mut state, in_flight.entry))
    }

    /// Messages waiting or in flight
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.visible.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            name: self.name.clone(),
            visible: state.visible.len(),
            in_flight: state.in_flight.len(),
            dead_letter_queue: self.dead_letter.as_ref().map(|q| q.name.clone()),
        }
    }

    /// Treat every in-flight message whose deadline has passed as a failed delivery
    fn reclaim_expired(&self, state: &mut State<T>, now: Instant) {
        let expired: Vec<MessageId> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(in_flight) = state.in_flight.remove(&id) {
                debug!(queue = %self.name, message_id = %id, "Visibility timeout expired");
                self.fail_delivery(state, in_flight.entry);
            }
        }
    }

    fn fail_delivery(&self, state: &mut State<T>, entry: Entry<T>) -> NackOutcome {
        if entry.receive_count >= self.options.max_receive_count {
            if let Some(ref dead_letter) = self.dead_letter {
                warn!(
                    queue = %self.name,
                    dead_letter_queue = %dead_letter.name,
                    message_id = %entry.id,
                    receive_count = entry.receive_count,
                    "Moving message to dead-letter queue"
                );
                // Source lock is held, so the message is never visible on both queues
                dead_letter.push(entry.id, entry.body, entry.sent_at);
                metrics::counter!("pipeline.queue.dead_lettered", "queue" => self.name.clone())
                    .increment(1);
                return NackOutcome::DeadLettered;
            }
        }

        let pos = state.visible.partition_point(|e| e.seq < entry.seq);
        state.visible.insert(pos, entry);
        self.notify.notify_one();

        NackOutcome::Requeued
    }

    fn drop_retired(&self, state: &mut State<T>, now: Instant) {
        let Some(retention) = self.options.retention else {
            return;
        };

        let before = state.visible.len();
        state
            .visible
            .retain(|e| now.duration_since(e.enqueued_at) < retention);
        let dropped = before - state.visible.len();

        if dropped > 0 {
            warn!(queue = %self.name, dropped, "Discarded messages past retention");
            metrics::counter!("pipeline.queue.expired", "queue" => self.name.clone())
                .increment(dropped as u64);
        }
    }
}
