//! Publish/subscribe topic with per-subscription attribute filters.
//!
//! Every published event is offered to each subscription whose filter
//! matches. Deliveries run concurrently and are isolated: one subscriber
//! failing never prevents the others from receiving the event.

use crate::event::{ImageEvent, Payload};
use crate::filter::{matches, FilterPolicy};
use crate::queue::QueueBuffer;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Errors a subscriber may report for a single delivery
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Subscriber {0} is not accepting deliveries")]
    Closed(String),

    #[error("Delivery to {subscriber} failed: {message}")]
    Failed { subscriber: String, message: String },
}

/// Anything that can receive events from a topic
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Deliver one event
    async fn deliver(&self, event: &ImageEvent) -> Result<(), DeliveryError>;
}

#[async_trait]
impl Subscriber for QueueBuffer<Payload> {
    fn name(&self) -> &str {
        QueueBuffer::name(self)
    }

    async fn deliver(&self, event: &ImageEvent) -> Result<(), DeliveryError> {
        self.enqueue(Payload::Event(event.clone()));
        Ok(())
    }
}

/// Function-based subscriber for handlers invoked directly by the topic
pub struct FnSubscriber<F> {
    name: String,
    handler: F,
}

impl<F, Fut> FnSubscriber<F>
where
    F: Fn(ImageEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DeliveryError>> + Send,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Subscriber for FnSubscriber<F>
where
    F: Fn(ImageEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DeliveryError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &ImageEvent) -> Result<(), DeliveryError> {
        (self.handler)(event.clone()).await
    }
}

/// Handle returned by [`TopicRouter::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

struct Subscription {
    id: u64,
    subscriber: Arc<dyn Subscriber>,
    filter: Option<FilterPolicy>,
}

impl Subscription {
    fn accepts(&self, event: &ImageEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| matches(event, f))
    }
}

/// Outcome of a single publish call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscriptions whose filter matched
    pub matched: usize,
    /// Names of subscribers that accepted the event
    pub delivered: Vec<String>,
    /// Names of subscribers that failed
    pub failed: Vec<String>,
}

/// A named topic fanning events out to its subscriptions
pub struct TopicRouter {
    name: String,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl TopicRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `subscriber`; without a filter it receives every event
    pub fn subscribe(
        &self,
        subscriber: Arc<dyn Subscriber>,
        filter: Option<FilterPolicy>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        debug!(
            topic = %self.name,
            subscriber = %subscriber.name(),
            filtered = filter.is_some(),
            "Adding subscription"
        );

        self.subscriptions.write().push(Arc::new(Subscription {
            id,
            subscriber,
            filter,
        }));

        SubscriptionHandle {
            id,
            topic: self.name.clone(),
        }
    }

    /// Remove a subscription; returns false if it was already gone
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        if handle.topic != self.name {
            return false;
        }

        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != handle.id);
        subscriptions.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Offer `event` to every matching subscription
    #[instrument(skip(self, event), fields(topic = %self.name, object_key = %event.object_key, kind = %event.kind))]
    pub async fn publish(&self, event: &ImageEvent) -> PublishReport {
        // Snapshot so no lock is held across deliveries
        let targets: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.accepts(event))
            .cloned()
            .collect();

        let deliveries = targets.iter().map(|subscription| async move {
            let result = subscription.subscriber.deliver(event).await;
            (subscription.subscriber.name().to_string(), result)
        });

        let mut report = PublishReport {
            matched: targets.len(),
            ..Default::default()
        };

        for (subscriber, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered.push(subscriber),
                Err(e) => {
                    warn!(topic = %self.name, subscriber = %subscriber, error = %e, "Delivery failed");
                    metrics::counter!("pipeline.topic.delivery_failed", "topic" => self.name.clone())
                        .increment(1);
                    report.failed.push(subscriber);
                }
            }
        }

        debug!(
            matched = report.matched,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Published event"
        );
        metrics::counter!("pipeline.topic.published", "topic" => self.name.clone()).increment(1);

        report
    }
}
