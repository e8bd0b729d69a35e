//! Event publisher adapter.
//!
//! Converts storage change notifications (`{"Records": [...]}` as emitted by
//! S3-compatible object stores) into [`ImageEvent`]s and publishes them to
//! every configured topic. Only `ObjectCreated:*` and `ObjectRemoved:*`
//! records are translated; anything else is counted and skipped.

use crate::event::{EventKind, ImageEvent, BUCKET, COMMENT_TYPE, EVENT_NAME, PROCESS_DELETE};
use crate::topic::{PublishReport, TopicRouter};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while publishing
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to decode storage notification: {0}")]
    DecodeError(String),

    #[error("No topics configured for publishing")]
    NoTopics,
}

/// Storage change notification envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<StorageRecord>,
}

impl StorageNotification {
    /// Decode a notification from raw bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PublishError> {
        serde_json::from_slice(bytes).map_err(|e| PublishError::DecodeError(e.to_string()))
    }
}

/// A single object change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageRecord {
    pub event_name: String,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    pub s3: StorageEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageEntity {
    pub bucket: StorageBucket,
    pub object: StorageObject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageBucket {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageObject {
    /// URL-encoded object key
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Decode an object key as it appears in notifications (`+` is a space)
pub fn decode_object_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            warn!(key = %raw, error = %e, "Object key is not valid UTF-8 after decoding");
            spaced
        }
    }
}

/// Translate a storage record into an image event, if it is one we handle
pub fn to_image_event(record: &StorageRecord) -> Option<ImageEvent> {
    let kind = if record.event_name.starts_with("ObjectCreated:") {
        EventKind::Created
    } else if record.event_name.starts_with("ObjectRemoved:") {
        EventKind::Removed
    } else {
        return None;
    };

    let mut event = ImageEvent::new(kind, decode_object_key(&record.s3.object.key))
        .with_attribute(EVENT_NAME, record.event_name.as_str())
        .with_attribute(BUCKET, record.s3.bucket.name.as_str());

    if let Some(at) = record.event_time {
        event = event.at(at);
    }

    if kind == EventKind::Removed {
        event = event.with_attribute(COMMENT_TYPE, PROCESS_DELETE);
    }

    Some(event)
}

/// Totals for one notification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishSummary {
    /// Records translated and published
    pub published: usize,
    /// Records with an event name we do not handle
    pub ignored: usize,
    /// Successful subscription deliveries across all topics
    pub deliveries: usize,
    /// Failed subscription deliveries across all topics
    pub failed_deliveries: usize,
}

impl PublishSummary {
    fn absorb(&mut self, reports: &[PublishReport]) {
        for report in reports {
            self.deliveries += report.delivered.len();
            self.failed_deliveries += report.failed.len();
        }
    }
}

/// Publishes image events to a fixed set of topics
pub struct EventPublisher {
    topics: Vec<Arc<TopicRouter>>,
}

impl EventPublisher {
    pub fn new(topics: Vec<Arc<TopicRouter>>) -> Result<Self, PublishError> {
        if topics.is_empty() {
            return Err(PublishError::NoTopics);
        }

        info!(
            topics = ?topics.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "Creating event publisher"
        );

        Ok(Self { topics })
    }

    /// Publish one event to every topic
    #[instrument(skip(self, event), fields(object_key = %event.object_key, kind = %event.kind))]
    pub async fn publish(&self, event: &ImageEvent) -> Vec<PublishReport> {
        let reports = join_all(self.topics.iter().map(|topic| topic.publish(event))).await;

        metrics::counter!("pipeline.publisher.events", "kind" => event.kind.as_str())
            .increment(1);

        reports
    }

    /// Translate and publish every record of a notification
    pub async fn publish_notification(&self, notification: &StorageNotification) -> PublishSummary {
        let mut summary = PublishSummary::default();

        for record in &notification.records {
            match to_image_event(record) {
                Some(event) => {
                    let reports = self.publish(&event).await;
                    summary.absorb(&reports);
                    summary.published += 1;
                }
                None => {
                    debug!(event_name = %record.event_name, "Ignoring storage record");
                    metrics::counter!("pipeline.publisher.ignored").increment(1);
                    summary.ignored += 1;
                }
            }
        }

        summary
    }

    /// Decode raw notification bytes and publish them
    pub async fn publish_raw(&self, bytes: &[u8]) -> Result<PublishSummary, PublishError> {
        let notification = StorageNotification::from_slice(bytes)?;
        Ok(self.publish_notification(&notification).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::filter::FilterPolicy;
    use crate::queue::{QueueBuffer, QueueOptions};
    use std::time::Duration;

    const NOTIFICATION: &str = r#"{
        "Records": [
            {
                "eventName": "ObjectCreated:Put",
                "eventTime": "2024-01-15T10:30:00.000Z",
                "s3": {"bucket": {"name": "photo-album"}, "object": {"key": "summer+trip/cat%281%29.png", "size": 1024}}
            },
            {
                "eventName": "ObjectRemoved:Delete",
                "s3": {"bucket": {"name": "photo-album"}, "object": {"key": "dog.jpg"}}
            },
            {
                "eventName": "ObjectRestore:Completed",
                "s3": {"bucket": {"name": "photo-album"}, "object": {"key": "old.png"}}
            }
        ]
    }"#;

    #[test]
    fn test_decode_object_key() {
        assert_eq!(decode_object_key("my+holiday%2Fcat.png"), "my holiday/cat.png");
        assert_eq!(decode_object_key("plain.jpg"), "plain.jpg");
        assert_eq!(decode_object_key("a%2Bb.png"), "a+b.png");
    }

    #[test]
    fn test_translation() {
        let notification: StorageNotification = serde_json::from_str(NOTIFICATION).unwrap();

        let created = to_image_event(&notification.records[0]).unwrap();
        assert_eq!(created.kind, EventKind::Created);
        assert_eq!(created.object_key, "summer trip/cat(1).png");
        assert_eq!(created.attribute(EVENT_NAME), Some("ObjectCreated:Put"));
        assert_eq!(created.attribute(BUCKET), Some("photo-album"));
        assert_eq!(created.comment_type(), None);
        assert_eq!(created.occurred_at.to_rfc3339(), "2024-01-15T10:30:00+00:00");

        let removed = to_image_event(&notification.records[1]).unwrap();
        assert_eq!(removed.kind, EventKind::Removed);
        assert_eq!(removed.comment_type(), Some(PROCESS_DELETE));

        assert!(to_image_event(&notification.records[2]).is_none());
    }

    #[test]
    fn test_publisher_requires_topics() {
        assert!(matches!(
            EventPublisher::new(Vec::new()),
            Err(PublishError::NoTopics)
        ));
    }

    #[tokio::test]
    async fn test_publish_notification() {
        let topic = Arc::new(TopicRouter::new("image-topic"));
        let everything: Arc<QueueBuffer<Payload>> =
            Arc::new(QueueBuffer::new("mailer", QueueOptions::default()));
        let deletes: Arc<QueueBuffer<Payload>> =
            Arc::new(QueueBuffer::new("deletes", QueueOptions::default()));
        topic.subscribe(everything.clone(), None);
        topic.subscribe(
            deletes.clone(),
            Some(FilterPolicy::new().allowlist(COMMENT_TYPE, [PROCESS_DELETE])),
        );

        let publisher = EventPublisher::new(vec![topic]).unwrap();
        let summary = publisher.publish_raw(NOTIFICATION.as_bytes()).await.unwrap();

        assert_eq!(
            summary,
            PublishSummary {
                published: 2,
                ignored: 1,
                deliveries: 3,
                failed_deliveries: 0
            }
        );
        assert_eq!(everything.len(), 2);

        let removal = deletes.receive(5, Duration::ZERO).await;
        assert_eq!(removal.len(), 1);
        assert_eq!(removal[0].body.event().unwrap().object_key, "dog.jpg");
    }

    #[tokio::test]
    async fn test_undecodable_notification() {
        let publisher = EventPublisher::new(vec![Arc::new(TopicRouter::new("t"))]).unwrap();
        assert!(matches!(
            publisher.publish_raw(b"{not json").await,
            Err(PublishError::DecodeError(_))
        ));
    }
}
