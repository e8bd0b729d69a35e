//! Album Pipeline - event routing for the photo album
//!
//! This library provides the building blocks of the image notification
//! pipeline:
//!
//! - Topics fanning image events out to filtered subscriptions
//! - Queue buffers with visibility timeouts and dead-letter redrive
//! - Batch consumers driving handlers off those queues
//! - Translation of storage change notifications into image events
//! - Templated email notifications
//!
//! # Example
//!
//! ```rust,no_run
//! use album_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let topic = Arc::new(TopicRouter::new("image-topic"));
//!
//!     // Queue receiving only removals
//!     let deletes = Arc::new(QueueBuffer::<Payload>::new("img-deleted-queue", QueueOptions::default()));
//!     topic.subscribe(
//!         deletes.clone(),
//!         Some(FilterPolicy::new().allowlist(COMMENT_TYPE, [PROCESS_DELETE])),
//!     );
//!
//!     let publisher = EventPublisher::new(vec![topic])?;
//!     publisher.publish_raw(br#"{"Records": []}"#).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod event;
pub mod filter;
pub mod notify;
pub mod producer;
pub mod queue;
pub mod topic;

// Re-export main types
pub use config::{ConfigError, MailConfig, MailTransportKind, QueueConfig};
pub use consumer::{
    BatchConsumer, BatchReport, ConsumerSettings, FnHandler, HandlerError, MessageHandler,
};
pub use event::{EventKind, ImageEvent, Payload};
pub use filter::{matches, FilterPolicy, Predicate};
pub use notify::{
    DispatchError, EmailMessage, EmailTransport, LogTransport, NotificationDispatcher,
    NotificationPayload, NotificationTemplates, SesTransport,
};
pub use producer::{EventPublisher, PublishError, PublishSummary, StorageNotification};
pub use queue::{MessageId, NackOutcome, QueueBuffer, QueueError, QueueMessage, QueueOptions, QueueStats};
pub use topic::{DeliveryError, PublishReport, Subscriber, SubscriptionHandle, TopicRouter};

/// Async trait for handlers and transports (re-export for convenience)
pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::consumer::{BatchConsumer, ConsumerSettings, HandlerError, MessageHandler};
    pub use crate::event::{
        EventKind, ImageEvent, Payload, COMMENT_TYPE, PROCESS_DELETE, UPDATE_TABLE,
    };
    pub use crate::filter::FilterPolicy;
    pub use crate::notify::{NotificationDispatcher, NotificationTemplates};
    pub use crate::producer::EventPublisher;
    pub use crate::queue::{QueueBuffer, QueueMessage, QueueOptions};
    pub use crate::topic::TopicRouter;
    pub use async_trait::async_trait;
}
