//! Album Storage Service
//!
//! Keeps image metadata in step with the photo album bucket and emails the
//! album owner about every change. Storage notifications arrive over HTTP or
//! Kafka, fan out through the image topic to filtered queues, and are applied
//! to the metadata store by idempotent processors. Committed store changes
//! are streamed to a notifier; messages that keep failing are quarantined
//! and reported as rejected.
//!
//! ## Architecture
//!
//! ```text
//! HTTP / Kafka            image-topic               queues                 processors
//! ┌──────────────┐       ┌──────────────┐       ┌──────────────┐       ┌──────────────┐
//! │ Storage      │──────▶│ Filtered     │──────▶│ created      │──────▶│ Record       │
//! │ Notification │       │ Fan-out      │       │ deleted      │       │ Processor    │
//! └──────────────┘       └──────────────┘       │ updated      │       └──────────────┘
//!                               │               └──────────────┘              │
//!                               │                      │ redrive              ▼
//!                               ▼                      ▼              ┌──────────────┐
//!                        ┌──────────────┐       ┌──────────────┐       │ Metadata     │
//!                        │ Upload       │       │ Quarantine   │       │ Store        │
//!                        │ Mailer       │       │ Processor    │       └──────────────┘
//!                        └──────────────┘       └──────────────┘              │ changes
//!                               │                      │                      ▼
//!                               │                      │              ┌──────────────┐
//!                               └──────────────────────┴─────────────▶│ Notification │
//!                                                                     │ Dispatcher   │
//!                                                                     └──────────────┘
//! ```

pub mod change_feed;
pub mod change_stream;
pub mod config;
pub mod ingress;
pub mod mailer;
pub mod metadata_store;
pub mod quarantine;
pub mod record_processor;
pub mod topology;

pub use change_feed::NotificationFeed;
pub use change_stream::{ChangeEventName, ChangeStreamNotifier, ChangeStreamRecord, PgChangeListener};
pub use config::Config;
pub use ingress::{create_router, start_api_server, AppState};
pub use mailer::UploadMailer;
pub use metadata_store::{
    InMemoryMetadataStore, MetadataRecord, MetadataStore, PgMetadataStore, StoreError,
};
pub use quarantine::QuarantineProcessor;
pub use record_processor::{RecordCommand, RecordProcessor, RecordState, StoreOp, UpdatePolicy};
pub use topology::{Pipeline, Topology};
