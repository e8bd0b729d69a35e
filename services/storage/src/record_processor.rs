use crate::metadata_store::{MetadataRecord, MetadataStore, StoreError};
use album_pipeline::consumer::{HandlerError, MessageHandler};
use album_pipeline::event::{EventKind, ImageEvent, Payload, DESCRIPTION, UPDATE_TABLE};
use album_pipeline::queue::QueueMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Whether a record exists for the image name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Absent,
    Present,
}

/// What an event asks the store to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordCommand {
    Create { at: DateTime<Utc> },
    Remove,
    Update {
        at: DateTime<Utc>,
        description: Option<String>,
    },
}

impl RecordCommand {
    /// Derive the command for `event`
    pub fn from_event(event: &ImageEvent) -> Self {
        match event.kind {
            EventKind::Removed => RecordCommand::Remove,
            EventKind::Updated => RecordCommand::Update {
                at: event.occurred_at,
                description: event.attribute(DESCRIPTION).map(str::to_string),
            },
            EventKind::Created if event.comment_type() == Some(UPDATE_TABLE) => {
                RecordCommand::Update {
                    at: event.occurred_at,
                    description: event.attribute(DESCRIPTION).map(str::to_string),
                }
            }
            EventKind::Created => RecordCommand::Create {
                at: event.occurred_at,
            },
        }
    }
}

/// Write chosen by the transition function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Insert {
        created_at: DateTime<Utc>,
        description: Option<String>,
    },
    Delete,
    Touch {
        at: DateTime<Utc>,
        description: Option<String>,
    },
    Noop,
}

/// Handling of an update for an image without a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Acknowledge without writing
    #[default]
    Ignore,
    /// Create the record with the update time as creation time
    InsertPlaceholder,
}

/// The per-key state machine
pub fn transition(
    state: RecordState,
    command: &RecordCommand,
    policy: UpdatePolicy,
) -> (RecordState, StoreOp) {
    use RecordState::{Absent, Present};

    match (state, command) {
        (Present, RecordCommand::Create { .. }) => (Present, StoreOp::Noop),
        (Absent, RecordCommand::Create { at }) => (
            Present,
            StoreOp::Insert {
                created_at: *at,
                description: None,
            },
        ),
        (Present, RecordCommand::Remove) => (Absent, StoreOp::Delete),
        (Absent, RecordCommand::Remove) => (Absent, StoreOp::Noop),
        (Present, RecordCommand::Update { at, description }) => (
            Present,
            StoreOp::Touch {
                at: *at,
                description: description.clone(),
            },
        ),
        (Absent, RecordCommand::Update { at, description }) => match policy {
            UpdatePolicy::Ignore => (Absent, StoreOp::Noop),
            UpdatePolicy::InsertPlaceholder => (
                Present,
                StoreOp::Insert {
                    created_at: *at,
                    description: description.clone(),
                },
            ),
        },
    }
}

/// Lowercase extension of an object key, if any
fn extension(object_key: &str) -> Option<String> {
    let file_name = object_key.rsplit('/').next().unwrap_or(object_key);
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        HandlerError::Transient(e.to_string())
    }
}

/// Applies image events to the metadata store
pub struct RecordProcessor {
    store: Arc<dyn MetadataStore>,
    policy: UpdatePolicy,
    allowed_extensions: Vec<String>,
}

impl RecordProcessor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        policy: UpdatePolicy,
        allowed_extensions: Vec<String>,
    ) -> Self {
        Self {
            store,
            policy,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Reject events that can never succeed
    fn validate(&self, event: &ImageEvent, command: &RecordCommand) -> Result<(), HandlerError> {
        if !event.has_object_key() {
            return Err(HandlerError::Malformed("event has no object key".to_string()));
        }

        if matches!(command, RecordCommand::Remove) {
            return Ok(());
        }

        match extension(&event.object_key) {
            Some(ext) if self.allowed_extensions.contains(&ext) => Ok(()),
            Some(ext) => Err(HandlerError::Malformed(format!(
                "unsupported image type .{ext} for {}",
                event.object_key
            ))),
            None => Err(HandlerError::Malformed(format!(
                "{} has no file extension",
                event.object_key
            ))),
        }
    }

    /// Apply one event
    #[instrument(skip(self, event), fields(object_key = %event.object_key, kind = %event.kind))]
    pub async fn apply(&self, event: &ImageEvent) -> Result<StoreOp, HandlerError> {
        let command = RecordCommand::from_event(event);
        self.validate(event, &command)?;

        let state = match self.store.get(&event.object_key).await? {
            Some(_) => RecordState::Present,
            None => RecordState::Absent,
        };

        let (next, op) = transition(state, &command, self.policy);
        debug!(?state, ?next, ?op, "Record transition");

        match op {
            StoreOp::Insert {
                created_at,
                ref description,
            } => {
                let record = MetadataRecord::new(event.object_key.as_str(), created_at)
                    .with_description(description.clone());
                if self.store.insert_if_absent(&record).await? {
                    info!("Image record created");
                    metrics::counter!("storage.records.inserted").increment(1);
                }
            }
            StoreOp::Delete => {
                if self.store.delete(&event.object_key).await? {
                    info!("Image record deleted");
                    metrics::counter!("storage.records.deleted").increment(1);
                }
            }
            StoreOp::Touch { at, ref description } => {
                if self
                    .store
                    .touch(&event.object_key, at, description.clone())
                    .await?
                {
                    info!("Image record updated");
                    metrics::counter!("storage.records.updated").increment(1);
                }
            }
            StoreOp::Noop => {
                debug!("Nothing to write");
                metrics::counter!("storage.records.noop").increment(1);
            }
        }

        Ok(op)
    }
}

#[async_trait]
impl MessageHandler<Payload> for RecordProcessor {
    async fn handle(&self, message: &QueueMessage<Payload>) -> Result<(), HandlerError> {
        match &message.body {
            Payload::Event(event) => self.apply(event).await.map(|_| ()),
            Payload::Raw(_) => Err(HandlerError::Malformed(
                "message body is not an image event".to_string(),
            )),
        }
    }

    async fn on_error(&self, message: &QueueMessage<Payload>, error: &HandlerError) {
        warn!(
            message_id = %message.id,
            receive_count = message.receive_count,
            malformed = error.is_malformed(),
            error = %error,
            "Record processing failed, message will be redelivered"
        );
        metrics::counter!("storage.records.failed").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::{InMemoryMetadataStore, MockMetadataStore};
    use album_pipeline::event::{COMMENT_TYPE, PROCESS_DELETE};
    use album_pipeline::queue::{QueueBuffer, QueueOptions};
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, hour, 0, 0).unwrap()
    }

    fn processor(store: Arc<dyn MetadataStore>) -> RecordProcessor {
        RecordProcessor::new(
            store,
            UpdatePolicy::Ignore,
            vec!["jpeg".to_string(), "jpg".to_string(), "png".to_string()],
        )
    }

    fn created(key: &str, hour: u32) -> ImageEvent {
        ImageEvent::new(EventKind::Created, key).at(at(hour))
    }

    fn updated(key: &str, hour: u32) -> ImageEvent {
        ImageEvent::new(EventKind::Updated, key)
            .at(at(hour))
            .with_attribute(COMMENT_TYPE, UPDATE_TABLE)
            .with_attribute(DESCRIPTION, "sunset")
    }

    #[test]
    fn test_transition_table() {
        use RecordState::{Absent, Present};

        let create = RecordCommand::Create { at: at(10) };
        let update = RecordCommand::Update {
            at: at(11),
            description: Some("sunset".to_string()),
        };

        for policy in [UpdatePolicy::Ignore, UpdatePolicy::InsertPlaceholder] {
            assert_eq!(transition(Present, &create, policy), (Present, StoreOp::Noop));
            assert_eq!(
                transition(Absent, &create, policy),
                (
                    Present,
                    StoreOp::Insert {
                        created_at: at(10),
                        description: None
                    }
                )
            );
            assert_eq!(
                transition(Present, &RecordCommand::Remove, policy),
                (Absent, StoreOp::Delete)
            );
            assert_eq!(
                transition(Absent, &RecordCommand::Remove, policy),
                (Absent, StoreOp::Noop)
            );
            assert_eq!(
                transition(Present, &update, policy),
                (
                    Present,
                    StoreOp::Touch {
                        at: at(11),
                        description: Some("sunset".to_string())
                    }
                )
            );
        }

        assert_eq!(
            transition(Absent, &update, UpdatePolicy::Ignore),
            (Absent, StoreOp::Noop)
        );
        assert_eq!(
            transition(Absent, &update, UpdatePolicy::InsertPlaceholder),
            (
                Present,
                StoreOp::Insert {
                    created_at: at(11),
                    description: Some("sunset".to_string())
                }
            )
        );
    }

    #[test]
    fn test_command_from_event() {
        assert_eq!(
            RecordCommand::from_event(&created("cat.png", 10)),
            RecordCommand::Create { at: at(10) }
        );

        let removal = ImageEvent::new(EventKind::Removed, "cat.png")
            .with_attribute(COMMENT_TYPE, PROCESS_DELETE);
        assert_eq!(RecordCommand::from_event(&removal), RecordCommand::Remove);

        assert_eq!(
            RecordCommand::from_event(&updated("cat.png", 11)),
            RecordCommand::Update {
                at: at(11),
                description: Some("sunset".to_string())
            }
        );

        let tagged = created("cat.png", 12).with_attribute(COMMENT_TYPE, UPDATE_TABLE);
        assert!(matches!(
            RecordCommand::from_event(&tagged),
            RecordCommand::Update { description: None, .. }
        ));
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("cat.PNG").as_deref(), Some("png"));
        assert_eq!(extension("albums/2024/dog.jpeg").as_deref(), Some("jpeg"));
        assert_eq!(extension("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension("README"), None);
        assert_eq!(extension(".png"), None);
        assert_eq!(extension("dir.v2/file"), None);
    }

    #[tokio::test]
    async fn test_created_twice_keeps_one_record() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let processor = processor(store.clone());

        processor.apply(&created("cat.png", 10)).await.unwrap();
        let second = processor.apply(&created("cat.png", 11)).await.unwrap();

        assert_eq!(second, StoreOp::Noop);
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].created_at, at(10));
    }

    #[tokio::test]
    async fn test_removed_on_absent_key_is_noop() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let processor = processor(store.clone());

        let removal = ImageEvent::new(EventKind::Removed, "cat.png");
        assert_eq!(processor.apply(&removal).await, Ok(StoreOp::Noop));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_flow() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let processor = processor(store.clone());

        // Ignored while absent under the default policy
        assert_eq!(processor.apply(&updated("cat.png", 9)).await, Ok(StoreOp::Noop));
        assert!(store.is_empty());

        processor.apply(&created("cat.png", 10)).await.unwrap();
        processor.apply(&updated("cat.png", 11)).await.unwrap();

        let record = store.get("cat.png").await.unwrap().unwrap();
        assert_eq!(record.created_at, at(10));
        assert_eq!(record.last_modified_at, at(11));
        assert_eq!(record.description.as_deref(), Some("sunset"));
    }

    #[tokio::test]
    async fn test_placeholder_policy_inserts() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let processor = RecordProcessor::new(
            store.clone(),
            UpdatePolicy::InsertPlaceholder,
            vec![".PNG".to_string()],
        );

        processor.apply(&updated("cat.png", 11)).await.unwrap();
        let record = store.get("cat.png").await.unwrap().unwrap();
        assert_eq!(record.created_at, at(11));
        assert_eq!(record.description.as_deref(), Some("sunset"));
    }

    #[tokio::test]
    async fn test_malformed_events() {
        let processor = processor(Arc::new(InMemoryMetadataStore::new()));

        let no_key = ImageEvent::new(EventKind::Created, "  ");
        assert!(processor.apply(&no_key).await.unwrap_err().is_malformed());

        let wrong_type = created("report.pdf", 10);
        assert!(processor.apply(&wrong_type).await.unwrap_err().is_malformed());

        // Removing a non-image object is harmless
        let removal = ImageEvent::new(EventKind::Removed, "report.pdf");
        assert_eq!(processor.apply(&removal).await, Ok(StoreOp::Noop));
    }

    #[tokio::test]
    async fn test_raw_payload_is_malformed() {
        let processor = processor(Arc::new(InMemoryMetadataStore::new()));
        let queue = QueueBuffer::new("img-created-queue", QueueOptions::default());
        queue.enqueue(Payload::Raw(serde_json::json!({"hello": "world"})));
        let batch = queue.receive(1, Duration::ZERO).await;

        let err = processor.handle(&batch[0]).await.unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_store_failure_is_transient() {
        let mut store = MockMetadataStore::new();
        store
            .expect_get()
            .returning(|_| Err(StoreError::Unavailable("connection refused".to_string())));
        store.expect_insert_if_absent().never();

        let processor = processor(Arc::new(store));
        let err = processor.apply(&created("cat.png", 10)).await.unwrap_err();

        assert!(matches!(err, HandlerError::Transient(_)));
    }

    #[tokio::test]
    async fn test_lost_insert_race_is_not_an_error() {
        let mut store = MockMetadataStore::new();
        store.expect_get().returning(|_| Ok(None));
        store
            .expect_insert_if_absent()
            .times(1)
            .returning(|_| Ok(false));

        let processor = processor(Arc::new(store));
        assert!(matches!(
            processor.apply(&created("cat.png", 10)).await,
            Ok(StoreOp::Insert { .. })
        ));
    }
}
