use crate::change_stream::{ChangeStreamNotifier, ChangeStreamRecord};
use crate::config::{QueuesConfig, RecordsConfig};
use crate::mailer::UploadMailer;
use crate::metadata_store::MetadataStore;
use crate::quarantine::QuarantineProcessor;
use crate::record_processor::RecordProcessor;
use album_pipeline::config::QueueConfig;
use album_pipeline::consumer::{BatchConsumer, ConsumerSettings, MessageHandler};
use album_pipeline::event::{Payload, COMMENT_TYPE, EVENT_NAME, PROCESS_DELETE, UPDATE_TABLE};
use album_pipeline::filter::FilterPolicy;
use album_pipeline::notify::{NotificationDispatcher, NotificationTemplates};
use album_pipeline::producer::{EventPublisher, PublishError};
use album_pipeline::queue::{QueueBuffer, QueueOptions, QueueStats};
use album_pipeline::topic::TopicRouter;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const IMAGE_TOPIC: &str = "image-topic";
pub const RECORD_QUEUE: &str = "img-created-queue";
pub const DELETE_QUEUE: &str = "img-deleted-queue";
pub const UPDATE_QUEUE: &str = "img-updated-queue";
pub const MAIL_QUEUE: &str = "mailer-queue";
pub const QUARANTINE_QUEUE: &str = "bad-images-queue";
pub const CHANGE_QUEUE: &str = "image-changes";

/// The topic and every queue, subscribed and redriven
pub struct Topology {
    pub topic: Arc<TopicRouter>,
    pub record: Arc<QueueBuffer<Payload>>,
    pub delete: Arc<QueueBuffer<Payload>>,
    pub update: Arc<QueueBuffer<Payload>>,
    pub mail: Arc<QueueBuffer<Payload>>,
    pub quarantine: Arc<QueueBuffer<Payload>>,
    pub changes: Arc<QueueBuffer<ChangeStreamRecord>>,
}

impl Topology {
    pub fn build(queues: &QueuesConfig) -> Self {
        let quarantine = Arc::new(QueueBuffer::new(
            QUARANTINE_QUEUE,
            QueueOptions::from(&queues.quarantine),
        ));

        let redriven = |name: &str, config: &QueueConfig| {
            Arc::new(
                QueueBuffer::new(name, QueueOptions::from(config))
                    .with_dead_letter(quarantine.clone()),
            )
        };

        let record = redriven(RECORD_QUEUE, &queues.record);
        let delete = redriven(DELETE_QUEUE, &queues.delete);
        let update = redriven(UPDATE_QUEUE, &queues.update);
        let mail = Arc::new(QueueBuffer::new(MAIL_QUEUE, QueueOptions::from(&queues.mail)));
        let changes = Arc::new(QueueBuffer::new(
            CHANGE_QUEUE,
            QueueOptions::from(&queues.change_stream),
        ));

        let topic = Arc::new(TopicRouter::new(IMAGE_TOPIC));
        topic.subscribe(
            record.clone(),
            Some(FilterPolicy::new().prefix(EVENT_NAME, "ObjectCreated")),
        );
        topic.subscribe(
            delete.clone(),
            Some(FilterPolicy::new().allowlist(COMMENT_TYPE, [PROCESS_DELETE])),
        );
        topic.subscribe(
            update.clone(),
            Some(FilterPolicy::new().allowlist(COMMENT_TYPE, [UPDATE_TABLE])),
        );
        topic.subscribe(mail.clone(), None);

        Self {
            topic,
            record,
            delete,
            update,
            mail,
            quarantine,
            changes,
        }
    }

    fn event_queues(&self) -> [&Arc<QueueBuffer<Payload>>; 5] {
        [
            &self.record,
            &self.delete,
            &self.update,
            &self.mail,
            &self.quarantine,
        ]
    }

    /// Look up an event queue by name
    pub fn event_queue(&self, name: &str) -> Option<&Arc<QueueBuffer<Payload>>> {
        self.event_queues().into_iter().find(|q| q.name() == name)
    }

    /// Depth of every queue
    pub fn stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<_> = self.event_queues().iter().map(|q| q.stats()).collect();
        stats.push(self.changes.stats());
        stats
    }
}

/// The running pipeline: topology plus the handlers consuming it
pub struct Pipeline {
    pub topology: Arc<Topology>,
    pub publisher: Arc<EventPublisher>,
    pub store: Arc<dyn MetadataStore>,
    records: Arc<RecordProcessor>,
    quarantine: Arc<QuarantineProcessor>,
    mailer: Arc<UploadMailer>,
    notifier: Arc<ChangeStreamNotifier>,
    queues: QueuesConfig,
}

impl Pipeline {
    pub fn new(
        topology: Arc<Topology>,
        store: Arc<dyn MetadataStore>,
        dispatcher: Arc<NotificationDispatcher>,
        templates: NotificationTemplates,
        queues: &QueuesConfig,
        records: &RecordsConfig,
    ) -> Result<Self, PublishError> {
        let publisher = Arc::new(EventPublisher::new(vec![topology.topic.clone()])?);

        Ok(Self {
            publisher,
            store: store.clone(),
            records: Arc::new(RecordProcessor::new(
                store,
                records.update_policy,
                records.allowed_extensions.clone(),
            )),
            quarantine: Arc::new(QuarantineProcessor::new(
                dispatcher.clone(),
                templates.clone(),
            )),
            mailer: Arc::new(UploadMailer::new(dispatcher.clone(), templates.clone())),
            notifier: Arc::new(ChangeStreamNotifier::new(dispatcher, templates)),
            topology,
            queues: queues.clone(),
        })
    }

    /// Start one consumer per queue; each stops when `shutdown` is cancelled
    pub fn spawn(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let topology = &self.topology;

        let handles = vec![
            spawn_consumer(
                "record-processor",
                &topology.record,
                &self.records,
                &self.queues.record,
                shutdown,
            ),
            spawn_consumer(
                "delete-processor",
                &topology.delete,
                &self.records,
                &self.queues.delete,
                shutdown,
            ),
            spawn_consumer(
                "update-processor",
                &topology.update,
                &self.records,
                &self.queues.update,
                shutdown,
            ),
            spawn_consumer(
                "upload-mailer",
                &topology.mail,
                &self.mailer,
                &self.queues.mail,
                shutdown,
            ),
            spawn_consumer(
                "quarantine-processor",
                &topology.quarantine,
                &self.quarantine,
                &self.queues.quarantine,
                shutdown,
            ),
            spawn_consumer(
                "change-notifier",
                &topology.changes,
                &self.notifier,
                &self.queues.change_stream,
                shutdown,
            ),
        ];

        info!(consumers = handles.len(), "Pipeline consumers started");

        handles
    }
}

fn spawn_consumer<T, H>(
    name: &str,
    queue: &Arc<QueueBuffer<T>>,
    handler: &Arc<H>,
    config: &QueueConfig,
    shutdown: &CancellationToken,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    H: MessageHandler<T> + 'static,
{
    let consumer = BatchConsumer::new(
        name,
        queue.clone(),
        handler.clone(),
        ConsumerSettings::from(config),
    );
    let shutdown = shutdown.clone();

    tokio::spawn(async move { consumer.run(shutdown).await })
}
