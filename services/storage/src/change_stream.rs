use album_pipeline::consumer::{HandlerError, MessageHandler};
use album_pipeline::notify::{NotificationDispatcher, NotificationTemplates};
use album_pipeline::queue::{QueueBuffer, QueueMessage};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool};
use sqlx::FromRow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Channel the `images` trigger notifies on
pub const CHANGE_CHANNEL: &str = "image_changes";

/// Kind of committed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventName {
    Insert,
    Remove,
    Modify,
}

impl ChangeEventName {
    /// Parse the lowercase name written by the `images` trigger
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "insert" => Some(ChangeEventName::Insert),
            "remove" => Some(ChangeEventName::Remove),
            "modify" => Some(ChangeEventName::Modify),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeEventName::Insert => "INSERT",
            ChangeEventName::Remove => "REMOVE",
            ChangeEventName::Modify => "MODIFY",
        })
    }
}

/// One committed transition of the metadata store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStreamRecord {
    pub event_name: ChangeEventName,
    pub image_name: String,
    pub timestamp: DateTime<Utc>,
    /// Store-wide commit sequence
    pub sequence: u64,
}

/// Sends one notification per change record.
///
/// Records sharing an image name are handled in stream order; different
/// image names are handled concurrently. Dispatch failures are logged and
/// the record is still acknowledged.
pub struct ChangeStreamNotifier {
    dispatcher: Arc<NotificationDispatcher>,
    templates: NotificationTemplates,
}

impl ChangeStreamNotifier {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, templates: NotificationTemplates) -> Self {
        Self {
            dispatcher,
            templates,
        }
    }

    #[instrument(skip(self, record), fields(image_name = %record.image_name, event_name = %record.event_name, sequence = record.sequence))]
    async fn notify(&self, record: &ChangeStreamRecord) {
        let payload = match record.event_name {
            ChangeEventName::Insert => self.templates.image_added(&record.image_name),
            ChangeEventName::Remove => self.templates.image_deleted(&record.image_name),
            ChangeEventName::Modify => self.templates.image_updated(&record.image_name),
        };

        match self.dispatcher.send(&payload).await {
            Ok(message_id) => {
                info!(message_id = %message_id, subject = %payload.subject_title, "Change notification sent");
            }
            Err(e) => {
                error!(error = %e, "Failed to send change notification");
                metrics::counter!("storage.change_notifications.failed").increment(1);
            }
        }
    }
}

#[async_trait]
impl MessageHandler<ChangeStreamRecord> for ChangeStreamNotifier {
    async fn handle(&self, message: &QueueMessage<ChangeStreamRecord>) -> Result<(), HandlerError> {
        self.notify(&message.body).await;
        Ok(())
    }

    async fn handle_batch(
        &self,
        batch: &[QueueMessage<ChangeStreamRecord>],
    ) -> Vec<Result<(), HandlerError>> {
        // Group by image name, keeping first-seen order of names and stream order within
        let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
        for (index, message) in batch.iter().enumerate() {
            let name = message.body.image_name.as_str();
            match groups.iter_mut().find(|(key, _)| *key == name) {
                Some((_, indices)) => indices.push(index),
                None => groups.push((name, vec![index])),
            }
        }

        debug!(records = batch.len(), keys = groups.len(), "Processing change batch");

        join_all(groups.iter().map(|(_, indices)| async move {
            for &index in indices {
                self.notify(&batch[index].body).await;
            }
        }))
        .await;

        batch.iter().map(|_| Ok(())).collect()
    }
}

/// Row of the `image_changes` log
#[derive(Debug, Clone, FromRow)]
struct ChangeRow {
    sequence: i64,
    event_name: String,
    image_name: String,
    changed_at: DateTime<Utc>,
}

impl ChangeRow {
    fn into_record(self) -> Option<ChangeStreamRecord> {
        Some(ChangeStreamRecord {
            event_name: ChangeEventName::parse(&self.event_name)?,
            image_name: self.image_name,
            timestamp: self.changed_at,
            sequence: u64::try_from(self.sequence).ok()?,
        })
    }
}

/// Tracks which change sequences have reached the change queue
#[derive(Debug, Default)]
struct SequenceCursor {
    last_seen: Option<u64>,
    /// Sequences replayed from the log since the last reconnect
    replayed: HashSet<u64>,
}

impl SequenceCursor {
    fn observe(&mut self, sequence: u64) {
        self.last_seen = Some(self.last_seen.map_or(sequence, |last| last.max(sequence)));
    }

    fn begin_replay(&mut self) {
        self.replayed.clear();
    }

    fn replay(&mut self, sequence: u64) {
        self.replayed.insert(sequence);
        self.observe(sequence);
    }

    /// False when a replay already enqueued this notification
    fn accept_live(&mut self, sequence: u64) -> bool {
        if self.replayed.remove(&sequence) {
            return false;
        }
        self.observe(sequence);
        true
    }
}

/// Feeds PostgreSQL change notifications into the change queue.
///
/// Every change is also written to the `image_changes` log. After each
/// (re)connect the listener replays the log past the last sequence it saw,
/// so changes committed while it was disconnected still reach the queue.
pub struct PgChangeListener {
    pool: PgPool,
    queue: Arc<QueueBuffer<ChangeStreamRecord>>,
}

impl PgChangeListener {
    pub fn new(pool: PgPool, queue: Arc<QueueBuffer<ChangeStreamRecord>>) -> Self {
        Self { pool, queue }
    }

    async fn connect(&self, cursor: &mut SequenceCursor) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        // Listening first means nothing committed after the replay query is missed
        self.backfill(cursor).await?;

        Ok(listener)
    }

    #[instrument(skip(self, cursor), fields(last_seen = ?cursor.last_seen))]
    async fn backfill(&self, cursor: &mut SequenceCursor) -> Result<(), sqlx::Error> {
        let Some(last_seen) = cursor.last_seen else {
            // First connect: start from the current end of the log
            let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence) FROM image_changes")
                .fetch_one(&self.pool)
                .await?;
            cursor.observe(latest.and_then(|s| u64::try_from(s).ok()).unwrap_or(0));
            return Ok(());
        };

        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT sequence, event_name, image_name, changed_at
            FROM image_changes
            WHERE sequence > $1
            ORDER BY sequence
            "#,
        )
        .bind(i64::try_from(last_seen).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        cursor.begin_replay();
        let mut replayed = 0usize;
        for row in rows {
            match row.clone().into_record() {
                Some(record) => {
                    cursor.replay(record.sequence);
                    self.queue.enqueue(record);
                    replayed += 1;
                }
                None => {
                    warn!(sequence = row.sequence, event_name = %row.event_name, "Skipping unreadable change log row");
                }
            }
        }

        if replayed > 0 {
            info!(replayed, "Replayed changes missed while disconnected");
            metrics::counter!("storage.change_stream.replayed").increment(replayed as u64);
        }

        Ok(())
    }

    /// Listen until `shutdown` is cancelled, reconnecting with backoff
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut cursor = SequenceCursor::default();

        'connect: loop {
            let mut listener = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connect(&mut cursor) => match result {
                    Ok(listener) => {
                        info!(channel = CHANGE_CHANNEL, "Listening for metadata changes");
                        backoff.reset();
                        listener
                    }
                    Err(e) => {
                        let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                        error!(error = %e, delay_ms = delay.as_millis() as u64, "Change listener connection failed");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                },
            };

            loop {
                let notification = tokio::select! {
                    _ = shutdown.cancelled() => break 'connect,
                    notification = listener.recv() => notification,
                };

                match notification {
                    Ok(notification) => {
                        match serde_json::from_str::<ChangeStreamRecord>(notification.payload()) {
                            Ok(record) => {
                                if cursor.accept_live(record.sequence) {
                                    debug!(image_name = %record.image_name, sequence = record.sequence, "Change received");
                                    self.queue.enqueue(record);
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, payload = %notification.payload(), "Undecodable change notification");
                                metrics::counter!("storage.change_stream.decode_errors").increment(1);
                            }
                        }
                    }
                    Err(e) => {
                        // Missed changes are replayed from the log on reconnect
                        error!(error = %e, "Change listener lost its connection");
                        metrics::counter!("storage.change_stream.disconnects").increment(1);
                        continue 'connect;
                    }
                }
            }
        }

        info!("Change listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use album_pipeline::notify::{DispatchError, EmailMessage, EmailTransport, LogTransport};
    use crate::config::QueuesConfig;
    use album_pipeline::consumer::{BatchConsumer, ConsumerSettings};
    use album_pipeline::queue::QueueOptions;
    use parking_lot::Mutex;

    fn record(event_name: ChangeEventName, image_name: &str, sequence: u64) -> ChangeStreamRecord {
        ChangeStreamRecord {
            event_name,
            image_name: image_name.to_string(),
            timestamp: Utc::now(),
            sequence,
        }
    }

    fn templates() -> NotificationTemplates {
        NotificationTemplates::new("album@example.com", "owner@example.com")
    }

    async fn received(records: Vec<ChangeStreamRecord>) -> Vec<QueueMessage<ChangeStreamRecord>> {
        let queue = QueueBuffer::new("image-changes", QueueOptions::default());
        let count = records.len();
        for record in records {
            queue.enqueue(record);
        }
        queue.receive(count, Duration::ZERO).await
    }

    #[test]
    fn test_deserialize_trigger_payload() {
        let payload = r#"{"eventName" : "modify", "imageName" : "cat.png", "timestamp" : "2024-01-15T10:30:00.123456+00:00", "sequence" : 42}"#;

        let record: ChangeStreamRecord = serde_json::from_str(payload).unwrap();
        assert_eq!(record.event_name, ChangeEventName::Modify);
        assert_eq!(record.image_name, "cat.png");
        assert_eq!(record.sequence, 42);
    }

    #[tokio::test]
    async fn test_subject_per_event_name() {
        let transport = Arc::new(LogTransport::new());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            transport.clone(),
            "The Photo Album",
            Duration::from_secs(3),
        ));
        let notifier = ChangeStreamNotifier::new(dispatcher, templates());

        let batch = received(vec![
            record(ChangeEventName::Insert, "cat.png", 1),
            record(ChangeEventName::Modify, "dog.png", 2),
            record(ChangeEventName::Remove, "bird.png", 3),
        ])
        .await;

        let results = notifier.handle_batch(&batch).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let mut subjects: Vec<_> = transport
            .sent()
            .into_iter()
            .map(|m| (m.subject, m.html_body.contains("cat.png")))
            .collect();
        subjects.sort();
        assert_eq!(
            subjects,
            vec![
                ("Image Added".to_string(), true),
                ("Image Deleted".to_string(), false),
                ("Image Updated".to_string(), false),
            ]
        );
    }

    /// Records subjects in send order; slow for the first send of each image
    struct Recording {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EmailTransport for Recording {
        async fn send(&self, message: EmailMessage) -> Result<String, DispatchError> {
            if message.subject == "Image Added" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.sent
                .lock()
                .push(format!("{}:{}", message.subject, message.html_body.contains("cat.png")));
            Ok("id".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_keeps_stream_order() {
        let transport = Arc::new(Recording {
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = Arc::new(NotificationDispatcher::new(
            transport.clone(),
            "The Photo Album",
            Duration::from_secs(3),
        ));
        let notifier = ChangeStreamNotifier::new(dispatcher, templates());

        let batch = received(vec![
            record(ChangeEventName::Insert, "cat.png", 1),
            record(ChangeEventName::Remove, "cat.png", 2),
        ])
        .await;
        notifier.handle_batch(&batch).await;

        // Insert is slow, yet Remove for the same key is sent after it
        assert_eq!(
            *transport.sent.lock(),
            vec!["Image Added:true".to_string(), "Image Deleted:true".to_string()]
        );
    }

    /// Every send takes two seconds
    struct Slow {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EmailTransport for Slow {
        async fn send(&self, message: EmailMessage) -> Result<String, DispatchError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.sent.lock().push(message.subject);
            Ok("id".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sends_for_one_image_finish_within_invocation() {
        let transport = Arc::new(Slow {
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = Arc::new(NotificationDispatcher::new(
            transport.clone(),
            "The Photo Album",
            Duration::from_secs(3),
        ));
        let notifier = Arc::new(ChangeStreamNotifier::new(dispatcher, templates()));

        let queue = Arc::new(QueueBuffer::new(
            "image-changes",
            QueueOptions::from(&QueuesConfig::default().change_stream),
        ));
        queue.enqueue(record(ChangeEventName::Insert, "cat.png", 1));
        queue.enqueue(record(ChangeEventName::Modify, "cat.png", 2));

        let consumer = BatchConsumer::new(
            "change-notifier",
            queue.clone(),
            notifier,
            ConsumerSettings::from(&QueuesConfig::default().change_stream),
        );

        let report = consumer.run_once().await;
        assert!(!report.timed_out);
        assert_eq!(report.acked, 2);
        assert!(queue.is_empty());

        // Nothing comes back once the visibility timeout has passed
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(consumer.run_once().await.received, 0);

        assert_eq!(
            *transport.sent.lock(),
            vec!["Image Added".to_string(), "Image Updated".to_string()]
        );
    }

    #[test]
    fn test_change_log_row() {
        let row = ChangeRow {
            sequence: 7,
            event_name: "remove".to_string(),
            image_name: "cat.png".to_string(),
            changed_at: Utc::now(),
        };
        let record = row.clone().into_record().unwrap();
        assert_eq!(record.event_name, ChangeEventName::Remove);
        assert_eq!(record.sequence, 7);

        let unknown = ChangeRow {
            event_name: "truncate".to_string(),
            ..row
        };
        assert!(unknown.into_record().is_none());
    }

    #[test]
    fn test_replay_after_reconnect_skips_overlap() {
        let mut cursor = SequenceCursor::default();
        cursor.observe(10);

        // Live changes while connected
        assert!(cursor.accept_live(11));
        assert_eq!(cursor.last_seen, Some(11));

        // Disconnected through 12..=13; 13 is also notified after LISTEN
        cursor.begin_replay();
        cursor.replay(12);
        cursor.replay(13);
        assert_eq!(cursor.last_seen, Some(13));

        assert!(!cursor.accept_live(13));
        assert!(cursor.accept_live(14));
        assert_eq!(cursor.last_seen, Some(14));

        // Late commits with an older sequence are still delivered
        assert!(cursor.accept_live(9));
        assert_eq!(cursor.last_seen, Some(14));
    }

    struct Failing;

    #[async_trait]
    impl EmailTransport for Failing {
        async fn send(&self, _message: EmailMessage) -> Result<String, DispatchError> {
            Err(DispatchError::Transport("throttled".to_string()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_acked() {
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::new(Failing),
            "The Photo Album",
            Duration::from_secs(3),
        ));
        let notifier = ChangeStreamNotifier::new(dispatcher, templates());

        let batch = received(vec![record(ChangeEventName::Insert, "cat.png", 1)]).await;
        assert_eq!(notifier.handle(&batch[0]).await, Ok(()));
    }
}
