use crate::change_stream::{ChangeEventName, ChangeStreamRecord};
use crate::config::DatabaseConfig;
use album_pipeline::queue::QueueBuffer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors returned by metadata stores; all of them are worth retrying
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("Metadata store query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Stored image metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    /// Object key of the image; unique
    pub image_name: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub description: Option<String>,
}

impl MetadataRecord {
    pub fn new(image_name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            image_name: image_name.into(),
            created_at,
            last_modified_at: created_at,
            description: None,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }
}

/// Keyed image metadata with idempotent writes.
///
/// Every committed write is reported on the store's change stream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the record for `image_name`
    async fn get(&self, image_name: &str) -> Result<Option<MetadataRecord>, StoreError>;

    /// Insert unless a record already exists; true when inserted
    async fn insert_if_absent(&self, record: &MetadataRecord) -> Result<bool, StoreError>;

    /// Delete the record; true when one existed
    async fn delete(&self, image_name: &str) -> Result<bool, StoreError>;

    /// Advance `lastModifiedAt` (never backwards) and replace the description
    /// when one is given; true when the record exists
    async fn touch(
        &self,
        image_name: &str,
        at: DateTime<Utc>,
        description: Option<String>,
    ) -> Result<bool, StoreError>;

    /// Check connectivity
    async fn ping(&self) -> Result<(), StoreError>;
}

struct MemoryState {
    records: HashMap<String, MetadataRecord>,
    sequence: u64,
}

/// Metadata store kept in process memory.
///
/// Change records are pushed to the change queue while the state lock is
/// held, so queue order is commit order.
pub struct InMemoryMetadataStore {
    state: Mutex<MemoryState>,
    changes: Option<Arc<QueueBuffer<ChangeStreamRecord>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                records: HashMap::new(),
                sequence: 0,
            }),
            changes: None,
        }
    }

    /// Publish the change stream to `queue`
    pub fn with_change_stream(mut self, queue: Arc<QueueBuffer<ChangeStreamRecord>>) -> Self {
        self.changes = Some(queue);
        self
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, ordered by image name
    pub fn records(&self) -> Vec<MetadataRecord> {
        let mut records: Vec<_> = self.state.lock().records.values().cloned().collect();
        records.sort_by(|a, b| a.image_name.cmp(&b.image_name));
        records
    }

    fn emit(
        &self,
        state: &mut MemoryState,
        event_name: ChangeEventName,
        image_name: &str,
        timestamp: DateTime<Utc>,
    ) {
        state.sequence += 1;
        if let Some(ref changes) = self.changes {
            changes.enqueue(ChangeStreamRecord {
                event_name,
                image_name: image_name.to_string(),
                timestamp,
                sequence: state.sequence,
            });
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, image_name: &str) -> Result<Option<MetadataRecord>, StoreError> {
        Ok(self.state.lock().records.get(image_name).cloned())
    }

    async fn insert_if_absent(&self, record: &MetadataRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if state.records.contains_key(&record.image_name) {
            return Ok(false);
        }

        state
            .records
            .insert(record.image_name.clone(), record.clone());
        self.emit(
            &mut state,
            ChangeEventName::Insert,
            &record.image_name,
            record.created_at,
        );
        Ok(true)
    }

    async fn delete(&self, image_name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if state.records.remove(image_name).is_none() {
            return Ok(false);
        }

        self.emit(&mut state, ChangeEventName::Remove, image_name, Utc::now());
        Ok(true)
    }

    async fn touch(
        &self,
        image_name: &str,
        at: DateTime<Utc>,
        description: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(image_name) else {
            return Ok(false);
        };

        record.last_modified_at = record.last_modified_at.max(at);
        if description.is_some() {
            record.description = description;
        }
        let timestamp = record.last_modified_at;

        self.emit(&mut state, ChangeEventName::Modify, image_name, timestamp);
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Metadata store backed by PostgreSQL.
///
/// The change stream is produced by a table trigger calling `pg_notify`, see
/// the migrations and [`crate::change_stream::PgChangeListener`].
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Connect with exponential backoff until `connect_retry_secs` runs out
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("database.url is required for the PostgreSQL store")?;

        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(config.connect_retry_secs)),
            ..Default::default()
        };

        let mut attempts = 0u32;

        loop {
            let result = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
                .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
                .connect(url)
                .await;

            match result {
                Ok(pool) => {
                    info!(attempts = attempts + 1, "Connected to PostgreSQL database");
                    return Ok(Self { pool });
                }
                Err(e) => {
                    attempts += 1;
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Database connection failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(e).context("Failed to connect to PostgreSQL");
                        }
                    }
                }
            }
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for the change listener)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn get(&self, image_name: &str) -> Result<Option<MetadataRecord>, StoreError> {
        let record = sqlx::query_as::<_, MetadataRecord>(
            r#"
            SELECT image_name, created_at, last_modified_at, description
            FROM images
            WHERE image_name = $1
            "#,
        )
        .bind(image_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    #[instrument(skip(self, record), fields(image_name = %record.image_name))]
    async fn insert_if_absent(&self, record: &MetadataRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO images (image_name, created_at, last_modified_at, description)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (image_name) DO NOTHING
            "#,
        )
        .bind(&record.image_name)
        .bind(record.created_at)
        .bind(record.last_modified_at)
        .bind(&record.description)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        debug!(inserted, "Insert if absent");
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn delete(&self, image_name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM images WHERE image_name = $1")
            .bind(image_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, description))]
    async fn touch(
        &self,
        image_name: &str,
        at: DateTime<Utc>,
        description: Option<String>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET last_modified_at = GREATEST(last_modified_at, $2),
                description = COALESCE($3, description)
            WHERE image_name = $1
            "#,
        )
        .bind(image_name)
        .bind(at)
        .bind(description)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use album_pipeline::queue::QueueOptions;
    use chrono::TimeZone;
    use tokio_test::assert_ok;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, hour, 0, 0).unwrap()
    }

    fn store_with_changes() -> (InMemoryMetadataStore, Arc<QueueBuffer<ChangeStreamRecord>>) {
        let changes = Arc::new(QueueBuffer::new("image-changes", QueueOptions::default()));
        (
            InMemoryMetadataStore::new().with_change_stream(changes.clone()),
            changes,
        )
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let (store, changes) = store_with_changes();

        assert!(assert_ok!(store.insert_if_absent(&MetadataRecord::new("cat.png", at(10))).await));
        assert!(!assert_ok!(store.insert_if_absent(&MetadataRecord::new("cat.png", at(11))).await));

        let record = store.get("cat.png").await.unwrap().unwrap();
        assert_eq!(record.created_at, at(10));
        assert_eq!(store.len(), 1);
        assert_eq!(changes.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let (store, changes) = store_with_changes();

        assert!(!store.delete("cat.png").await.unwrap());
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_touch_never_moves_backwards() {
        let store = InMemoryMetadataStore::new();
        store
            .insert_if_absent(&MetadataRecord::new("cat.png", at(10)))
            .await
            .unwrap();

        assert!(store
            .touch("cat.png", at(12), Some("beach".to_string()))
            .await
            .unwrap());
        assert!(store.touch("cat.png", at(11), None).await.unwrap());

        let record = store.get("cat.png").await.unwrap().unwrap();
        assert_eq!(record.last_modified_at, at(12));
        assert_eq!(record.description.as_deref(), Some("beach"));

        assert!(!store.touch("dog.png", at(12), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_change_stream_follows_commit_order() {
        let (store, changes) = store_with_changes();

        store
            .insert_if_absent(&MetadataRecord::new("cat.png", at(10)))
            .await
            .unwrap();
        store.touch("cat.png", at(11), None).await.unwrap();
        store.delete("cat.png").await.unwrap();

        let batch = changes.receive(5, Duration::ZERO).await;
        let names: Vec<_> = batch.iter().map(|m| m.body.event_name).collect();
        assert_eq!(
            names,
            vec![
                ChangeEventName::Insert,
                ChangeEventName::Modify,
                ChangeEventName::Remove
            ]
        );

        let sequences: Vec<_> = batch.iter().map(|m| m.body.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(batch.iter().all(|m| m.body.image_name == "cat.png"));
    }

    #[test]
    fn test_sqlx_error_mapping() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::Query(_)
        ));
    }
}
