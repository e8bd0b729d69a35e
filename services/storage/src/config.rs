use crate::record_processor::UpdatePolicy;
use album_pipeline::config::{ConfigError, MailConfig, QueueConfig};
use anyhow::Context;
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Email notification configuration
    #[serde(default)]
    pub mail: MailConfig,
    /// Per-queue buffering and consumer settings
    #[serde(default)]
    pub queues: QueuesConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Kafka ingress for storage notifications (disabled when absent)
    pub kafka: Option<KafkaConfig>,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Record processing rules
    #[serde(default)]
    pub records: RecordsConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Settings of every queue in the topology
#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    /// Created events feeding the record processor
    #[serde(default = "default_record_queue")]
    pub record: QueueConfig,
    /// Removals feeding the record processor
    #[serde(default = "default_record_queue")]
    pub delete: QueueConfig,
    /// Metadata updates feeding the record processor
    #[serde(default = "default_record_queue")]
    pub update: QueueConfig,
    /// Unfiltered queue feeding the upload mailer
    #[serde(default = "default_mail_queue")]
    pub mail: QueueConfig,
    /// Dead-letter queue feeding the quarantine processor
    #[serde(default = "default_quarantine_queue")]
    pub quarantine: QueueConfig,
    /// Metadata change stream feeding the change notifier
    #[serde(default = "default_change_stream_queue")]
    pub change_stream: QueueConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; the in-memory store is used when absent
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Give up connecting at startup after this many seconds
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying storage change notifications
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Record processing rules
#[derive(Debug, Clone, Deserialize)]
pub struct RecordsConfig {
    /// What an update does when no record exists
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    /// Accepted image file extensions, lowercase without the dot
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "album-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_record_queue() -> QueueConfig {
    QueueConfig::default()
}

fn default_mail_queue() -> QueueConfig {
    QueueConfig {
        invocation_timeout_secs: 5,
        ..QueueConfig::default()
    }
}

fn default_quarantine_queue() -> QueueConfig {
    QueueConfig {
        invocation_timeout_secs: 5,
        retention_secs: Some(30 * 60),
        ..QueueConfig::default()
    }
}

// One image can fill a whole batch, and its sends run back to back
fn default_change_stream_queue() -> QueueConfig {
    QueueConfig {
        invocation_timeout_secs: 20,
        concurrency: 1,
        ..QueueConfig::default()
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_connect_retry_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_consumer_group() -> String {
    "album-storage".to_string()
}

fn default_notification_topic() -> String {
    "album.storage.notifications".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["jpeg".to_string(), "jpg".to_string(), "png".to_string()]
}

impl Config {
    /// Load configuration from config files and the environment.
    ///
    /// `ALBUM__MAIL__SENDER` maps to `mail.sender`; the `SES_EMAIL_FROM`,
    /// `SES_EMAIL_TO` and `SES_REGION` variables are honoured as well and win
    /// over every other source.
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/album").required(false))
            .add_source(config::File::with_name("/etc/album/album").required(false))
            // Override with environment variables
            // ALBUM__QUEUES__RECORD__BATCH_SIZE -> queues.record.batch_size
            .add_source(
                config::Environment::with_prefix("ALBUM")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("mail.sender", std::env::var("SES_EMAIL_FROM").ok())?
            .set_override_option("mail.recipient", std::env::var("SES_EMAIL_TO").ok())?
            .set_override_option("mail.region", std::env::var("SES_REGION").ok())?;

        Self::from_builder(builder)
    }

    /// Build and validate configuration from prepared sources
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<Self> {
        let config: Config = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Check every setting; any error is fatal at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mail.validate()?;

        for (name, queue) in self.queues.iter() {
            queue.validate(name)?;
        }

        // Cross-batch ordering per image name needs a single consumer
        if self.queues.change_stream.concurrency != 1 {
            return Err(ConfigError::InvalidValue {
                key: "queues.change_stream.concurrency".to_string(),
                message: "the change stream must be consumed by exactly one invocation".to_string(),
            });
        }

        // A send must time out on its own before the invocation does
        let sequential_sends = [
            ("mail", &self.queues.mail, 1),
            ("quarantine", &self.queues.quarantine, 1),
            (
                "change_stream",
                &self.queues.change_stream,
                self.queues.change_stream.batch_size as u64,
            ),
        ];
        for (name, queue, sends) in sequential_sends {
            let needed = sends * self.mail.send_timeout_secs;
            if queue.invocation_timeout_secs <= needed {
                return Err(ConfigError::InvalidValue {
                    key: format!("queues.{name}.invocation_timeout_secs"),
                    message: format!(
                        "{}s leaves no headroom over {} send(s) of up to {}s",
                        queue.invocation_timeout_secs, sends, self.mail.send_timeout_secs
                    ),
                });
            }
        }

        if self.records.allowed_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "records.allowed_extensions".to_string(),
                message: "at least one extension is required".to_string(),
            });
        }

        if let Some(ref kafka) = self.kafka {
            if kafka.bootstrap_servers.trim().is_empty() {
                return Err(ConfigError::MissingRequired(
                    "kafka.bootstrap_servers".to_string(),
                ));
            }
        }

        if let Some(ref url) = self.database.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(ConfigError::InvalidValue {
                    key: "database.url".to_string(),
                    message: "expected a postgres:// URL".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl QueuesConfig {
    /// Every queue with its configuration key
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &QueueConfig)> {
        [
            ("record", &self.record),
            ("delete", &self.delete),
            ("update", &self.update),
            ("mail", &self.mail),
            ("quarantine", &self.quarantine),
            ("change_stream", &self.change_stream),
        ]
        .into_iter()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            record: default_record_queue(),
            delete: default_record_queue(),
            update: default_record_queue(),
            mail: default_mail_queue(),
            quarantine: default_quarantine_queue(),
            change_stream: default_change_stream_queue(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            connect_retry_secs: default_connect_retry_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            update_policy: UpdatePolicy::default(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}
