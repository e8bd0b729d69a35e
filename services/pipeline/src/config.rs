//! Configuration building blocks for the album pipeline.
//!
//! This module provides the queue and mail settings shared by every consumer.
//! Values are deserialized by the service crate (file + environment) and then
//! handed to components at construction; nothing here reads the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Queue buffer and consumer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of messages handed to one invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Long-poll window while waiting for a batch to fill
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// How long a received message stays hidden before redelivery
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Deliveries allowed before a message is moved to the dead-letter queue
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// Messages older than this are discarded (unbounded when absent)
    #[serde(default)]
    pub retention_secs: Option<u64>,
    /// Upper bound for processing a single batch
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
    /// Number of concurrent invocations polling the queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_batch_size() -> usize {
    5
}

fn default_max_wait_secs() -> u64 {
    10
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_receive_count() -> u32 {
    2
}

fn default_invocation_timeout_secs() -> u64 {
    15
}

fn default_concurrency() -> usize {
    1
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_wait_secs: default_max_wait_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
            retention_secs: None,
            invocation_timeout_secs: default_invocation_timeout_secs(),
            concurrency: default_concurrency(),
        }
    }
}

impl QueueConfig {
    /// Get the long-poll window as Duration
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// Get the visibility timeout as Duration
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Get the retention period as Duration
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    /// Get the per-invocation timeout as Duration
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    /// Validate the settings of the queue called `name`
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("queues.{name}.batch_size"),
                message: "must be at least 1".to_string(),
            });
        }

        if self.max_receive_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("queues.{name}.max_receive_count"),
                message: "must be at least 1".to_string(),
            });
        }

        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("queues.{name}.concurrency"),
                message: "must be at least 1".to_string(),
            });
        }

        // Visibility starts when a message is popped, up to max_wait before the
        // batch is handed over; it must outlast the wait plus the invocation
        let busy_secs = self.max_wait_secs + self.invocation_timeout_secs;
        if self.visibility_timeout_secs < busy_secs {
            return Err(ConfigError::InvalidValue {
                key: format!("queues.{name}.visibility_timeout_secs"),
                message: format!(
                    "{}s is shorter than max wait plus invocation timeout ({}s)",
                    self.visibility_timeout_secs, busy_secs
                ),
            });
        }

        Ok(())
    }
}

/// Which email transport delivers notifications
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MailTransportKind {
    /// Amazon SES v2
    #[default]
    Ses,
    /// Log the rendered email and keep it in memory
    Log,
}

/// Email notification configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailConfig {
    /// Verified sender address
    #[serde(default)]
    pub sender: String,
    /// Address receiving every notification
    #[serde(default)]
    pub recipient: String,
    /// Region of the email service
    #[serde(default)]
    pub region: String,
    /// Custom endpoint URL (for LocalStack and similar)
    pub endpoint_url: Option<String>,
    /// Display name shown in the email body
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
    /// Timeout for a single send call
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Transport used to deliver email
    #[serde(default)]
    pub transport: MailTransportKind,
}

fn default_sender_name() -> String {
    "The Photo Album".to_string()
}

fn default_send_timeout_secs() -> u64 {
    3
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            sender: String::new(),
            recipient: String::new(),
            region: String::new(),
            endpoint_url: None,
            sender_name: default_sender_name(),
            send_timeout_secs: default_send_timeout_secs(),
            transport: MailTransportKind::default(),
        }
    }
}

impl MailConfig {
    /// Get the send timeout as Duration
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender.trim().is_empty() {
            return Err(ConfigError::MissingRequired("mail.sender".to_string()));
        }

        if self.recipient.trim().is_empty() {
            return Err(ConfigError::MissingRequired("mail.recipient".to_string()));
        }

        if self.region.trim().is_empty() {
            return Err(ConfigError::MissingRequired("mail.region".to_string()));
        }

        if self.send_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "mail.send_timeout_secs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail_config() -> MailConfig {
        MailConfig {
            sender: "album@example.com".to_string(),
            recipient: "owner@example.com".to_string(),
            region: "eu-west-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_queue_config() {
        let config = QueueConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.max_wait(), Duration::from_secs(10));
        assert_eq!(config.max_receive_count, 2);
        assert!(config.retention().is_none());
        assert!(config.validate("record").is_ok());
    }

    #[test]
    fn test_visibility_shorter_than_invocation_is_rejected() {
        let config = QueueConfig {
            visibility_timeout_secs: 5,
            invocation_timeout_secs: 15,
            ..Default::default()
        };

        match config.validate("record") {
            Err(ConfigError::InvalidValue { key, .. }) => {
                assert_eq!(key, "queues.record.visibility_timeout_secs");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_visibility_must_cover_wait_and_invocation() {
        let at_bound = QueueConfig {
            visibility_timeout_secs: 25,
            max_wait_secs: 10,
            invocation_timeout_secs: 15,
            ..Default::default()
        };
        assert!(at_bound.validate("record").is_ok());

        // Longer than the invocation alone, yet a message popped early in the wait reappears
        let below_bound = QueueConfig {
            visibility_timeout_secs: 20,
            ..at_bound
        };
        assert!(matches!(
            below_bound.validate("record"),
            Err(ConfigError::InvalidValue { key, .. }) if key == "queues.record.visibility_timeout_secs"
        ));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let config = QueueConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate("mail").is_err());
    }

    #[test]
    fn test_mail_config_requires_addresses() {
        assert!(mail_config().validate().is_ok());

        let missing_sender = MailConfig {
            sender: String::new(),
            ..mail_config()
        };
        assert!(matches!(
            missing_sender.validate(),
            Err(ConfigError::MissingRequired(key)) if key == "mail.sender"
        ));

        let missing_region = MailConfig {
            region: "  ".to_string(),
            ..mail_config()
        };
        assert!(matches!(
            missing_region.validate(),
            Err(ConfigError::MissingRequired(key)) if key == "mail.region"
        ));
    }

    #[test]
    fn test_mail_transport_deserialization() {
        let config: MailConfig = serde_json::from_str(
            r#"{"sender": "a@example.com", "recipient": "b@example.com", "region": "eu-west-1", "transport": "log"}"#,
        )
        .unwrap();
        assert_eq!(config.transport, MailTransportKind::Log);
        assert_eq!(config.sender_name, "The Photo Album");
        assert_eq!(config.send_timeout(), Duration::from_secs(3));
    }
}
