use crate::config::KafkaConfig;
use album_pipeline::producer::EventPublisher;
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Consumer settings for the storage notification topic
pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("enable.auto.commit", "false")
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

    if config.ssl_enabled {
        client_config.set("security.protocol", "SASL_SSL");
        if let Some(ref ca_location) = config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    if let (Some(ref username), Some(ref password)) =
        (&config.sasl_username, &config.sasl_password)
    {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    client_config
}

/// Feeds storage notifications from Kafka into the event publisher
pub struct NotificationFeed {
    consumer: StreamConsumer,
    publisher: Arc<EventPublisher>,
}

impl NotificationFeed {
    pub fn new(config: &KafkaConfig, publisher: Arc<EventPublisher>) -> Result<Self> {
        let consumer: StreamConsumer = client_config(config)
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.notification_topic])
            .context("Failed to subscribe to storage notification topic")?;

        info!(
            topic = %config.notification_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            publisher,
        })
    }

    /// Consume until `shutdown` is cancelled
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting storage notification feed");

        let mut message_stream = self.consumer.stream();

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = message_stream.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            match message_result {
                Ok(message) => {
                    if let Err(e) = self.process_message(&message).await {
                        // Left uncommitted; a later commit on the partition moves past it
                        error!(
                            error = %e,
                            partition = message.partition(),
                            offset = message.offset(),
                            "Failed to publish storage notification"
                        );
                        metrics::counter!("storage.feed.failed").increment(1);
                    } else {
                        if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                            warn!(error = %e, "Failed to commit offset");
                        }
                        metrics::counter!("storage.feed.processed").increment(1);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("storage.kafka.errors").increment(1);
                }
            }
        }

        info!("Storage notification feed stopped");
        Ok(())
    }

    async fn process_message(&self, message: &BorrowedMessage<'_>) -> Result<()> {
        let payload = message.payload().context("Message has no payload")?;

        let summary = self
            .publisher
            .publish_raw(payload)
            .await
            .context("Failed to decode storage notification")?;

        debug!(
            published = summary.published,
            ignored = summary.ignored,
            deliveries = summary.deliveries,
            "Storage notification published"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka_config() -> KafkaConfig {
        KafkaConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            consumer_group: "album-storage".to_string(),
            notification_topic: "album.storage.notifications".to_string(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30000,
            max_poll_interval_ms: 300000,
        }
    }

    #[test]
    fn test_client_config_disables_auto_commit() {
        let config = client_config(&kafka_config());

        assert_eq!(config.get("group.id"), Some("album-storage"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_client_config_with_sasl() {
        let mut kafka = kafka_config();
        kafka.ssl_enabled = true;
        kafka.sasl_username = Some("album".to_string());
        kafka.sasl_password = Some("secret".to_string());

        let config = client_config(&kafka);

        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanisms"), Some("PLAIN"));
        assert_eq!(config.get("sasl.username"), Some("album"));
    }
}
