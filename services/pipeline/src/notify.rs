//! Email notifications.
//!
//! [`NotificationDispatcher`] renders a [`NotificationPayload`] into a single
//! HTML email and hands it to an [`EmailTransport`]. There is no batching and
//! no retry; each send is bounded by the configured timeout.

use crate::config::MailConfig;
use crate::event::EventKind;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sesv2::config::{Builder as SesConfigBuilder, Region};
use aws_sdk_sesv2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use aws_sdk_sesv2::Client as SesClient;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur while dispatching a notification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Email transport error: {0}")]
    Transport(String),

    #[error("Email transport rejected credentials: {0}")]
    Credentials(String),

    #[error("Email send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid notification: {0}")]
    Invalid(String),
}

/// What to tell whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub recipient: String,
    pub sender: String,
    pub subject_title: String,
    pub body_message: String,
}

/// A fully rendered email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// Delivers rendered emails; returns the provider's message id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<String, DispatchError>;
}

/// Amazon SES v2 transport
pub struct SesTransport {
    client: SesClient,
}

impl SesTransport {
    /// Create a new SES transport for the configured region
    pub async fn new(config: &MailConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut ses_config_builder = SesConfigBuilder::from(&aws_config);

        // Custom endpoint for LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            ses_config_builder = ses_config_builder.endpoint_url(endpoint_url);
        }

        let client = SesClient::from_conf(ses_config_builder.build());

        info!(region = %config.region, "SES transport initialized");

        Self { client }
    }
}

fn utf8_content(data: &str) -> Result<Content, DispatchError> {
    Content::builder()
        .data(data)
        .charset("UTF-8")
        .build()
        .map_err(|e| DispatchError::Invalid(e.to_string()))
}

#[async_trait]
impl EmailTransport for SesTransport {
    async fn send(&self, message: EmailMessage) -> Result<String, DispatchError> {
        let content = EmailContent::builder()
            .simple(
                Message::builder()
                    .subject(utf8_content(&message.subject)?)
                    .body(Body::builder().html(utf8_content(&message.html_body)?).build())
                    .build(),
            )
            .build();

        let output = self
            .client
            .send_email()
            .from_email_address(&message.from)
            .destination(Destination::builder().to_addresses(&message.to).build())
            .content(content)
            .send()
            .await
            .map_err(|e| match e.code() {
                Some("AccessDeniedException")
                | Some("UnrecognizedClientException")
                | Some("InvalidClientTokenId") => {
                    DispatchError::Credentials(DisplayErrorContext(&e).to_string())
                }
                _ => DispatchError::Transport(DisplayErrorContext(&e).to_string()),
            })?;

        Ok(output.message_id().unwrap_or_default().to_string())
    }
}

/// Transport that only logs; keeps every message for inspection
#[derive(Default)]
pub struct LogTransport {
    sent: Mutex<Vec<EmailMessage>>,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, message: EmailMessage) -> Result<String, DispatchError> {
        let id = Uuid::new_v4().to_string();
        info!(
            message_id = %id,
            to = %message.to,
            subject = %message.subject,
            "Email (log transport)"
        );
        self.sent.lock().push(message);
        Ok(id)
    }
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Renders and sends notifications
pub struct NotificationDispatcher {
    transport: Arc<dyn EmailTransport>,
    sender_name: String,
    send_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        transport: Arc<dyn EmailTransport>,
        sender_name: impl Into<String>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            sender_name: sender_name.into(),
            send_timeout,
        }
    }

    pub fn from_config(transport: Arc<dyn EmailTransport>, config: &MailConfig) -> Self {
        Self::new(transport, config.sender_name.clone(), config.send_timeout())
    }

    /// Render the email for `payload`
    pub fn compose(&self, payload: &NotificationPayload) -> EmailMessage {
        let html_body = format!(
            "<html>\n  <body>\n    <h2>Sent from: </h2>\n    <ul>\n      \
             <li style=\"font-size:18px\">👤 <b>{name}</b></li>\n      \
             <li style=\"font-size:18px\">✉️ <b>{email}</b></li>\n    </ul>\n    \
             <p style=\"font-size:18px\">{message}</p>\n  </body>\n</html>\n",
            name = escape_html(&self.sender_name),
            email = escape_html(&payload.sender),
            message = escape_html(&payload.body_message),
        );

        EmailMessage {
            from: payload.sender.clone(),
            to: payload.recipient.clone(),
            subject: payload.subject_title.clone(),
            html_body,
        }
    }

    /// Send one email; returns the transport's message id
    #[instrument(skip(self, payload), fields(subject = %payload.subject_title))]
    pub async fn send(&self, payload: &NotificationPayload) -> Result<String, DispatchError> {
        if payload.recipient.trim().is_empty() {
            return Err(DispatchError::Invalid("recipient is empty".to_string()));
        }
        if payload.sender.trim().is_empty() {
            return Err(DispatchError::Invalid("sender is empty".to_string()));
        }

        let message = self.compose(payload);

        let result = match tokio::time::timeout(self.send_timeout, self.transport.send(message)).await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(self.send_timeout)),
        };

        match &result {
            Ok(id) => {
                debug!(message_id = %id, "Notification sent");
                metrics::counter!("pipeline.notifications.sent").increment(1);
            }
            Err(e) => {
                warn!(error = %e, "Notification dispatch failed");
                metrics::counter!("pipeline.notifications.failed").increment(1);
            }
        }

        result
    }
}

/// Builds the payloads for every notification the pipeline sends
#[derive(Debug, Clone)]
pub struct NotificationTemplates {
    sender: String,
    recipient: String,
}

impl NotificationTemplates {
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
        }
    }

    pub fn from_config(config: &MailConfig) -> Self {
        Self::new(config.sender.clone(), config.recipient.clone())
    }

    fn payload(&self, subject_title: &str, body_message: String) -> NotificationPayload {
        NotificationPayload {
            recipient: self.recipient.clone(),
            sender: self.sender.clone(),
            subject_title: subject_title.to_string(),
            body_message,
        }
    }

    pub fn image_added(&self, image_name: &str) -> NotificationPayload {
        self.payload(
            "Image Added",
            format!("Your Image has been saved {image_name}."),
        )
    }

    pub fn image_deleted(&self, image_name: &str) -> NotificationPayload {
        self.payload(
            "Image Deleted",
            format!("Image({image_name}) has been removed."),
        )
    }

    pub fn image_updated(&self, image_name: &str) -> NotificationPayload {
        self.payload(
            "Image Updated",
            format!("Image({image_name}) has been updated."),
        )
    }

    /// A decodable event that exhausted its retries
    pub fn image_rejected(&self, kind: EventKind, object_key: &str) -> NotificationPayload {
        let name = if object_key.trim().is_empty() {
            "<no object key>"
        } else {
            object_key
        };
        self.payload(
            "Image Rejected",
            format!("Image({name}) was rejected: the {kind} event could not be processed."),
        )
    }

    /// A message that never decoded into an event
    pub fn raw_rejected(&self, description: &str) -> NotificationPayload {
        self.payload(
            "Image Rejected",
            format!("An undecodable message was rejected: {description}"),
        )
    }

    pub fn upload_received(&self, bucket: &str, object_key: &str) -> NotificationPayload {
        self.payload(
            "New Image Upload",
            format!("We received your Image. Its URL is s3://{bucket}/{object_key}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    fn templates() -> NotificationTemplates {
        NotificationTemplates::new("album@example.com", "owner@example.com")
    }

    #[test]
    fn test_templates() {
        let added = templates().image_added("cat.png");
        assert_eq!(added.subject_title, "Image Added");
        assert_eq!(added.body_message, "Your Image has been saved cat.png.");
        assert_eq!(added.recipient, "owner@example.com");

        assert_eq!(templates().image_deleted("cat.png").subject_title, "Image Deleted");
        assert_eq!(
            templates().image_updated("cat.png").body_message,
            "Image(cat.png) has been updated."
        );

        let rejected = templates().image_rejected(EventKind::Created, "doc.pdf");
        assert_eq!(rejected.subject_title, "Image Rejected");
        assert!(rejected.body_message.contains("doc.pdf"));
        assert!(rejected.body_message.contains("created"));

        let upload = templates().upload_received("photo-album", "cat.png");
        assert_eq!(upload.subject_title, "New Image Upload");
        assert!(upload.body_message.ends_with("s3://photo-album/cat.png"));
    }

    #[test]
    fn test_compose_escapes_html() {
        let dispatcher = NotificationDispatcher::new(
            Arc::new(LogTransport::new()),
            "The Photo Album",
            Duration::from_secs(3),
        );
        let email = dispatcher.compose(&templates().image_added("<script>.png"));

        assert_eq!(email.subject, "Image Added");
        assert_eq!(email.from, "album@example.com");
        assert_eq!(email.to, "owner@example.com");
        assert!(email.html_body.contains("The Photo Album"));
        assert!(email.html_body.contains("&lt;script&gt;.png"));
        assert!(!email.html_body.contains("<script>"));
    }

    #[tokio::test]
    async fn test_send_through_transport() {
        let mut transport = MockEmailTransport::new();
        transport
            .expect_send()
            .withf(|m: &EmailMessage| m.subject == "Image Deleted" && m.html_body.contains("cat.png"))
            .times(1)
            .returning(|_| Ok("0100-abc".to_string()));

        let dispatcher =
            NotificationDispatcher::new(Arc::new(transport), "The Photo Album", Duration::from_secs(3));

        let id = dispatcher.send(&templates().image_deleted("cat.png")).await;
        assert_eq!(id, Ok("0100-abc".to_string()));
    }

    #[tokio::test]
    async fn test_transport_error_is_returned() {
        let mut transport = MockEmailTransport::new();
        transport
            .expect_send()
            .with(always())
            .returning(|_| Err(DispatchError::Credentials("denied".to_string())));

        let dispatcher =
            NotificationDispatcher::new(Arc::new(transport), "The Photo Album", Duration::from_secs(3));

        assert!(matches!(
            dispatcher.send(&templates().image_added("cat.png")).await,
            Err(DispatchError::Credentials(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_payload_never_reaches_transport() {
        let mut transport = MockEmailTransport::new();
        transport.expect_send().never();

        let dispatcher =
            NotificationDispatcher::new(Arc::new(transport), "The Photo Album", Duration::from_secs(3));

        let payload = NotificationTemplates::new("album@example.com", "").image_added("cat.png");
        assert!(matches!(
            dispatcher.send(&payload).await,
            Err(DispatchError::Invalid(_))
        ));
    }

    struct Stalled;

    #[async_trait]
    impl EmailTransport for Stalled {
        async fn send(&self, _message: EmailMessage) -> Result<String, DispatchError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout() {
        let dispatcher =
            NotificationDispatcher::new(Arc::new(Stalled), "The Photo Album", Duration::from_secs(3));

        assert_eq!(
            dispatcher.send(&templates().image_added("cat.png")).await,
            Err(DispatchError::Timeout(Duration::from_secs(3)))
        );
    }

    #[tokio::test]
    async fn test_log_transport_keeps_messages() {
        let transport = Arc::new(LogTransport::new());
        let dispatcher =
            NotificationDispatcher::new(transport.clone(), "The Photo Album", Duration::from_secs(3));

        dispatcher
            .send(&templates().image_added("cat.png"))
            .await
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Image Added");
    }
}
