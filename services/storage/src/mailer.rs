use album_pipeline::consumer::{HandlerError, MessageHandler};
use album_pipeline::event::{EventKind, Payload, BUCKET};
use album_pipeline::notify::{NotificationDispatcher, NotificationTemplates};
use album_pipeline::queue::QueueMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Bucket named in upload emails when the event does not carry one
const UNKNOWN_BUCKET: &str = "images";

/// Sends a "New Image Upload" email for every created object on the mail queue
pub struct UploadMailer {
    dispatcher: Arc<NotificationDispatcher>,
    templates: NotificationTemplates,
}

impl UploadMailer {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, templates: NotificationTemplates) -> Self {
        Self {
            dispatcher,
            templates,
        }
    }
}

#[async_trait]
impl MessageHandler<Payload> for UploadMailer {
    async fn handle(&self, message: &QueueMessage<Payload>) -> Result<(), HandlerError> {
        let Some(event) = message.body.event() else {
            debug!(message_id = %message.id, "Skipping non-event payload");
            return Ok(());
        };

        if event.kind != EventKind::Created || !event.has_object_key() {
            return Ok(());
        }

        let bucket = event.attribute(BUCKET).unwrap_or(UNKNOWN_BUCKET);
        let payload = self.templates.upload_received(bucket, &event.object_key);

        match self.dispatcher.send(&payload).await {
            Ok(email_id) => {
                info!(object_key = %event.object_key, email_id = %email_id, "Upload notification sent");
            }
            Err(e) => {
                error!(object_key = %event.object_key, error = %e, "Failed to send upload notification");
            }
        }

        Ok(())
    }
}
