use album_pipeline::consumer::{HandlerError, MessageHandler};
use album_pipeline::event::Payload;
use album_pipeline::notify::{NotificationDispatcher, NotificationPayload, NotificationTemplates};
use album_pipeline::queue::QueueMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Longest raw payload excerpt quoted in a rejection email
const RAW_EXCERPT_CHARS: usize = 200;

pub struct QuarantineProcessor {
    dispatcher: Arc<NotificationDispatcher>,
    templates: NotificationTemplates,
}

impl QuarantineProcessor {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, templates: NotificationTemplates) -> Self {
        Self {
            dispatcher,
            templates,
        }
    }

    /// The rejection email for a dead-lettered payload
    pub fn rejection(&self, payload: &Payload) -> NotificationPayload {
        match payload {
            Payload::Event(event) => self.templates.image_rejected(event.kind, &event.object_key),
            Payload::Raw(value) => {
                let text = value.to_string();
                let excerpt: String = text.chars().take(RAW_EXCERPT_CHARS).collect();
                self.templates.raw_rejected(&excerpt)
            }
        }
    }
}

#[async_trait]
impl MessageHandler<Payload> for QuarantineProcessor {
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn handle(&self, message: &QueueMessage<Payload>) -> Result<(), HandlerError> {
        let rejection = self.rejection(&message.body);

        match self.dispatcher.send(&rejection).await {
            Ok(message_id) => {
                info!(email_id = %message_id, "Rejection notification sent");
                metrics::counter!("storage.quarantine.notified").increment(1);
            }
            Err(e) => {
                // Not retried; the message is dropped either way
                error!(error = %e, "Failed to send rejection notification");
                metrics::counter!("storage.quarantine.dispatch_failed").increment(1);
            }
        }

        Ok(())
    }
}
