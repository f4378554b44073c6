//! Outbound side of the content moderation collaborator.
//!
//! After a text message commits the service hands it to the moderator and moves on. The
//! verdict comes back later through `POST /internal/messages/{id}/moderation`.

use crate::models::{Message, MessageKind};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub trait ModerationClient: Send + Sync {
    /// Must not block the caller or surface errors to it.
    fn message_created(&self, message: &Message);
}

/// Used when no moderation endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopModeration;

impl ModerationClient for NoopModeration {
    fn message_created(&self, _message: &Message) {}
}

#[derive(Debug, Serialize)]
struct ModerationRequest {
    message_id: Uuid,
    conversation_id: Uuid,
    sender_id: Option<Uuid>,
    content: String,
}

#[derive(Clone)]
pub struct HttpModerationClient {
    client: Client,
    endpoint: String,
}

impl HttpModerationClient {
    pub fn new(endpoint: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build moderation HTTP client, using defaults");
                Client::new()
            });
        Self { client, endpoint }
    }
}

impl ModerationClient for HttpModerationClient {
    fn message_created(&self, message: &Message) {
        if message.kind != MessageKind::Text {
            return;
        }

        let request = ModerationRequest {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
        };
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        tokio::spawn(async move {
            let message_id = request.message_id;
            match client.post(&endpoint).json(&request).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%message_id, "Message submitted for moderation");
                }
                Ok(response) => {
                    warn!(
                        %message_id,
                        status = %response.status(),
                        "Moderation endpoint rejected message"
                    );
                }
                Err(e) => {
                    warn!(%message_id, error = %e, "Failed to submit message for moderation");
                }
            }
        });
    }
}
