//! Delivery of committed events to connected sessions.
//!
//! Callers publish only after the originating mutation committed. Publishing never fails
//! the caller: a relay problem is logged and clients recover through catch-up.

use super::events::ChatEvent;
use super::streams::StreamRelay;
use super::{ConnectionRegistry, Frame};
use crate::metrics;

#[derive(Clone)]
pub struct Fanout {
    registry: ConnectionRegistry,
    relay: Option<StreamRelay>,
}

impl Fanout {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: StreamRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn publish(&self, event: ChatEvent) {
        metrics::record_event_published(event.event_type());
        self.deliver_local(&event).await;
        if let Some(relay) = &self.relay {
            relay.forward(&event);
        }
    }

    /// Applies the event's channel effects and pushes it to this instance's sessions.
    pub async fn deliver_local(&self, event: &ChatEvent) -> usize {
        let Some(conversation_id) = event.conversation_id() else {
            return 0;
        };
        let frame = Frame {
            conversation_id: Some(conversation_id),
            sequence: event.appended_sequence(),
            payload: event.to_payload(),
        };

        let delivered = match event {
            ChatEvent::ConversationCreated { member_ids, .. } => {
                for user_id in member_ids {
                    self.registry.subscribe(*user_id, conversation_id).await;
                }
                self.registry
                    .publish_to_conversation(conversation_id, &frame, None)
                    .await
            }
            ChatEvent::MemberAdded { user_ids, .. } => {
                for user_id in user_ids {
                    self.registry.subscribe(*user_id, conversation_id).await;
                }
                self.registry
                    .publish_to_conversation(conversation_id, &frame, None)
                    .await
            }
            ChatEvent::MemberRemoved { user_id, .. } => {
                // revoked before the broadcast so the removed user sees nothing further
                self.registry.unsubscribe(*user_id, conversation_id).await;
                let others = self
                    .registry
                    .publish_to_conversation(conversation_id, &frame, None)
                    .await;
                others + self.registry.publish_to_user(*user_id, &frame).await
            }
            ChatEvent::ConversationDeleted { deleted_by, .. } => {
                let mut sent = self
                    .registry
                    .publish_to_conversation(conversation_id, &frame, Some(*deleted_by))
                    .await;
                sent += self.registry.publish_to_user(*deleted_by, &frame).await;
                self.registry.drop_channel(conversation_id).await;
                sent
            }
            ChatEvent::ReadAdvanced { user_id, .. } | ChatEvent::Typing { user_id, .. } => {
                self.registry
                    .publish_to_conversation(conversation_id, &frame, Some(*user_id))
                    .await
            }
            _ => {
                self.registry
                    .publish_to_conversation(conversation_id, &frame, None)
                    .await
            }
        };

        metrics::record_deliveries(delivered);
        tracing::debug!(
            %conversation_id,
            event_type = event.event_type(),
            delivered,
            "Event delivered"
        );
        delivered
    }
}
