use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound WebSocket frames from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsInboundEvent {
    /// Replay everything after `last_known_sequence`, then resume live delivery.
    #[serde(rename = "catch_up")]
    CatchUp {
        conversation_id: Uuid,
        #[serde(default)]
        last_known_sequence: i64,
    },
    #[serde(rename = "mark_read")]
    MarkRead {
        conversation_id: Uuid,
        upto_sequence: i64,
    },
    #[serde(rename = "typing")]
    Typing { conversation_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catch_up_frame() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"catch_up","conversation_id":"{id}","last_known_sequence":5}}"#);
        let event: WsInboundEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            event,
            WsInboundEvent::CatchUp {
                conversation_id: id,
                last_known_sequence: 5
            }
        );
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = r#"{"type":"get_unacked"}"#;
        assert!(serde_json::from_str::<WsInboundEvent>(raw).is_err());
    }
}
