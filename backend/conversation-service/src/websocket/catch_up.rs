//! Per-session bookkeeping for reconnect catch-up.
//!
//! While a conversation's missed entries are being replayed, live frames for that
//! conversation are held back. When the replay ends they are released in arrival order,
//! minus any append the replay already covered.

use crate::websocket::Frame;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct CatchUpBuffers {
    pending: HashMap<Uuid, Vec<Frame>>,
}

impl CatchUpBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts buffering for the conversation. False if a replay is already running.
    pub fn begin(&mut self, conversation_id: Uuid) -> bool {
        if self.pending.contains_key(&conversation_id) {
            return false;
        }
        self.pending.insert(conversation_id, Vec::new());
        true
    }

    pub fn is_active(&self, conversation_id: Uuid) -> bool {
        self.pending.contains_key(&conversation_id)
    }

    /// Holds the frame if its conversation is replaying, otherwise hands it back for
    /// immediate delivery.
    pub fn hold(&mut self, frame: Frame) -> Option<Frame> {
        match frame
            .conversation_id
            .and_then(|id| self.pending.get_mut(&id))
        {
            Some(buffer) => {
                buffer.push(frame);
                None
            }
            None => Some(frame),
        }
    }

    /// Ends a successful replay. Appends at or below `replayed_upto` were already sent.
    pub fn finish(&mut self, conversation_id: Uuid, replayed_upto: i64) -> Vec<Frame> {
        self.pending
            .remove(&conversation_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|frame| !frame.sequence.is_some_and(|seq| seq <= replayed_upto))
            .collect()
    }

    /// Ends a failed replay; everything held is released untouched.
    pub fn abort(&mut self, conversation_id: Uuid) -> Vec<Frame> {
        self.pending.remove(&conversation_id).unwrap_or_default()
    }
}
