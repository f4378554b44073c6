use crate::error::{AppError, AppResult};
use crate::store::ConversationTx;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Advanced(i64),
    /// Marker already at or past the requested sequence; nothing written.
    Unchanged(i64),
}

impl ReadOutcome {
    pub fn last_read_sequence(&self) -> i64 {
        match self {
            Self::Advanced(seq) | Self::Unchanged(seq) => *seq,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadState {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub last_read_sequence: i64,
    pub advanced: bool,
}

/// Moves the member's marker forward to `upto`. Markers never move back, which makes
/// repeated and out-of-order acks harmless.
pub async fn mark_read(tx: &mut dyn ConversationTx, user_id: Uuid, upto: i64) -> AppResult<ReadOutcome> {
    let last_sequence = tx.conversation().last_sequence;
    if upto < 0 || upto > last_sequence {
        return Err(AppError::invalid(format!(
            "sequence {upto} is out of range (last sequence is {last_sequence})"
        )));
    }

    let current = tx.read_marker(user_id).await?;
    if upto <= current {
        return Ok(ReadOutcome::Unchanged(current));
    }

    tx.set_read_marker(user_id, upto).await?;
    Ok(ReadOutcome::Advanced(upto))
}
