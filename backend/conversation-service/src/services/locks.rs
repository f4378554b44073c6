//! In-process per-conversation serialization.
//!
//! One `tokio::sync::Mutex` per conversation, created on demand and pruned once nobody holds
//! or waits on it. There is no global lock; different conversations never contend.

use crate::error::{AppError, AppResult};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct ConversationLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits at most `wait` for the conversation's lock; `Conflict` when it elapses.
    pub async fn acquire(&self, conversation_id: Uuid, wait: Duration) -> AppResult<ConversationGuard> {
        let lock = self
            .locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => Ok(ConversationGuard {
                conversation_id,
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            }),
            Err(_) => {
                tracing::debug!(%conversation_id, "timed out waiting for conversation lock");
                self.prune(conversation_id);
                Err(AppError::Conflict(conversation_id))
            }
        }
    }

    fn prune(&self, conversation_id: Uuid) {
        prune(&self.locks, conversation_id);
    }

    /// Number of conversations with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

fn prune(locks: &DashMap<Uuid, Arc<Mutex<()>>>, conversation_id: Uuid) {
    // the map's own Arc is the only one left: nobody holds or waits
    locks.remove_if(&conversation_id, |_, lock| Arc::strong_count(lock) == 1);
}

pub struct ConversationGuard {
    conversation_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConversationGuard {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        // release first so the strong count reflects only waiters
        drop(self.guard.take());
        prune(&self.locks, self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let locks = ConversationLocks::new();
        let id = Uuid::new_v4();

        let held = locks.acquire(id, Duration::from_millis(50)).await.unwrap();
        let err = locks.acquire(id, Duration::from_millis(20)).await.err().unwrap();
        assert_eq!(err, AppError::Conflict(id));

        drop(held);
        assert!(locks.acquire(id, Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn different_conversations_do_not_contend() {
        let locks = ConversationLocks::new();
        let _a = locks.acquire(Uuid::new_v4(), Duration::from_millis(20)).await.unwrap();
        let _b = locks.acquire(Uuid::new_v4(), Duration::from_millis(20)).await.unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = ConversationLocks::new();
        let id = Uuid::new_v4();
        {
            let guard = locks.acquire(id, Duration::from_millis(20)).await.unwrap();
            assert_eq!(guard.conversation_id(), id);
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
