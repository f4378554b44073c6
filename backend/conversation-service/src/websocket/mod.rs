use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

pub mod catch_up;
pub mod events;
pub mod fanout;
pub mod message_types;
pub mod streams;

/// Unique identifier for one WebSocket session
///
/// A user may hold several sessions at once (phone + desktop). The id lets a closing
/// connection remove exactly its own sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// One serialized event on its way to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub conversation_id: Option<Uuid>,
    /// Set for `message.appended` so a catching-up session can drop replayed entries.
    pub sequence: Option<i64>,
    pub payload: String,
}

struct Session {
    id: SubscriberId,
    sender: UnboundedSender<Frame>,
}

#[derive(Default)]
struct RegistryInner {
    /// user -> live sessions
    sessions: HashMap<Uuid, Vec<Session>>,
    /// conversation channel -> subscribed users
    channels: HashMap<Uuid, HashSet<Uuid>>,
    /// user -> channels, for cleanup on disconnect
    subscriptions: HashMap<Uuid, HashSet<Uuid>>,
}

impl RegistryInner {
    fn unlink(&mut self, user_id: Uuid, conversation_id: Uuid) -> bool {
        let removed = match self.channels.get_mut(&conversation_id) {
            Some(users) => {
                let removed = users.remove(&user_id);
                if users.is_empty() {
                    self.channels.remove(&conversation_id);
                }
                removed
            }
            None => false,
        };
        if let Some(convs) = self.subscriptions.get_mut(&user_id) {
            convs.remove(&conversation_id);
            if convs.is_empty() {
                self.subscriptions.remove(&user_id);
            }
        }
        removed
    }

    /// Sends to every session of `user_id`, dropping closed ones. Returns deliveries.
    fn send_to_user(&mut self, user_id: Uuid, frame: &Frame) -> usize {
        let Some(sessions) = self.sessions.get_mut(&user_id) else {
            return 0;
        };
        let before = sessions.len();
        sessions.retain(|s| s.sender.send(frame.clone()).is_ok());
        let delivered = sessions.len();
        if before != delivered {
            tracing::debug!(
                %user_id,
                dead = before - delivered,
                "Pruned closed sessions during publish"
            );
        }
        if delivered == 0 {
            self.release_user(user_id);
        }
        delivered
    }

    /// Forgets a user with no live session along with all their channel subscriptions.
    fn release_user(&mut self, user_id: Uuid) {
        self.sessions.remove(&user_id);
        if let Some(convs) = self.subscriptions.remove(&user_id) {
            for conversation_id in convs {
                if let Some(users) = self.channels.get_mut(&conversation_id) {
                    users.remove(&user_id);
                    if users.is_empty() {
                        self.channels.remove(&conversation_id);
                    }
                }
            }
        }
    }
}

/// Process-wide registry of connected sessions and conversation channels
///
/// A user is on a conversation's channel exactly while they are a member and have at
/// least one live session. Channel membership is per user, delivery is per session.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session for `user_id`.
    ///
    /// Returns the session id (needed for [`Self::detach_session`]) and the frame stream.
    pub async fn attach_session(&self, user_id: Uuid) -> (SubscriberId, UnboundedReceiver<Frame>) {
        let (tx, rx) = unbounded_channel();
        let id = SubscriberId::new();

        let mut guard = self.inner.write().await;
        let sessions = guard.sessions.entry(user_id).or_default();
        sessions.push(Session { id, sender: tx });
        tracing::debug!(%user_id, ?id, sessions = sessions.len(), "Session attached");

        (id, rx)
    }

    /// Removes one session. The user's channel subscriptions go with their last session.
    pub async fn detach_session(&self, user_id: Uuid, id: SubscriberId) {
        let mut guard = self.inner.write().await;

        let remaining = match guard.sessions.get_mut(&user_id) {
            Some(sessions) => {
                sessions.retain(|s| s.id != id);
                sessions.len()
            }
            None => return,
        };

        if remaining == 0 {
            guard.release_user(user_id);
            tracing::debug!(%user_id, "Last session closed, subscriptions released");
        }
    }

    /// Puts the user on the conversation's channel. No-op (false) when they have no session.
    pub async fn subscribe(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        let mut guard = self.inner.write().await;
        if !guard.sessions.contains_key(&user_id) {
            return false;
        }
        guard.channels.entry(conversation_id).or_default().insert(user_id);
        guard.subscriptions.entry(user_id).or_default().insert(conversation_id);
        true
    }

    pub async fn unsubscribe(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        self.inner.write().await.unlink(user_id, conversation_id)
    }

    /// Removes a conversation channel with every subscription to it.
    pub async fn drop_channel(&self, conversation_id: Uuid) {
        let mut guard = self.inner.write().await;
        if let Some(users) = guard.channels.remove(&conversation_id) {
            for user_id in users {
                if let Some(convs) = guard.subscriptions.get_mut(&user_id) {
                    convs.remove(&conversation_id);
                    if convs.is_empty() {
                        guard.subscriptions.remove(&user_id);
                    }
                }
            }
        }
    }

    /// Delivers to every session of every user on the channel except `except`.
    /// Returns the number of sessions reached.
    pub async fn publish_to_conversation(
        &self,
        conversation_id: Uuid,
        frame: &Frame,
        except: Option<Uuid>,
    ) -> usize {
        let mut guard = self.inner.write().await;
        let users: Vec<Uuid> = match guard.channels.get(&conversation_id) {
            Some(users) => users
                .iter()
                .copied()
                .filter(|u| Some(*u) != except)
                .collect(),
            None => return 0,
        };

        users
            .into_iter()
            .map(|user_id| guard.send_to_user(user_id, frame))
            .sum()
    }

    pub async fn publish_to_user(&self, user_id: Uuid, frame: &Frame) -> usize {
        self.inner.write().await.send_to_user(user_id, frame)
    }

    pub async fn is_subscribed(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        let guard = self.inner.read().await;
        guard
            .channels
            .get(&conversation_id)
            .is_some_and(|users| users.contains(&user_id))
    }

    /// Users on a conversation channel (for debugging/metrics)
    pub async fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.channels.get(&conversation_id).map(|u| u.len()).unwrap_or(0)
    }

    pub async fn session_count(&self, user_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.sessions.get(&user_id).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Frame {
            conversation_id: None,
            sequence: None,
            payload: text.to_string(),
        }
    }

    #[tokio::test]
    async fn subscribe_requires_a_session() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();

        assert!(!registry.subscribe(user, conv).await);
        let (_id, _rx) = registry.attach_session(user).await;
        assert!(registry.subscribe(user, conv).await);
        assert!(registry.is_subscribed(user, conv).await);
    }

    #[tokio::test]
    async fn publish_reaches_every_session_except_excluded_user() {
        let registry = ConnectionRegistry::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = Uuid::new_v4();

        let (_a1, mut alice_phone) = registry.attach_session(alice).await;
        let (_a2, mut alice_desktop) = registry.attach_session(alice).await;
        let (_b, mut bob_rx) = registry.attach_session(bob).await;
        registry.subscribe(alice, conv).await;
        registry.subscribe(bob, conv).await;

        let delivered = registry
            .publish_to_conversation(conv, &frame("hello"), Some(bob))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(alice_phone.try_recv().unwrap().payload, "hello");
        assert_eq!(alice_desktop.try_recv().unwrap().payload, "hello");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_sessions_are_pruned_on_publish() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();

        let (_id, rx) = registry.attach_session(user).await;
        registry.subscribe(user, conv).await;
        drop(rx);

        assert_eq!(registry.publish_to_conversation(conv, &frame("x"), None).await, 0);
        assert_eq!(registry.session_count(user).await, 0);
        assert!(!registry.is_subscribed(user, conv).await);

        // a user whose only session died is treated as offline
        assert!(!registry.subscribe(user, Uuid::new_v4()).await);
        assert_eq!(registry.publish_to_user(user, &frame("y")).await, 0);
    }

    #[tokio::test]
    async fn last_detach_releases_subscriptions() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();

        let (first, _rx1) = registry.attach_session(user).await;
        let (second, _rx2) = registry.attach_session(user).await;
        registry.subscribe(user, conv).await;

        registry.detach_session(user, first).await;
        assert!(registry.is_subscribed(user, conv).await);

        registry.detach_session(user, second).await;
        assert!(!registry.is_subscribed(user, conv).await);
        assert_eq!(registry.subscriber_count(conv).await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_and_drop_channel() {
        let registry = ConnectionRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = Uuid::new_v4();
        let (_ia, _ra) = registry.attach_session(a).await;
        let (_ib, _rb) = registry.attach_session(b).await;
        registry.subscribe(a, conv).await;
        registry.subscribe(b, conv).await;

        assert!(registry.unsubscribe(a, conv).await);
        assert!(!registry.unsubscribe(a, conv).await);
        assert_eq!(registry.subscriber_count(conv).await, 1);

        registry.drop_channel(conv).await;
        assert_eq!(registry.subscriber_count(conv).await, 0);
        assert!(!registry.is_subscribed(b, conv).await);
    }
}
