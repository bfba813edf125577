//! Session registry: user identity -> set of live transport sessions.
//!
//! Pure in-memory and process-lifetime only; a restart drops every
//! registration and clients re-register on reconnect. The map is sharded by
//! user id so register/unregister/lookup on unrelated users never serialize.
//!
//! Each session carries a bounded outbound queue. Pushes never block: when a
//! queue is full, ephemeral events (typing) are dropped silently and durable
//! events mark the session for reconnect-resync instead.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use parley_shared::constants::SESSION_QUEUE_DEPTH;
use parley_shared::protocol::ServerEvent;
use parley_shared::types::{SessionId, UserId};

const SHARD_COUNT: usize = 16;

/// One live connection belonging to a user.
pub struct SessionHandle {
    id: SessionId,
    user: UserId,
    tx: mpsc::Sender<ServerEvent>,
    needs_resync: AtomicBool,
}

impl SessionHandle {
    /// Create a handle and the receiving half its transport loop drains.
    pub fn new(user: UserId) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let handle = Arc::new(Self {
            id: SessionId::new(),
            user,
            tx,
            needs_resync: AtomicBool::new(false),
        });
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    /// Non-blocking push. Delivery is best-effort per session: a session
    /// that is gone or backed up never blocks fan-out to other sessions.
    pub fn push(&self, event: ServerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                if event.is_ephemeral() {
                    debug!(session = %self.id, "dropping ephemeral event for slow session");
                } else {
                    debug!(session = %self.id, "queue full on durable event, marking for resync");
                    self.needs_resync.store(true, Ordering::Release);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Receiver gone; the registry entry is cleaned up by the
                // transport loop on exit.
            }
        }
    }

    /// True once a durable event was lost to queue overflow; the transport
    /// should tell the client to reconnect and backfill.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::Acquire)
    }
}

type Shard = RwLock<HashMap<UserId, HashMap<SessionId, Arc<SessionHandle>>>>;

/// Maps user identity to their currently connected sessions (multi-device:
/// several sessions per user are normal).
pub struct SessionRegistry {
    shards: Vec<Shard>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard(&self, user: UserId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        user.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    pub async fn register(&self, handle: Arc<SessionHandle>) {
        let user = handle.user();
        let mut shard = self.shard(user).write().await;
        let sessions = shard.entry(user).or_default();
        sessions.insert(handle.id(), handle.clone());

        debug!(
            user = %user.short(),
            session = %handle.id(),
            sessions = sessions.len(),
            "registered session"
        );
    }

    pub async fn unregister(&self, user: UserId, session: SessionId) {
        let mut shard = self.shard(user).write().await;
        if let Some(sessions) = shard.get_mut(&user) {
            sessions.remove(&session);
            if sessions.is_empty() {
                shard.remove(&user);
            }
            debug!(user = %user.short(), session = %session, "unregistered session");
        }
    }

    /// Snapshot of a user's live sessions. Empty when fully offline.
    pub async fn sessions_for(&self, user: UserId) -> Vec<Arc<SessionHandle>> {
        let shard = self.shard(user).read().await;
        shard
            .get(&user)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_connected(&self, user: UserId) -> bool {
        let shard = self.shard(user).read().await;
        shard.get(&user).is_some_and(|s| !s.is_empty())
    }

    /// Total number of live sessions across all users.
    pub async fn session_count(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.read().await.values().map(HashMap::len).sum::<usize>();
        }
        count
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::types::ConversationId;

    #[tokio::test]
    async fn register_lookup_unregister() {
        let registry = SessionRegistry::new();
        let user = UserId::new();

        assert!(!registry.is_connected(user).await);

        let (handle, _rx) = SessionHandle::new(user);
        registry.register(handle.clone()).await;

        assert!(registry.is_connected(user).await);
        assert_eq!(registry.sessions_for(user).await.len(), 1);

        registry.unregister(user, handle.id()).await;
        assert!(!registry.is_connected(user).await);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn multiple_sessions_per_user() {
        let registry = SessionRegistry::new();
        let user = UserId::new();

        let (desktop, _rx1) = SessionHandle::new(user);
        let (mobile, _rx2) = SessionHandle::new(user);
        registry.register(desktop.clone()).await;
        registry.register(mobile.clone()).await;

        let sessions = registry.sessions_for(user).await;
        assert_eq!(sessions.len(), 2);

        registry.unregister(user, desktop.id()).await;
        assert_eq!(registry.sessions_for(user).await.len(), 1);
        assert!(registry.is_connected(user).await);
    }

    #[tokio::test]
    async fn push_delivers_to_receiver() {
        let user = UserId::new();
        let (handle, mut rx) = SessionHandle::new(user);

        handle.push(ServerEvent::ResyncRequired);
        assert_eq!(rx.recv().await, Some(ServerEvent::ResyncRequired));
    }

    #[tokio::test]
    async fn full_queue_drops_ephemeral_and_flags_durable() {
        let user = UserId::new();
        let (handle, _rx) = SessionHandle::new(user);

        // Fill the queue without draining it.
        for _ in 0..SESSION_QUEUE_DEPTH {
            handle.push(ServerEvent::ResyncRequired);
        }
        assert!(!handle.needs_resync());

        // Ephemeral overflow is dropped silently.
        handle.push(ServerEvent::Typing {
            conversation_id: ConversationId::new(),
            user,
            display_name: "ana".into(),
            is_typing: true,
        });
        assert!(!handle.needs_resync());

        // Durable overflow marks the session for resync.
        handle.push(ServerEvent::ResyncRequired);
        assert!(handle.needs_resync());
    }

    #[tokio::test]
    async fn push_to_closed_session_is_silent() {
        let user = UserId::new();
        let (handle, rx) = SessionHandle::new(user);
        drop(rx);

        handle.push(ServerEvent::ResyncRequired);
        assert!(!handle.needs_resync());
    }
}
