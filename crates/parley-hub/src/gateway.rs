//! Persistence Gateway boundary.
//!
//! The hub treats durable storage as an opaque collaborator that owns all
//! transactional discipline; per-conversation ordering is the hub's job, not
//! the gateway's. [`SqliteGateway`] adapts the synchronous `parley-store`
//! database; anything that can speak this trait (a remote store, a test
//! double) slots in the same way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use parley_shared::error::{HubError, HubResult};
use parley_shared::protocol::{Conversation, Message, MessagePayload, Profile};
use parley_shared::types::{ConversationId, MessageId, UserId};
use parley_store::{Database, StoreError};

/// Durable-write retry policy: attempts and initial backoff. The delay
/// doubles after every failed attempt.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Collaborator contract for durable storage.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    async fn create_conversation(&self, conversation: &Conversation) -> HubResult<()>;
    async fn get_conversation(&self, id: ConversationId) -> HubResult<Conversation>;
    async fn list_conversations_for(&self, user: UserId) -> HubResult<Vec<Conversation>>;

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        payload: &MessagePayload,
    ) -> HubResult<Message>;
    async fn get_message(&self, id: MessageId) -> HubResult<Message>;
    async fn edit_message(&self, id: MessageId, new_text: &str) -> HubResult<Message>;
    async fn delete_message(&self, id: MessageId) -> HubResult<Message>;
    async fn list_messages_since(
        &self,
        conversation_id: ConversationId,
        since_seq: i64,
    ) -> HubResult<Vec<Message>>;

    /// Atomic toggle; returns true when the reaction was added.
    async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user: UserId,
        emoji: &str,
    ) -> HubResult<bool>;

    /// Monotonic; returns the number of newly marked messages.
    async fn mark_seen(
        &self,
        conversation_id: ConversationId,
        user: UserId,
        up_to: i64,
    ) -> HubResult<usize>;

    async fn get_profile(&self, user: UserId) -> HubResult<Profile>;
    /// Provisioning write-through; profile identity itself is issued
    /// externally.
    async fn upsert_profile(&self, profile: &Profile) -> HubResult<()>;
    async fn update_presence(&self, user: UserId, timestamp: DateTime<Utc>) -> HubResult<()>;
    async fn search_profiles(
        &self,
        term: &str,
        exclude: UserId,
        limit: u32,
    ) -> HubResult<Vec<Profile>>;
}

/// Retry a durable write with bounded exponential backoff.
///
/// Only [`HubError::PersistenceUnavailable`] is retried; validation errors
/// pass through untouched. When retries exhaust, the last error is returned
/// and the caller must not broadcast.
pub async fn with_retry<T, F, Fut>(op: &str, mut f: F) -> HubResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = HubResult<T>>,
{
    let mut delay = WRITE_BACKOFF;
    let mut attempt = 1;
    loop {
        match f().await {
            Err(HubError::PersistenceUnavailable(detail)) if attempt < WRITE_ATTEMPTS => {
                warn!(op, attempt, error = %detail, "durable write failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// [`Gateway`] implementation over the local SQLite store.
///
/// The connection is serialized behind an async mutex; SQLite is the
/// linearization point for rows, the hub's per-conversation locks are the
/// linearization point for broadcast order.
pub struct SqliteGateway {
    db: Arc<Mutex<Database>>,
}

impl SqliteGateway {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }
}

/// Store errors that mean "the row you named does not exist" keep their
/// identity; everything else surfaces as a gateway outage.
fn store_err(e: StoreError, not_found: HubError) -> HubError {
    match e {
        StoreError::NotFound => not_found,
        other => HubError::PersistenceUnavailable(other.to_string()),
    }
}

#[async_trait]
impl Gateway for SqliteGateway {
    async fn create_conversation(&self, conversation: &Conversation) -> HubResult<()> {
        self.db
            .lock()
            .await
            .create_conversation(conversation)
            .map_err(|e| HubError::PersistenceUnavailable(e.to_string()))
    }

    async fn get_conversation(&self, id: ConversationId) -> HubResult<Conversation> {
        self.db
            .lock()
            .await
            .get_conversation(id)
            .map_err(|e| store_err(e, HubError::ConversationNotFound(id)))
    }

    async fn list_conversations_for(&self, user: UserId) -> HubResult<Vec<Conversation>> {
        self.db
            .lock()
            .await
            .list_conversations_for_user(user)
            .map_err(|e| HubError::PersistenceUnavailable(e.to_string()))
    }

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        payload: &MessagePayload,
    ) -> HubResult<Message> {
        self.db
            .lock()
            .await
            .append_message(conversation_id, sender, payload)
            .map_err(|e| HubError::PersistenceUnavailable(e.to_string()))
    }

    async fn get_message(&self, id: MessageId) -> HubResult<Message> {
        self.db
            .lock()
            .await
            .get_message(id)
            .map_err(|e| store_err(e, HubError::MessageNotFound(id)))
    }

    async fn edit_message(&self, id: MessageId, new_text: &str) -> HubResult<Message> {
        self.db
            .lock()
            .await
            .edit_message(id, new_text)
            .map_err(|e| store_err(e, HubError::MessageNotFound(id)))
    }

    async fn delete_message(&self, id: MessageId) -> HubResult<Message> {
        self.db
            .lock()
            .await
            .tombstone_message(id)
            .map_err(|e| store_err(e, HubError::MessageNotFound(id)))
    }

    async fn list_messages_since(
        &self,
        conversation_id: ConversationId,
        since_seq: i64,
    ) -> HubResult<Vec<Message>> {
        self.db
            .lock()
            .await
            .list_messages_since(conversation_id, since_seq)
            .map_err(|e| HubError::PersistenceUnavailable(e.to_string()))
    }

    async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user: UserId,
        emoji: &str,
    ) -> HubResult<bool> {
        self.db
            .lock()
            .await
            .toggle_reaction(message_id, user, emoji)
            .map_err(|e| store_err(e, HubError::MessageNotFound(message_id)))
    }

    async fn mark_seen(
        &self,
        conversation_id: ConversationId,
        user: UserId,
        up_to: i64,
    ) -> HubResult<usize> {
        self.db
            .lock()
            .await
            .mark_seen(conversation_id, user, up_to)
            .map_err(|e| HubError::PersistenceUnavailable(e.to_string()))
    }

    async fn get_profile(&self, user: UserId) -> HubResult<Profile> {
        self.db
            .lock()
            .await
            .get_profile(user)
            .map_err(|e| store_err(e, HubError::AuthInvalid))
    }

    async fn upsert_profile(&self, profile: &Profile) -> HubResult<()> {
        self.db
            .lock()
            .await
            .upsert_profile(profile)
            .map_err(|e| HubError::PersistenceUnavailable(e.to_string()))
    }

    async fn update_presence(&self, user: UserId, timestamp: DateTime<Utc>) -> HubResult<()> {
        self.db
            .lock()
            .await
            .update_presence(user, timestamp)
            .map_err(|e| store_err(e, HubError::AuthInvalid))
    }

    async fn search_profiles(
        &self,
        term: &str,
        exclude: UserId,
        limit: u32,
    ) -> HubResult<Vec<Profile>> {
        self.db
            .lock()
            .await
            .search_profiles(term, exclude, limit)
            .map_err(|e| HubError::PersistenceUnavailable(e.to_string()))
    }
}
