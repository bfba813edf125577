//! The conversation hub: validate, persist, broadcast.
//!
//! Every durable event is written through the gateway *before* it is
//! broadcast, so a client that reconnects and backfills can never observe an
//! event that was announced but not persisted. Within one conversation all
//! durable writes are serialized behind a per-conversation lock and fanned
//! out while that lock is held, so broadcast order equals commit order.
//! Different conversations never share a lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use parley_shared::constants::{IMAGE_CONTENT_TYPES, MAX_IMAGE_SIZE, MAX_TEXT_SIZE};
use parley_shared::error::{HubError, HubResult};
use parley_shared::protocol::{
    ClientCommand, Conversation, Message, MessagePayload, ServerEvent,
};
use parley_shared::types::{ConversationId, MessageId, UserId};

use crate::calls::CallRouter;
use crate::gateway::{with_retry, Gateway};
use crate::notify::PushNotifier;
use crate::presence::PresenceTracker;
use crate::sessions::SessionRegistry;

pub struct ConversationHub {
    gateway: Arc<dyn Gateway>,
    sessions: Arc<SessionRegistry>,
    presence: Arc<PresenceTracker>,
    notifier: Arc<dyn PushNotifier>,
    calls: Arc<CallRouter>,
    /// One write lock per conversation; never shared across conversations.
    write_locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl ConversationHub {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        sessions: Arc<SessionRegistry>,
        presence: Arc<PresenceTracker>,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        let calls = Arc::new(CallRouter::new(
            gateway.clone(),
            sessions.clone(),
            notifier.clone(),
        ));
        Self {
            gateway,
            sessions,
            presence,
            notifier,
            calls,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn calls(&self) -> &Arc<CallRouter> {
        &self.calls
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// Submit an authenticated command.
    ///
    /// `acting` is a verified identity from the auth boundary; every
    /// membership and ownership check trusts it. Returns an optional direct
    /// reply for the submitting session (backfill data, call id);
    /// conversation-wide effects are broadcast internally.
    pub async fn submit(
        &self,
        cmd: ClientCommand,
        acting: UserId,
    ) -> HubResult<Option<ServerEvent>> {
        // Every user-initiated action counts as activity.
        if let Err(e) = self.presence.heartbeat(acting).await {
            debug!(user = %acting.short(), error = %e, "presence heartbeat failed");
        }

        match cmd {
            ClientCommand::SendMessage {
                conversation_id,
                payload,
            } => {
                self.send_message(acting, conversation_id, payload).await?;
                Ok(None)
            }
            ClientCommand::EditMessage {
                message_id,
                new_text,
            } => {
                self.edit_message(acting, message_id, &new_text).await?;
                Ok(None)
            }
            ClientCommand::DeleteMessage { message_id } => {
                self.delete_message(acting, message_id).await?;
                Ok(None)
            }
            ClientCommand::ToggleReaction { message_id, emoji } => {
                self.toggle_reaction(acting, message_id, &emoji).await?;
                Ok(None)
            }
            ClientCommand::MarkSeen {
                conversation_id,
                up_to,
            } => {
                self.mark_seen(acting, conversation_id, up_to).await?;
                Ok(None)
            }
            ClientCommand::TypingPing {
                conversation_id,
                is_typing,
            } => {
                self.typing(acting, conversation_id, is_typing).await?;
                Ok(None)
            }
            ClientCommand::InviteCall {
                conversation_id,
                room,
            } => {
                let call_id = self
                    .calls
                    .clone()
                    .invite(acting, conversation_id, room)
                    .await?;
                Ok(Some(ServerEvent::CallInvited {
                    call_id,
                    conversation_id,
                }))
            }
            ClientCommand::AcceptCall { call_id } => {
                self.calls.clone().accept(call_id, acting).await?;
                Ok(None)
            }
            ClientCommand::DeclineCall { call_id } => {
                self.calls.decline(call_id, acting).await?;
                Ok(None)
            }
            ClientCommand::EndCall { call_id } => {
                self.calls.end(call_id, acting).await?;
                Ok(None)
            }
            ClientCommand::Resync {
                conversation_id,
                since_seq,
            } => {
                let messages = self.backfill(acting, conversation_id, since_seq).await?;
                Ok(Some(ServerEvent::Backfill {
                    conversation_id,
                    messages,
                }))
            }
        }
    }

    /// Create a conversation. Membership is fixed from here on.
    pub async fn create_conversation(
        &self,
        acting: UserId,
        mut members: Vec<UserId>,
        name: Option<String>,
        is_group: bool,
    ) -> HubResult<Conversation> {
        if !members.contains(&acting) {
            members.push(acting);
        }
        members.sort_unstable();
        members.dedup();

        let conversation = Conversation {
            id: ConversationId::new(),
            name,
            is_group,
            members,
            created_at: chrono::Utc::now(),
        };

        with_retry("create_conversation", || {
            let g = self.gateway.clone();
            let c = conversation.clone();
            async move { g.create_conversation(&c).await }
        })
        .await?;

        info!(
            conversation = %conversation.id,
            members = conversation.members.len(),
            is_group,
            "conversation created"
        );

        self.fan_out(
            &conversation.members,
            acting,
            true,
            &ServerEvent::ConversationCreated {
                conversation: conversation.clone(),
            },
            None,
        )
        .await;

        Ok(conversation)
    }

    /// Reconnect catch-up: everything after `since_seq`, in commit order.
    pub async fn backfill(
        &self,
        acting: UserId,
        conversation_id: ConversationId,
        since_seq: i64,
    ) -> HubResult<Vec<Message>> {
        let conversation = self.gateway.get_conversation(conversation_id).await?;
        if !conversation.members.contains(&acting) {
            return Err(HubError::NotMember);
        }
        self.gateway
            .list_messages_since(conversation_id, since_seq)
            .await
    }

    async fn send_message(
        &self,
        acting: UserId,
        conversation_id: ConversationId,
        payload: MessagePayload,
    ) -> HubResult<()> {
        validate_payload(&payload)?;

        let conversation = self.gateway.get_conversation(conversation_id).await?;
        if !conversation.members.contains(&acting) {
            return Err(HubError::NotMember);
        }

        let lock = self.conversation_lock(conversation_id).await;
        let _ordering = lock.lock().await;

        let message = with_retry("append_message", || {
            let g = self.gateway.clone();
            let p = payload.clone();
            async move { g.append_message(conversation_id, acting, &p).await }
        })
        .await?;

        info!(
            conversation = %conversation_id,
            message = %message.id,
            seq = message.seq,
            sender = %acting.short(),
            "message persisted"
        );

        let body = self.display_name_of(acting).await;
        self.fan_out(
            &conversation.members,
            acting,
            true,
            &ServerEvent::MessageCreated {
                message: message.clone(),
            },
            Some(("New message", body)),
        )
        .await;

        Ok(())
    }

    async fn edit_message(
        &self,
        acting: UserId,
        message_id: MessageId,
        new_text: &str,
    ) -> HubResult<()> {
        if new_text.len() > MAX_TEXT_SIZE {
            return Err(HubError::PayloadTooLarge {
                size: new_text.len(),
                max: MAX_TEXT_SIZE,
            });
        }

        let message = self.gateway.get_message(message_id).await?;
        if message.sender != acting {
            return Err(HubError::NotOwner);
        }
        if message.deleted {
            return Err(HubError::MessageNotFound(message_id));
        }

        let conversation = self.gateway.get_conversation(message.conversation_id).await?;

        let lock = self.conversation_lock(message.conversation_id).await;
        let _ordering = lock.lock().await;

        let updated = with_retry("edit_message", || {
            let g = self.gateway.clone();
            let text = new_text.to_string();
            async move { g.edit_message(message_id, &text).await }
        })
        .await?;

        self.fan_out(
            &conversation.members,
            acting,
            true,
            &ServerEvent::MessageEdited { message: updated },
            None,
        )
        .await;

        Ok(())
    }

    async fn delete_message(&self, acting: UserId, message_id: MessageId) -> HubResult<()> {
        let message = self.gateway.get_message(message_id).await?;
        if message.sender != acting {
            return Err(HubError::NotOwner);
        }

        let conversation = self.gateway.get_conversation(message.conversation_id).await?;

        let lock = self.conversation_lock(message.conversation_id).await;
        let _ordering = lock.lock().await;

        let tombstone = with_retry("delete_message", || {
            let g = self.gateway.clone();
            async move { g.delete_message(message_id).await }
        })
        .await?;

        self.fan_out(
            &conversation.members,
            acting,
            true,
            &ServerEvent::MessageDeleted {
                conversation_id: tombstone.conversation_id,
                message_id: tombstone.id,
                seq: tombstone.seq,
            },
            None,
        )
        .await;

        Ok(())
    }

    async fn toggle_reaction(
        &self,
        acting: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> HubResult<()> {
        let message = self.gateway.get_message(message_id).await?;
        let conversation = self.gateway.get_conversation(message.conversation_id).await?;
        if !conversation.members.contains(&acting) {
            return Err(HubError::NotMember);
        }

        let lock = self.conversation_lock(message.conversation_id).await;
        let _ordering = lock.lock().await;

        let added = with_retry("toggle_reaction", || {
            let g = self.gateway.clone();
            let e = emoji.to_string();
            async move { g.toggle_reaction(message_id, acting, &e).await }
        })
        .await?;

        self.fan_out(
            &conversation.members,
            acting,
            true,
            &ServerEvent::ReactionToggled {
                conversation_id: message.conversation_id,
                message_id,
                user: acting,
                emoji: emoji.to_string(),
                added,
            },
            None,
        )
        .await;

        Ok(())
    }

    async fn mark_seen(
        &self,
        acting: UserId,
        conversation_id: ConversationId,
        up_to: i64,
    ) -> HubResult<()> {
        let conversation = self.gateway.get_conversation(conversation_id).await?;
        if !conversation.members.contains(&acting) {
            return Err(HubError::NotMember);
        }

        let lock = self.conversation_lock(conversation_id).await;
        let _ordering = lock.lock().await;

        let marked = with_retry("mark_seen", || {
            let g = self.gateway.clone();
            async move { g.mark_seen(conversation_id, acting, up_to).await }
        })
        .await?;

        // Monotonic: a repeat call marks nothing and broadcasts nothing.
        if marked > 0 {
            self.fan_out(
                &conversation.members,
                acting,
                true,
                &ServerEvent::SeenUpdated {
                    conversation_id,
                    user: acting,
                    up_to,
                },
                None,
            )
            .await;
        }

        Ok(())
    }

    /// Typing pings skip persistence entirely and never reach the sender's
    /// own sessions.
    async fn typing(
        &self,
        acting: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> HubResult<()> {
        let conversation = self.gateway.get_conversation(conversation_id).await?;
        if !conversation.members.contains(&acting) {
            return Err(HubError::NotMember);
        }

        let display_name = self.display_name_of(acting).await;
        self.fan_out(
            &conversation.members,
            acting,
            false,
            &ServerEvent::Typing {
                conversation_id,
                user: acting,
                display_name,
                is_typing,
            },
            None,
        )
        .await;

        Ok(())
    }

    /// Push an event to every session of every member.
    ///
    /// Per-session best effort: dead or slow sessions never block the rest.
    /// Members with no sessions at all get a push notification when one is
    /// provided (never the acting user).
    async fn fan_out(
        &self,
        members: &[UserId],
        acting: UserId,
        include_actor: bool,
        event: &ServerEvent,
        notify: Option<(&str, String)>,
    ) {
        for &member in members {
            if member == acting && !include_actor {
                continue;
            }

            let sessions = self.sessions.sessions_for(member).await;
            if sessions.is_empty() {
                if member != acting {
                    if let Some((title, body)) = &notify {
                        self.notifier.notify(member, title, body).await;
                    }
                }
                continue;
            }

            for session in sessions {
                session.push(event.clone());
            }
        }
    }

    async fn conversation_lock(&self, id: ConversationId) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        // An in-flight write holds a clone of its lock, so a strong count of
        // one means nobody is using the entry and it can go.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(id).or_default().clone()
    }

    async fn display_name_of(&self, user: UserId) -> String {
        match self.gateway.get_profile(user).await {
            Ok(profile) => profile.display_name,
            Err(_) => user.short(),
        }
    }
}

/// Payload validation shared by the send path.
fn validate_payload(payload: &MessagePayload) -> HubResult<()> {
    match payload {
        MessagePayload::Text(text) => {
            if text.len() > MAX_TEXT_SIZE {
                return Err(HubError::PayloadTooLarge {
                    size: text.len(),
                    max: MAX_TEXT_SIZE,
                });
            }
        }
        MessagePayload::Image {
            content_type,
            size_bytes,
            ..
        } => {
            if !IMAGE_CONTENT_TYPES.contains(&content_type.as_str()) {
                return Err(HubError::InvalidPayloadType(content_type.clone()));
            }
            if *size_bytes as usize > MAX_IMAGE_SIZE {
                return Err(HubError::PayloadTooLarge {
                    size: *size_bytes as usize,
                    max: MAX_IMAGE_SIZE,
                });
            }
        }
        MessagePayload::CallInfo(_) => {}
    }
    Ok(())
}
