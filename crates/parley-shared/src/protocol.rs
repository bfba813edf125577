use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::types::{CallId, ConversationId, MessageId, UserId};

/// Message content. Exactly one variant per message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessagePayload {
    /// Plain text body.
    Text(String),

    /// Reference to an image blob already uploaded to the blob store.
    Image {
        url: String,
        content_type: String,
        size_bytes: u64,
    },

    /// Free-form call metadata rendered inline (e.g. "missed call, 2:31").
    CallInfo(String),
}

/// A single chat message as stored and as broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    /// Strictly increasing per conversation, assigned at append time.
    /// Broadcast order equals `seq` order within one conversation.
    pub seq: i64,
    /// `None` once the message has been deleted (tombstone keeps the row).
    pub payload: Option<MessagePayload>,
    /// Emoji -> users who applied it.
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    /// Users who have marked this message seen. Never implicitly contains
    /// the sender.
    pub seen_by: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

/// A conversation between two or more users. Membership is fixed at
/// creation; there is no add/remove-member flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    /// Display name, used for group chats.
    pub name: Option<String>,
    pub is_group: bool,
    pub members: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

/// A user profile. Created by the external provisioning flow; the hub only
/// reads it and bumps `last_active`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub last_active: DateTime<Utc>,
}

/// Commands a client session submits to the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientCommand {
    SendMessage {
        conversation_id: ConversationId,
        payload: MessagePayload,
    },
    EditMessage {
        message_id: MessageId,
        new_text: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    ToggleReaction {
        message_id: MessageId,
        emoji: String,
    },
    /// Mark every message with `seq <= up_to` in the conversation as seen.
    MarkSeen {
        conversation_id: ConversationId,
        up_to: i64,
    },
    TypingPing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    InviteCall {
        conversation_id: ConversationId,
        /// Opaque media-room reference handed to call participants.
        room: String,
    },
    AcceptCall {
        call_id: CallId,
    },
    DeclineCall {
        call_id: CallId,
    },
    EndCall {
        call_id: CallId,
    },
    /// Reconnect catch-up: fetch messages with `seq > since_seq`, then
    /// resume the live stream.
    Resync {
        conversation_id: ConversationId,
        since_seq: i64,
    },
}

/// Events pushed from the hub to client sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerEvent {
    ConversationCreated {
        conversation: Conversation,
    },
    MessageCreated {
        message: Message,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        seq: i64,
    },
    ReactionToggled {
        conversation_id: ConversationId,
        message_id: MessageId,
        user: UserId,
        emoji: String,
        /// true when the toggle added the reaction, false when it removed it.
        added: bool,
    },
    SeenUpdated {
        conversation_id: ConversationId,
        user: UserId,
        up_to: i64,
    },
    Typing {
        conversation_id: ConversationId,
        user: UserId,
        display_name: String,
        is_typing: bool,
    },
    /// Reply to the inviting session: the call id to signal against.
    CallInvited {
        call_id: CallId,
        conversation_id: ConversationId,
    },
    IncomingCall {
        call_id: CallId,
        conversation_id: ConversationId,
        room: String,
        caller: Profile,
    },
    /// Notification-only: an invite expired without a response.
    MissedCall {
        call_id: CallId,
        conversation_id: ConversationId,
        caller: Profile,
    },
    CallAccepted {
        call_id: CallId,
        conversation_id: ConversationId,
        by: UserId,
    },
    CallEnded {
        call_id: CallId,
        conversation_id: ConversationId,
    },
    /// Reconnect catch-up response, ordered by `seq` ascending.
    Backfill {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    /// A submitted command was rejected. Sent only to the submitting session.
    CommandRejected {
        error: HubError,
    },
    /// The session's outbound queue overflowed on a durable event; the
    /// client must reconnect and backfill.
    ResyncRequired,
}

impl ServerEvent {
    /// Ephemeral events may be dropped when a session's outbound queue is
    /// full; durable events instead mark the session for reconnect-resync.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, ServerEvent::Typing { .. })
    }
}

impl ClientCommand {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl ServerEvent {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
