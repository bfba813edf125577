use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CallId, ConversationId, MessageId};

/// Error taxonomy for hub command submission.
///
/// Validation errors are surfaced synchronously to the submitting session
/// and are never broadcast. The enum is serializable so it can travel back
/// over the transport as a rejected-command event.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubError {
    #[error("Not a member of this conversation")]
    NotMember,

    #[error("Not the owner of this message")]
    NotOwner,

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid payload content type: {0}")]
    InvalidPayloadType(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Invalid credentials")]
    AuthInvalid,

    /// Benign race on call signaling: a call that was already accepted,
    /// declined, ended, or expired. Swallowed by the router, never surfaced.
    #[error("Call already resolved: {0}")]
    AlreadyResolved(CallId),

    /// Persistence gateway down after bounded retries. The durable write was
    /// not committed and nothing was broadcast.
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),
}

/// Convenience alias used throughout the hub.
pub type HubResult<T> = std::result::Result<T, HubError>;
