//! Reaction toggling and seen-state updates.
//!
//! Both operations are single atomic statements at the gateway boundary so
//! concurrent clients never race a read-modify-write: toggling is a
//! conditional delete-or-insert, and seen-state is insert-or-ignore.

use chrono::Utc;
use rusqlite::params;

use parley_shared::types::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Toggle a (user, emoji) reaction on a message.
    ///
    /// Returns `true` when the toggle added the reaction, `false` when it
    /// removed it. Applying the same toggle twice is an involution.
    pub fn toggle_reaction(
        &self,
        message_id: MessageId,
        user: UserId,
        emoji: &str,
    ) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;

        let removed = tx.execute(
            "DELETE FROM message_reactions
             WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            params![message_id.0.to_string(), user.0.to_string(), emoji],
        )?;

        let added = removed == 0;
        if added {
            tx.execute(
                "INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message_id.0.to_string(),
                    user.0.to_string(),
                    emoji,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(added)
    }

    /// Mark every message in the conversation with `seq <= up_to` as seen by
    /// `user`, excluding the user's own messages.
    ///
    /// Monotonic: existing rows are never removed, repeated calls are no-ops.
    /// Returns the number of newly marked messages.
    pub fn mark_seen(
        &self,
        conversation_id: ConversationId,
        user: UserId,
        up_to: i64,
    ) -> Result<usize> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO message_seen (message_id, user_id)
             SELECT id, ?2 FROM messages
             WHERE conversation_id = ?1 AND seq <= ?3 AND sender != ?2",
            params![conversation_id.0.to_string(), user.0.to_string(), up_to],
        )?;
        Ok(affected)
    }
}
