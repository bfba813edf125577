//! CRUD operations for [`Message`] records.
//!
//! Messages are append-only per conversation: every append is assigned a
//! strictly increasing `seq` inside the same transaction, so backfill order
//! is identical for every reader. Deletes are tombstones (the row keeps its
//! id and seq, the payload is cleared) and edits only move `edited_at`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use parley_shared::protocol::{Message, MessagePayload};
use parley_shared::types::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Append a message to a conversation, assigning the next sequence
    /// number atomically.
    pub fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        payload: &MessagePayload,
    ) -> Result<Message> {
        let id = MessageId::new();
        let now = Utc::now();
        let payload_json = serde_json::to_string(payload)?;

        let tx = self.conn().unchecked_transaction()?;

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![conversation_id.0.to_string()],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender, seq, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.0.to_string(),
                conversation_id.0.to_string(),
                sender.0.to_string(),
                seq,
                payload_json,
                now.to_rfc3339(),
            ],
        )?;

        tx.commit()?;

        Ok(Message {
            id,
            conversation_id,
            sender,
            seq,
            payload: Some(payload.clone()),
            reactions: BTreeMap::new(),
            seen_by: BTreeSet::new(),
            created_at: now,
            edited_at: None,
            deleted: false,
        })
    }

    /// Fetch a single message by id, reactions and seen-state included.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let mut message = self
            .conn()
            .query_row(
                "SELECT id, conversation_id, sender, seq, payload, created_at, edited_at, deleted
                 FROM messages WHERE id = ?1",
                params![id.0.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        self.attach_decorations(&mut message)?;
        Ok(message)
    }

    /// Replace a message's text body and stamp `edited_at`.
    ///
    /// `created_at` and `seq` are never touched by an edit.
    pub fn edit_message(&self, id: MessageId, new_text: &str) -> Result<Message> {
        let payload_json = serde_json::to_string(&MessagePayload::Text(new_text.to_string()))?;
        let now = Utc::now();

        let affected = self.conn().execute(
            "UPDATE messages SET payload = ?1, edited_at = ?2
             WHERE id = ?3 AND deleted = 0",
            params![payload_json, now.to_rfc3339(), id.0.to_string()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        self.get_message(id)
    }

    /// Tombstone a message: the row keeps its id and seq (so the
    /// delete-broadcast can be correlated) but the payload is cleared.
    pub fn tombstone_message(&self, id: MessageId) -> Result<Message> {
        let affected = self.conn().execute(
            "UPDATE messages SET payload = NULL, deleted = 1 WHERE id = ?1",
            params![id.0.to_string()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        self.get_message(id)
    }

    /// List messages with `seq > since_seq`, ordered by seq ascending.
    ///
    /// This is the reconnect catch-up query; pass `since_seq = 0` for full
    /// history.
    pub fn list_messages_since(
        &self,
        conversation_id: ConversationId,
        since_seq: i64,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender, seq, payload, created_at, edited_at, deleted
             FROM messages
             WHERE conversation_id = ?1 AND seq > ?2
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(
            params![conversation_id.0.to_string(), since_seq],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            let mut message = row?;
            self.attach_decorations(&mut message)?;
            messages.push(message);
        }
        Ok(messages)
    }

    /// Load reactions and seen-state for a message already read from the
    /// `messages` table.
    fn attach_decorations(&self, message: &mut Message) -> Result<()> {
        let mut stmt = self.conn().prepare(
            "SELECT emoji, user_id FROM message_reactions
             WHERE message_id = ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![message.id.0.to_string()], |row| {
            let emoji: String = row.get(0)?;
            let user_str: String = row.get(1)?;
            Ok((emoji, user_str))
        })?;

        for row in rows {
            let (emoji, user_str) = row?;
            let user = UserId(Uuid::parse_str(&user_str)?);
            message.reactions.entry(emoji).or_default().insert(user);
        }

        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM message_seen WHERE message_id = ?1",
        )?;
        let rows = stmt.query_map(params![message.id.0.to_string()], |row| {
            let user_str: String = row.get(0)?;
            Ok(user_str)
        })?;

        for row in rows {
            message.seen_by.insert(UserId(Uuid::parse_str(&row?)?));
        }

        Ok(())
    }
}

/// Map a `rusqlite::Row` to a [`Message`] (reactions and seen-state are
/// attached separately).
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let seq: i64 = row.get(3)?;
    let payload_json: Option<String> = row.get(4)?;
    let created_str: String = row.get(5)?;
    let edited_str: Option<String> = row.get(6)?;
    let deleted: bool = row.get(7)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let conversation_id = Uuid::parse_str(&conversation_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sender = Uuid::parse_str(&sender_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let payload: Option<MessagePayload> = payload_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let edited_at: Option<DateTime<Utc>> = edited_str
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender: UserId(sender),
        seq,
        payload,
        reactions: BTreeMap::new(),
        seen_by: BTreeSet::new(),
        created_at,
        edited_at,
        deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::protocol::Conversation;

    fn test_db_with_conversation() -> (Database, tempfile::TempDir, ConversationId, UserId, UserId)
    {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();

        let (a, b) = (UserId::new(), UserId::new());
        let conv = Conversation {
            id: ConversationId::new(),
            name: None,
            is_group: false,
            members: vec![a, b],
            created_at: Utc::now(),
        };
        db.create_conversation(&conv).unwrap();
        (db, dir, conv.id, a, b)
    }

    #[test]
    fn append_assigns_increasing_seq() {
        let (db, _dir, conv, a, _b) = test_db_with_conversation();

        let m1 = db
            .append_message(conv, a, &MessagePayload::Text("one".into()))
            .unwrap();
        let m2 = db
            .append_message(conv, a, &MessagePayload::Text("two".into()))
            .unwrap();

        assert_eq!(m1.seq, 1);
        assert_eq!(m2.seq, 2);
    }

    #[test]
    fn seq_is_independent_across_conversations() {
        let (db, _dir, conv, a, b) = test_db_with_conversation();
        let other = Conversation {
            id: ConversationId::new(),
            name: None,
            is_group: false,
            members: vec![a, b],
            created_at: Utc::now(),
        };
        db.create_conversation(&other).unwrap();

        db.append_message(conv, a, &MessagePayload::Text("x".into()))
            .unwrap();
        let first_in_other = db
            .append_message(other.id, a, &MessagePayload::Text("y".into()))
            .unwrap();

        assert_eq!(first_in_other.seq, 1);
    }

    #[test]
    fn backfill_is_ordered_and_filtered() {
        let (db, _dir, conv, a, _b) = test_db_with_conversation();
        for i in 0..5 {
            db.append_message(conv, a, &MessagePayload::Text(format!("m{i}")))
                .unwrap();
        }

        let all = db.list_messages_since(conv, 0).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));

        let tail = db.list_messages_since(conv, 3).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 4);
    }

    #[test]
    fn edit_preserves_created_at() {
        let (db, _dir, conv, a, _b) = test_db_with_conversation();
        let original = db
            .append_message(conv, a, &MessagePayload::Text("typo".into()))
            .unwrap();

        let edited = db.edit_message(original.id, "fixed").unwrap();
        assert_eq!(edited.created_at, original.created_at);
        assert_eq!(edited.payload, Some(MessagePayload::Text("fixed".into())));
        assert!(edited.edited_at.is_some());
        assert_eq!(edited.seq, original.seq);
    }

    #[test]
    fn tombstone_clears_payload_keeps_id() {
        let (db, _dir, conv, a, _b) = test_db_with_conversation();
        let msg = db
            .append_message(conv, a, &MessagePayload::Text("gone".into()))
            .unwrap();

        let deleted = db.tombstone_message(msg.id).unwrap();
        assert!(deleted.deleted);
        assert!(deleted.payload.is_none());
        assert_eq!(deleted.id, msg.id);
        assert_eq!(deleted.seq, msg.seq);

        // Deleted messages cannot be edited.
        assert!(matches!(
            db.edit_message(msg.id, "resurrect"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn image_payload_roundtrip() {
        let (db, _dir, conv, a, _b) = test_db_with_conversation();
        let payload = MessagePayload::Image {
            url: "blob/abc".into(),
            content_type: "image/png".into(),
            size_bytes: 1024,
        };

        let msg = db.append_message(conv, a, &payload).unwrap();
        let fetched = db.get_message(msg.id).unwrap();
        assert_eq!(fetched.payload, Some(payload));
    }
}
