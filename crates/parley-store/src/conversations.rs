//! CRUD operations for [`Conversation`] records and their member sets.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::protocol::Conversation;
use parley_shared::types::{ConversationId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Insert a new conversation together with its member set, atomically.
    ///
    /// Membership is fixed at creation: a direct conversation must have
    /// exactly 2 members, a group at least 2.
    pub fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        let count = conversation.members.len();
        if (!conversation.is_group && count != 2) || count < 2 {
            return Err(StoreError::InvalidMemberCount(count));
        }

        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO conversations (id, name, is_group, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation.id.0.to_string(),
                conversation.name,
                conversation.is_group,
                conversation.created_at.to_rfc3339(),
            ],
        )?;

        for member in &conversation.members {
            tx.execute(
                "INSERT INTO conversation_members (conversation_id, user_id)
                 VALUES (?1, ?2)",
                params![conversation.id.0.to_string(), member.0.to_string()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch a single conversation, members included.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        let (name, is_group, created_at) = self
            .conn()
            .query_row(
                "SELECT name, is_group, created_at FROM conversations WHERE id = ?1",
                params![id.0.to_string()],
                |row| {
                    let name: Option<String> = row.get(0)?;
                    let is_group: bool = row.get(1)?;
                    let created_str: String = row.get(2)?;
                    Ok((name, is_group, created_str))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        let created_at: DateTime<Utc> =
            DateTime::parse_from_rfc3339(&created_at).map(|dt| dt.with_timezone(&Utc))?;

        Ok(Conversation {
            id,
            name,
            is_group,
            members: self.members_of(id)?,
            created_at,
        })
    }

    /// List the member user ids of a conversation.
    pub fn members_of(&self, id: ConversationId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM conversation_members
             WHERE conversation_id = ?1
             ORDER BY user_id ASC",
        )?;

        let rows = stmt.query_map(params![id.0.to_string()], |row| {
            let user_str: String = row.get(0)?;
            Ok(user_str)
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(UserId(uuid::Uuid::parse_str(&row?)?));
        }
        Ok(members)
    }

    /// Check whether a user belongs to a conversation.
    pub fn is_member(&self, id: ConversationId, user: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM conversation_members
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![id.0.to_string(), user.0.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List every conversation a user belongs to, newest first.
    pub fn list_conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id FROM conversations c
             JOIN conversation_members m ON m.conversation_id = c.id
             WHERE m.user_id = ?1
             ORDER BY c.created_at DESC",
        )?;

        let rows = stmt.query_map(params![user.0.to_string()], |row| {
            let id_str: String = row.get(0)?;
            Ok(id_str)
        })?;

        let mut conversations = Vec::new();
        for row in rows {
            let id = ConversationId(uuid::Uuid::parse_str(&row?)?);
            conversations.push(self.get_conversation(id)?);
        }
        Ok(conversations)
    }
}
