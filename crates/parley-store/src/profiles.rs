//! CRUD operations for [`Profile`] records.
//!
//! Profiles are provisioned by the external identity flow; the hub reads
//! them, bumps `last_active` on every heartbeat, and searches them for
//! roster building. Presence itself is never stored: it is derived from
//! `last_active` at query time.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use parley_shared::protocol::Profile;
use parley_shared::types::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Insert or replace a profile.
    pub fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        self.conn().execute(
            "INSERT INTO profiles (user_id, username, display_name, avatar_url, last_active)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url,
                last_active = excluded.last_active",
            params![
                profile.user_id.0.to_string(),
                profile.username,
                profile.display_name,
                profile.avatar_url,
                profile.last_active.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single profile.
    pub fn get_profile(&self, user: UserId) -> Result<Profile> {
        self.conn()
            .query_row(
                "SELECT user_id, username, display_name, avatar_url, last_active
                 FROM profiles WHERE user_id = ?1",
                params![user.0.to_string()],
                row_to_profile,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Bump a user's last-active timestamp.
    pub fn update_presence(&self, user: UserId, timestamp: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE profiles SET last_active = ?1 WHERE user_id = ?2",
            params![timestamp.to_rfc3339(), user.0.to_string()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Search profiles by username or display name prefix.
    ///
    /// `exclude` filters out the searching user (you never match yourself in
    /// a roster search).
    pub fn search_profiles(
        &self,
        term: &str,
        exclude: UserId,
        limit: u32,
    ) -> Result<Vec<Profile>> {
        let pattern = format!("{}%", term.replace('%', "").replace('_', ""));

        let mut stmt = self.conn().prepare(
            "SELECT user_id, username, display_name, avatar_url, last_active
             FROM profiles
             WHERE (username LIKE ?1 OR display_name LIKE ?1) AND user_id != ?2
             ORDER BY username ASC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(
            params![pattern, exclude.0.to_string(), limit],
            row_to_profile,
        )?;

        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?);
        }
        Ok(profiles)
    }
}

/// Map a `rusqlite::Row` to a [`Profile`].
fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let user_str: String = row.get(0)?;
    let username: String = row.get(1)?;
    let display_name: String = row.get(2)?;
    let avatar_url: Option<String> = row.get(3)?;
    let last_active_str: String = row.get(4)?;

    let user_id = Uuid::parse_str(&user_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let last_active: DateTime<Utc> = DateTime::parse_from_rfc3339(&last_active_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Profile {
        user_id: UserId(user_id),
        username,
        display_name,
        avatar_url,
        last_active,
    })
}
