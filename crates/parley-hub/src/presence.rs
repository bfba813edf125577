//! Presence tracking with lazy staleness evaluation.
//!
//! A user is online iff their last activity is within the 5-minute window.
//! There is no background sweep: staleness is computed at query time, and
//! the in-memory cache is write-through to the gateway so a restarted hub
//! simply re-learns activity from heartbeats.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use parley_shared::constants::PRESENCE_WINDOW_SECS;
use parley_shared::error::HubResult;
use parley_shared::types::UserId;

use crate::gateway::Gateway;

pub struct PresenceTracker {
    gateway: Arc<dyn Gateway>,
    last_active: RwLock<HashMap<UserId, DateTime<Utc>>>,
}

impl PresenceTracker {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            last_active: RwLock::new(HashMap::new()),
        }
    }

    /// Record activity for a user: cache update plus durable write.
    ///
    /// Called on every user-initiated action and on the client's periodic
    /// ping.
    pub async fn heartbeat(&self, user: UserId) -> HubResult<()> {
        let now = Utc::now();
        self.last_active.write().await.insert(user, now);
        self.gateway.update_presence(user, now).await
    }

    /// Computed, not stored: online iff last activity is inside the window.
    pub async fn is_online(&self, user: UserId) -> bool {
        let cached = self.last_active.read().await.get(&user).copied();

        let last_active = match cached {
            Some(ts) => ts,
            None => match self.gateway.get_profile(user).await {
                Ok(profile) => {
                    self.last_active
                        .write()
                        .await
                        .insert(user, profile.last_active);
                    profile.last_active
                }
                Err(e) => {
                    debug!(user = %user.short(), error = %e, "presence lookup failed");
                    return false;
                }
            },
        };

        Utc::now() - last_active <= Duration::seconds(PRESENCE_WINDOW_SECS)
    }

    /// Batch query used when rendering a roster.
    pub async fn online_set(&self, users: &[UserId]) -> HashSet<UserId> {
        let mut online = HashSet::new();
        for &user in users {
            if self.is_online(user).await {
                online.insert(user);
            }
        }
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_shared::protocol::Profile;
    use parley_store::Database;

    use crate::gateway::SqliteGateway;

    fn profile(user: UserId, last_active: DateTime<Utc>) -> Profile {
        Profile {
            user_id: user,
            username: user.short(),
            display_name: user.short(),
            avatar_url: None,
            last_active,
        }
    }

    async fn tracker_with_db() -> (PresenceTracker, Arc<SqliteGateway>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let gateway = Arc::new(SqliteGateway::new(db));
        (PresenceTracker::new(gateway.clone()), gateway, dir)
    }

    #[tokio::test]
    async fn heartbeat_makes_user_online() {
        let (tracker, gateway, _dir) = tracker_with_db().await;
        let user = UserId::new();
        gateway
            .upsert_profile(&profile(user, Utc::now() - Duration::hours(1)))
            .await
            .unwrap();

        assert!(!tracker.is_online(user).await);
        tracker.heartbeat(user).await.unwrap();
        assert!(tracker.is_online(user).await);
    }

    #[tokio::test]
    async fn stale_profile_is_offline_without_sweep() {
        let (tracker, gateway, _dir) = tracker_with_db().await;
        let user = UserId::new();
        gateway
            .upsert_profile(&profile(user, Utc::now() - Duration::minutes(6)))
            .await
            .unwrap();

        assert!(!tracker.is_online(user).await);
    }

    #[tokio::test]
    async fn fresh_profile_is_online_from_cold_cache() {
        let (tracker, gateway, _dir) = tracker_with_db().await;
        let user = UserId::new();
        gateway
            .upsert_profile(&profile(user, Utc::now() - Duration::minutes(1)))
            .await
            .unwrap();

        assert!(tracker.is_online(user).await);
    }

    #[tokio::test]
    async fn unknown_user_is_offline() {
        let (tracker, _gateway, _dir) = tracker_with_db().await;
        assert!(!tracker.is_online(UserId::new()).await);
    }

    #[tokio::test]
    async fn online_set_filters() {
        let (tracker, gateway, _dir) = tracker_with_db().await;
        let fresh = UserId::new();
        let stale = UserId::new();
        gateway
            .upsert_profile(&profile(fresh, Utc::now()))
            .await
            .unwrap();
        gateway
            .upsert_profile(&profile(stale, Utc::now() - Duration::minutes(10)))
            .await
            .unwrap();

        let online = tracker.online_set(&[fresh, stale, UserId::new()]).await;
        assert_eq!(online, HashSet::from([fresh]));
    }
}
