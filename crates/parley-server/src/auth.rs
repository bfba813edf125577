//! Session token authentication.
//!
//! Identity is issued by the external account/provisioning flow; this layer
//! only maps opaque bearer tokens to verified user ids for the lifetime of
//! the process. Tokens are random UUIDs and comparison is constant-time.

use std::collections::HashMap;

use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use parley_shared::types::UserId;

pub struct Authenticator {
    tokens: RwLock<HashMap<UserId, String>>,
}

impl Authenticator {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a fresh token for a user, replacing any previous one.
    pub async fn issue(&self, user: UserId) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.tokens.write().await.insert(user, token.clone());
        debug!(user = %user.short(), "issued session token");
        token
    }

    /// Resolve a bearer token to a user id.
    ///
    /// Scans all issued tokens with constant-time comparison so a lookup
    /// leaks nothing about any stored token.
    pub async fn verify(&self, presented: &str) -> Option<UserId> {
        let presented = presented.as_bytes();
        let tokens = self.tokens.read().await;

        let mut matched = None;
        for (&user, token) in tokens.iter() {
            let token = token.as_bytes();
            if token.len() == presented.len() && token.ct_eq(presented).unwrap_u8() == 1 {
                matched = Some(user);
            }
        }
        matched
    }

    pub async fn revoke(&self, user: UserId) {
        self.tokens.write().await.remove(&user);
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_verify_revoke() {
        let auth = Authenticator::new();
        let user = UserId::new();

        let token = auth.issue(user).await;
        assert_eq!(auth.verify(&token).await, Some(user));
        assert_eq!(auth.verify("not-a-token").await, None);

        auth.revoke(user).await;
        assert_eq!(auth.verify(&token).await, None);
    }

    #[tokio::test]
    async fn reissue_invalidates_the_old_token() {
        let auth = Authenticator::new();
        let user = UserId::new();

        let first = auth.issue(user).await;
        let second = auth.issue(user).await;

        assert_eq!(auth.verify(&first).await, None);
        assert_eq!(auth.verify(&second).await, Some(user));
    }
}
