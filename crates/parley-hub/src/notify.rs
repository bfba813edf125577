//! Push-notification collaborator boundary.
//!
//! Fire-and-forget: the hub calls [`PushNotifier::notify`] when a target
//! user has no live sessions at all, and never waits on or inspects the
//! outcome. Delivery is the external push service's problem.

use async_trait::async_trait;
use tracing::info;

use parley_shared::types::UserId;

#[async_trait]
pub trait PushNotifier: Send + Sync + 'static {
    async fn notify(&self, user: UserId, title: &str, body: &str);
}

/// Default notifier: logs instead of delivering. Stands in until a real
/// push provider is wired up.
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn notify(&self, user: UserId, title: &str, body: &str) {
        info!(user = %user.short(), title, body, "push notification");
    }
}
