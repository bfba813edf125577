//! # parley-hub
//!
//! The message fan-out and presence core.
//!
//! The [`ConversationHub`] accepts authenticated writes (messages, reactions,
//! seen-state, typing pings), validates them against conversation membership,
//! persists durable events through the [`Gateway`], and broadcasts the
//! resulting event to every connected session of every member. Durable
//! events are always written before they are broadcast, so a reconnecting
//! client's backfill can never miss an event it saw live.
//!
//! [`CallRouter`] layers ephemeral call signaling on the same session
//! fan-out, with a 30-second invite expiry.
//!
//! [`ConversationHub`]: crate::hub::ConversationHub
//! [`Gateway`]: crate::gateway::Gateway
//! [`CallRouter`]: crate::calls::CallRouter

pub mod calls;
pub mod gateway;
pub mod hub;
pub mod notify;
pub mod presence;
pub mod sessions;

pub use calls::CallRouter;
pub use gateway::{Gateway, SqliteGateway};
pub use hub::ConversationHub;
pub use notify::{LogNotifier, PushNotifier};
pub use presence::PresenceTracker;
pub use sessions::{SessionHandle, SessionRegistry};
