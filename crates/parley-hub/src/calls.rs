//! Call signaling router.
//!
//! Ephemeral by construction: call state lives only in this process and only
//! for the lifetime of a call. Per call id the state machine is
//! `Invited -> {Accepted, Declined, Expired, Ended}`, all terminal, and the
//! first transition wins. Accept, decline, and the 30-second expiry timer
//! race on the same entry, so every transition happens under the table lock
//! and later arrivals see `AlreadyResolved`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use parley_shared::constants::{CALL_INVITE_EXPIRY_SECS, CALL_MAX_DURATION_SECS};
use parley_shared::error::{HubError, HubResult};
use parley_shared::protocol::{Profile, ServerEvent};
use parley_shared::types::{CallId, ConversationId, UserId};

use crate::gateway::Gateway;
use crate::notify::PushNotifier;
use crate::sessions::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Invited,
    Accepted,
}

struct CallEntry {
    conversation_id: ConversationId,
    caller: Profile,
    /// Invited users (conversation members minus the caller).
    targets: Vec<UserId>,
    /// All conversation members, for end-of-call broadcasts.
    members: Vec<UserId>,
    state: CallState,
    timer: Option<JoinHandle<()>>,
}

pub struct CallRouter {
    gateway: Arc<dyn Gateway>,
    sessions: Arc<SessionRegistry>,
    notifier: Arc<dyn PushNotifier>,
    calls: Mutex<HashMap<CallId, CallEntry>>,
}

impl CallRouter {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        sessions: Arc<SessionRegistry>,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        Self {
            gateway,
            sessions,
            notifier,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Invite every other member of the conversation to a call.
    ///
    /// Pushes `IncomingCall` to every session of every target and arms a
    /// 30-second expiry timer. Fully offline targets get a push
    /// notification instead.
    pub async fn invite(
        self: Arc<Self>,
        caller: UserId,
        conversation_id: ConversationId,
        room: String,
    ) -> HubResult<CallId> {
        let conversation = self.gateway.get_conversation(conversation_id).await?;
        if !conversation.members.contains(&caller) {
            return Err(HubError::NotMember);
        }

        let caller_profile = self.gateway.get_profile(caller).await?;
        let call_id = CallId::new();
        let targets: Vec<UserId> = conversation
            .members
            .iter()
            .copied()
            .filter(|&m| m != caller)
            .collect();

        info!(
            call = %call_id,
            conversation = %conversation_id,
            caller = %caller.short(),
            targets = targets.len(),
            "call invite"
        );

        let event = ServerEvent::IncomingCall {
            call_id,
            conversation_id,
            room: room.clone(),
            caller: caller_profile.clone(),
        };

        for &target in &targets {
            let sessions = self.sessions.sessions_for(target).await;
            if sessions.is_empty() {
                self.notifier
                    .notify(
                        target,
                        "Incoming call",
                        &format!("{} is calling you", caller_profile.display_name),
                    )
                    .await;
                continue;
            }
            for session in sessions {
                session.push(event.clone());
            }
        }

        self.calls.lock().await.insert(
            call_id,
            CallEntry {
                conversation_id,
                caller: caller_profile,
                targets,
                members: conversation.members,
                state: CallState::Invited,
                timer: None,
            },
        );

        // Arm the expiry after the entry exists; if the call resolved in the
        // meantime the timer is aborted immediately.
        let router = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(CALL_INVITE_EXPIRY_SECS)).await;
            router.expire(call_id).await;
        });

        let mut calls = self.calls.lock().await;
        match calls.get_mut(&call_id) {
            Some(entry) => entry.timer = Some(handle),
            None => handle.abort(),
        }

        Ok(call_id)
    }

    /// Accept an invite. The entry is retained (state `Accepted`) so the
    /// eventual `end` can still route; the invite timer is swapped for a
    /// duration-cap timer so a call nobody hangs up cannot linger forever.
    pub async fn accept(self: Arc<Self>, call_id: CallId, user: UserId) -> HubResult<()> {
        let (conversation_id, members) = {
            let mut calls = self.calls.lock().await;
            let entry = calls
                .get_mut(&call_id)
                .ok_or(HubError::AlreadyResolved(call_id))?;
            if entry.state != CallState::Invited {
                return Err(HubError::AlreadyResolved(call_id));
            }
            if !entry.targets.contains(&user) {
                return Err(HubError::NotMember);
            }

            entry.state = CallState::Accepted;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            let router = Arc::clone(&self);
            entry.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(CALL_MAX_DURATION_SECS)).await;
                router.reap(call_id).await;
            }));
            (entry.conversation_id, entry.members.clone())
        };

        info!(call = %call_id, by = %user.short(), "call accepted");

        self.push_to_members(
            &members,
            None,
            ServerEvent::CallAccepted {
                call_id,
                conversation_id,
                by: user,
            },
        )
        .await;
        Ok(())
    }

    /// Decline an invite. Everyone else in the conversation (the caller
    /// included) learns via `CallEnded`.
    pub async fn decline(&self, call_id: CallId, user: UserId) -> HubResult<()> {
        let (conversation_id, members) = {
            let mut calls = self.calls.lock().await;
            let mut entry = calls
                .remove(&call_id)
                .ok_or(HubError::AlreadyResolved(call_id))?;
            if entry.state != CallState::Invited {
                calls.insert(call_id, entry);
                return Err(HubError::AlreadyResolved(call_id));
            }
            if !entry.targets.contains(&user) {
                calls.insert(call_id, entry);
                return Err(HubError::NotMember);
            }

            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            (entry.conversation_id, entry.members)
        };

        info!(call = %call_id, by = %user.short(), "call declined");

        self.push_to_members(
            &members,
            Some(user),
            ServerEvent::CallEnded {
                call_id,
                conversation_id,
            },
        )
        .await;
        Ok(())
    }

    /// End a call (either party hanging up, including an un-answered caller
    /// cancel). Routes `CallEnded` to every other member.
    pub async fn end(&self, call_id: CallId, user: UserId) -> HubResult<()> {
        let (conversation_id, members) = {
            let mut calls = self.calls.lock().await;
            let mut entry = calls
                .remove(&call_id)
                .ok_or(HubError::AlreadyResolved(call_id))?;
            if !entry.members.contains(&user) {
                calls.insert(call_id, entry);
                return Err(HubError::NotMember);
            }

            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            (entry.conversation_id, entry.members)
        };

        info!(call = %call_id, by = %user.short(), "call ended");

        self.push_to_members(
            &members,
            Some(user),
            ServerEvent::CallEnded {
                call_id,
                conversation_id,
            },
        )
        .await;
        Ok(())
    }

    /// Expiry path, reached only from the invite timer. First transition
    /// wins: if accept/decline landed first this is a no-op.
    async fn expire(&self, call_id: CallId) {
        let entry = {
            let mut calls = self.calls.lock().await;
            match calls.remove(&call_id) {
                Some(e) if e.state == CallState::Invited => e,
                Some(e) => {
                    calls.insert(call_id, e);
                    debug!(call = %call_id, "expiry lost the race, ignoring");
                    return;
                }
                None => {
                    debug!(call = %call_id, "expiry lost the race, ignoring");
                    return;
                }
            }
        };

        info!(call = %call_id, "call invite expired");

        let event = ServerEvent::MissedCall {
            call_id,
            conversation_id: entry.conversation_id,
            caller: entry.caller.clone(),
        };

        // The caller learns the invite went unanswered too.
        self.push_to_members(&entry.members, None, event).await;

        for &target in &entry.targets {
            if self.sessions.sessions_for(target).await.is_empty() {
                self.notifier
                    .notify(
                        target,
                        "Missed call",
                        &format!("You missed a call from {}", entry.caller.display_name),
                    )
                    .await;
            }
        }
    }

    /// Close an accepted call that hit the duration cap without an explicit
    /// end. A normal `end` aborts this timer, so reaching here means the
    /// entry was abandoned.
    async fn reap(&self, call_id: CallId) {
        let entry = {
            let mut calls = self.calls.lock().await;
            match calls.remove(&call_id) {
                Some(e) if e.state == CallState::Accepted => e,
                Some(e) => {
                    calls.insert(call_id, e);
                    return;
                }
                None => return,
            }
        };

        info!(call = %call_id, "call hit the duration cap, closing");

        self.push_to_members(
            &entry.members,
            None,
            ServerEvent::CallEnded {
                call_id,
                conversation_id: entry.conversation_id,
            },
        )
        .await;
    }

    /// Number of calls currently tracked (invited or in progress).
    pub async fn active_calls(&self) -> usize {
        self.calls.lock().await.len()
    }

    async fn push_to_members(
        &self,
        members: &[UserId],
        exclude: Option<UserId>,
        event: ServerEvent,
    ) {
        for &member in members {
            if Some(member) == exclude {
                continue;
            }
            for session in self.sessions.sessions_for(member).await {
                session.push(event.clone());
            }
        }
    }
}
