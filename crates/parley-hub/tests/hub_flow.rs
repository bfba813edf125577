//! End-to-end hub flows over a real SQLite store: fan-out, ordering,
//! backfill, seen-state, reactions, and call signaling.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use parley_hub::{
    ConversationHub, Gateway, LogNotifier, PresenceTracker, SessionHandle, SessionRegistry,
    SqliteGateway,
};
use parley_shared::error::HubError;
use parley_shared::protocol::{ClientCommand, Conversation, MessagePayload, Profile, ServerEvent};
use parley_shared::types::{ConversationId, UserId};
use parley_store::Database;

struct Harness {
    hub: Arc<ConversationHub>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_at(&dir.path().join("hub.db")).unwrap();
    let gateway: Arc<dyn Gateway> = Arc::new(SqliteGateway::new(db));
    let sessions = Arc::new(SessionRegistry::new());
    let presence = Arc::new(PresenceTracker::new(gateway.clone()));
    let hub = Arc::new(ConversationHub::new(
        gateway,
        sessions,
        presence,
        Arc::new(LogNotifier),
    ));
    Harness { hub, _dir: dir }
}

impl Harness {
    async fn user(&self, name: &str) -> UserId {
        let user = UserId::new();
        self.hub
            .gateway()
            .upsert_profile(&Profile {
                user_id: user,
                username: name.to_string(),
                display_name: name.to_string(),
                avatar_url: None,
                last_active: Utc::now(),
            })
            .await
            .unwrap();
        user
    }

    async fn connect(&self, user: UserId) -> mpsc::Receiver<ServerEvent> {
        let (handle, rx) = SessionHandle::new(user);
        self.hub.sessions().register(handle).await;
        rx
    }

    async fn direct_conversation(&self, a: UserId, b: UserId) -> Conversation {
        self.hub
            .create_conversation(a, vec![a, b], None, false)
            .await
            .unwrap()
    }

    async fn send_text(&self, from: UserId, conversation_id: ConversationId, text: &str) {
        self.hub
            .submit(
                ClientCommand::SendMessage {
                    conversation_id,
                    payload: MessagePayload::Text(text.to_string()),
                },
                from,
            )
            .await
            .unwrap();
    }
}

fn assert_empty(rx: &mut mpsc::Receiver<ServerEvent>) {
    assert!(matches!(
        rx.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn send_reaches_every_member_in_commit_order() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;

    let mut ana_rx = h.connect(ana).await;
    let mut bob_rx = h.connect(bob).await;

    h.send_text(ana, conv.id, "first").await;
    h.send_text(bob, conv.id, "second").await;

    for rx in [&mut ana_rx, &mut bob_rx] {
        for expected_seq in [1, 2] {
            match rx.recv().await.unwrap() {
                ServerEvent::MessageCreated { message } => {
                    assert_eq!(message.seq, expected_seq);
                    assert_eq!(message.conversation_id, conv.id);
                }
                other => panic!("expected MessageCreated, got {other:?}"),
            }
        }
        assert_empty(rx);
    }
}

#[tokio::test]
async fn multi_device_user_gets_one_copy_per_session() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;

    let mut desktop = h.connect(bob).await;
    let mut mobile = h.connect(bob).await;

    h.send_text(ana, conv.id, "ping").await;

    for rx in [&mut desktop, &mut mobile] {
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::MessageCreated { .. }
        ));
        assert_empty(rx);
    }
}

#[tokio::test]
async fn non_member_writes_are_rejected_without_side_effects() {
    let h = harness().await;
    let (ana, bob, eve) = (h.user("ana").await, h.user("bob").await, h.user("eve").await);
    let conv = h.direct_conversation(ana, bob).await;
    let mut ana_rx = h.connect(ana).await;

    let result = h
        .hub
        .submit(
            ClientCommand::SendMessage {
                conversation_id: conv.id,
                payload: MessagePayload::Text("intrusion".into()),
            },
            eve,
        )
        .await;
    assert_eq!(result, Err(HubError::NotMember));

    // Nothing was persisted and nothing was broadcast.
    let backfill = h.hub.backfill(ana, conv.id, 0).await.unwrap();
    assert!(backfill.is_empty());
    assert_empty(&mut ana_rx);
}

#[tokio::test]
async fn oversized_image_is_rejected_before_persistence() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;
    let mut bob_rx = h.connect(bob).await;

    let result = h
        .hub
        .submit(
            ClientCommand::SendMessage {
                conversation_id: conv.id,
                payload: MessagePayload::Image {
                    url: "blob/big".into(),
                    content_type: "image/jpeg".into(),
                    size_bytes: 11 * 1024 * 1024,
                },
            },
            ana,
        )
        .await;
    assert!(matches!(result, Err(HubError::PayloadTooLarge { .. })));

    assert!(h.hub.backfill(ana, conv.id, 0).await.unwrap().is_empty());
    assert_empty(&mut bob_rx);
}

#[tokio::test]
async fn reaction_toggle_twice_restores_baseline() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;
    let mut bob_rx = h.connect(bob).await;

    h.send_text(ana, conv.id, "react to me").await;
    let message_id = match bob_rx.recv().await.unwrap() {
        ServerEvent::MessageCreated { message } => message.id,
        other => panic!("expected MessageCreated, got {other:?}"),
    };

    for expected_added in [true, false] {
        h.hub
            .submit(
                ClientCommand::ToggleReaction {
                    message_id,
                    emoji: "🔥".into(),
                },
                bob,
            )
            .await
            .unwrap();
        match bob_rx.recv().await.unwrap() {
            ServerEvent::ReactionToggled { added, emoji, .. } => {
                assert_eq!(added, expected_added);
                assert_eq!(emoji, "🔥");
            }
            other => panic!("expected ReactionToggled, got {other:?}"),
        }
    }

    let messages = h.hub.backfill(ana, conv.id, 0).await.unwrap();
    assert!(messages[0].reactions.is_empty());
}

#[tokio::test]
async fn mark_seen_is_monotonic_and_skips_own_messages() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;
    let mut ana_rx = h.connect(ana).await;

    h.send_text(ana, conv.id, "one").await;
    h.send_text(ana, conv.id, "two").await;
    for _ in 0..2 {
        ana_rx.recv().await.unwrap();
    }

    h.hub
        .submit(
            ClientCommand::MarkSeen {
                conversation_id: conv.id,
                up_to: 2,
            },
            bob,
        )
        .await
        .unwrap();
    match ana_rx.recv().await.unwrap() {
        ServerEvent::SeenUpdated { user, up_to, .. } => {
            assert_eq!(user, bob);
            assert_eq!(up_to, 2);
        }
        other => panic!("expected SeenUpdated, got {other:?}"),
    }

    // Replays and regressions mark nothing, so nothing is broadcast.
    for up_to in [2, 1] {
        h.hub
            .submit(
                ClientCommand::MarkSeen {
                    conversation_id: conv.id,
                    up_to,
                },
                bob,
            )
            .await
            .unwrap();
    }
    assert_empty(&mut ana_rx);

    // Seen-state never includes the sender implicitly.
    let messages = h.hub.backfill(ana, conv.id, 0).await.unwrap();
    for message in &messages {
        assert!(message.seen_by.contains(&bob));
        assert!(!message.seen_by.contains(&ana));
    }
}

#[tokio::test]
async fn backfill_is_identical_for_every_member() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;

    for text in ["a", "b", "c"] {
        h.send_text(ana, conv.id, text).await;
    }

    let ana_view = h.hub.backfill(ana, conv.id, 0).await.unwrap();
    let bob_view = h.hub.backfill(bob, conv.id, 0).await.unwrap();

    assert_eq!(ana_view, bob_view);
    let seqs: Vec<i64> = ana_view.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    // Partial backfill resumes after the given sequence number.
    let tail = h.hub.backfill(bob, conv.id, 2).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].seq, 3);
}

#[tokio::test]
async fn resync_command_replies_with_backfill() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;
    h.send_text(ana, conv.id, "missed while offline").await;

    let reply = h
        .hub
        .submit(
            ClientCommand::Resync {
                conversation_id: conv.id,
                since_seq: 0,
            },
            bob,
        )
        .await
        .unwrap();

    match reply {
        Some(ServerEvent::Backfill {
            conversation_id,
            messages,
        }) => {
            assert_eq!(conversation_id, conv.id);
            assert_eq!(messages.len(), 1);
        }
        other => panic!("expected Backfill reply, got {other:?}"),
    }
}

#[tokio::test]
async fn edit_is_owner_only_and_delete_leaves_a_tombstone() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;
    let mut bob_rx = h.connect(bob).await;

    h.send_text(ana, conv.id, "original").await;
    let message_id = match bob_rx.recv().await.unwrap() {
        ServerEvent::MessageCreated { message } => message.id,
        other => panic!("expected MessageCreated, got {other:?}"),
    };

    let result = h
        .hub
        .submit(
            ClientCommand::EditMessage {
                message_id,
                new_text: "hijacked".into(),
            },
            bob,
        )
        .await;
    assert_eq!(result, Err(HubError::NotOwner));

    h.hub
        .submit(ClientCommand::DeleteMessage { message_id }, ana)
        .await
        .unwrap();
    match bob_rx.recv().await.unwrap() {
        ServerEvent::MessageDeleted { seq, .. } => assert_eq!(seq, 1),
        other => panic!("expected MessageDeleted, got {other:?}"),
    }

    // The row survives as a tombstone and can no longer be edited.
    let messages = h.hub.backfill(bob, conv.id, 0).await.unwrap();
    assert!(messages[0].deleted);
    assert_eq!(messages[0].payload, None);

    let result = h
        .hub
        .submit(
            ClientCommand::EditMessage {
                message_id,
                new_text: "too late".into(),
            },
            ana,
        )
        .await;
    assert!(matches!(result, Err(HubError::MessageNotFound(_))));
}

#[tokio::test]
async fn typing_never_echoes_to_the_sender() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;

    let mut ana_rx = h.connect(ana).await;
    let mut bob_rx = h.connect(bob).await;

    h.hub
        .submit(
            ClientCommand::TypingPing {
                conversation_id: conv.id,
                is_typing: true,
            },
            ana,
        )
        .await
        .unwrap();

    match bob_rx.recv().await.unwrap() {
        ServerEvent::Typing {
            user,
            display_name,
            is_typing,
            ..
        } => {
            assert_eq!(user, ana);
            assert_eq!(display_name, "ana");
            assert!(is_typing);
        }
        other => panic!("expected Typing, got {other:?}"),
    }
    assert_empty(&mut ana_rx);

    // Nothing persisted.
    assert!(h.hub.backfill(ana, conv.id, 0).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unanswered_invite_expires_as_missed_call() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;

    let mut ana_rx = h.connect(ana).await;
    let mut bob_rx = h.connect(bob).await;

    let reply = h
        .hub
        .submit(
            ClientCommand::InviteCall {
                conversation_id: conv.id,
                room: "room-1".into(),
            },
            ana,
        )
        .await
        .unwrap();
    let call_id = match reply {
        Some(ServerEvent::CallInvited { call_id, .. }) => call_id,
        other => panic!("expected CallInvited reply, got {other:?}"),
    };

    match bob_rx.recv().await.unwrap() {
        ServerEvent::IncomingCall {
            call_id: incoming,
            caller,
            room,
            ..
        } => {
            assert_eq!(incoming, call_id);
            assert_eq!(caller.user_id, ana);
            assert_eq!(room, "room-1");
        }
        other => panic!("expected IncomingCall, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(31)).await;

    // Both sides learn the invite went unanswered.
    for rx in [&mut ana_rx, &mut bob_rx] {
        match rx.recv().await.unwrap() {
            ServerEvent::MissedCall {
                call_id: missed, ..
            } => assert_eq!(missed, call_id),
            other => panic!("expected MissedCall, got {other:?}"),
        }
    }

    // A late accept races against a resolved call and loses.
    let result = h
        .hub
        .submit(ClientCommand::AcceptCall { call_id }, bob)
        .await;
    assert_eq!(result, Err(HubError::AlreadyResolved(call_id)));
    assert_eq!(h.hub.calls().active_calls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn accepted_call_never_expires() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;

    let mut ana_rx = h.connect(ana).await;
    let mut bob_rx = h.connect(bob).await;

    let reply = h
        .hub
        .submit(
            ClientCommand::InviteCall {
                conversation_id: conv.id,
                room: "room-2".into(),
            },
            ana,
        )
        .await
        .unwrap();
    let call_id = match reply {
        Some(ServerEvent::CallInvited { call_id, .. }) => call_id,
        other => panic!("expected CallInvited reply, got {other:?}"),
    };
    bob_rx.recv().await.unwrap();

    h.hub
        .submit(ClientCommand::AcceptCall { call_id }, bob)
        .await
        .unwrap();
    for rx in [&mut ana_rx, &mut bob_rx] {
        match rx.recv().await.unwrap() {
            ServerEvent::CallAccepted { by, .. } => assert_eq!(by, bob),
            other => panic!("expected CallAccepted, got {other:?}"),
        }
    }

    // Well past the invite expiry: the timer was disarmed.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_empty(&mut ana_rx);
    assert_empty(&mut bob_rx);
    assert_eq!(h.hub.calls().active_calls().await, 1);

    h.hub
        .submit(ClientCommand::EndCall { call_id }, ana)
        .await
        .unwrap();
    match bob_rx.recv().await.unwrap() {
        ServerEvent::CallEnded { call_id: ended, .. } => assert_eq!(ended, call_id),
        other => panic!("expected CallEnded, got {other:?}"),
    }
    assert_eq!(h.hub.calls().active_calls().await, 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_call_is_closed_at_the_duration_cap() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;

    let mut ana_rx = h.connect(ana).await;
    let mut bob_rx = h.connect(bob).await;

    let reply = h
        .hub
        .submit(
            ClientCommand::InviteCall {
                conversation_id: conv.id,
                room: "room-4".into(),
            },
            ana,
        )
        .await
        .unwrap();
    let call_id = match reply {
        Some(ServerEvent::CallInvited { call_id, .. }) => call_id,
        other => panic!("expected CallInvited reply, got {other:?}"),
    };
    bob_rx.recv().await.unwrap();

    h.hub
        .submit(ClientCommand::AcceptCall { call_id }, bob)
        .await
        .unwrap();
    for rx in [&mut ana_rx, &mut bob_rx] {
        rx.recv().await.unwrap();
    }

    // Nobody ever hangs up; past the duration cap the call is closed for
    // every participant and the entry is gone.
    tokio::time::sleep(Duration::from_secs(
        parley_shared::constants::CALL_MAX_DURATION_SECS + 1,
    ))
    .await;
    for rx in [&mut ana_rx, &mut bob_rx] {
        match rx.recv().await.unwrap() {
            ServerEvent::CallEnded { call_id: ended, .. } => assert_eq!(ended, call_id),
            other => panic!("expected CallEnded, got {other:?}"),
        }
    }
    assert_eq!(h.hub.calls().active_calls().await, 0);

    let result = h.hub.submit(ClientCommand::EndCall { call_id }, ana).await;
    assert_eq!(result, Err(HubError::AlreadyResolved(call_id)));
}

#[tokio::test(start_paused = true)]
async fn declined_call_ends_for_everyone_else() {
    let h = harness().await;
    let (ana, bob) = (h.user("ana").await, h.user("bob").await);
    let conv = h.direct_conversation(ana, bob).await;

    let mut ana_rx = h.connect(ana).await;
    let mut bob_rx = h.connect(bob).await;

    let reply = h
        .hub
        .submit(
            ClientCommand::InviteCall {
                conversation_id: conv.id,
                room: "room-3".into(),
            },
            ana,
        )
        .await
        .unwrap();
    let call_id = match reply {
        Some(ServerEvent::CallInvited { call_id, .. }) => call_id,
        other => panic!("expected CallInvited reply, got {other:?}"),
    };
    bob_rx.recv().await.unwrap();

    h.hub
        .submit(ClientCommand::DeclineCall { call_id }, bob)
        .await
        .unwrap();
    match ana_rx.recv().await.unwrap() {
        ServerEvent::CallEnded { call_id: ended, .. } => assert_eq!(ended, call_id),
        other => panic!("expected CallEnded, got {other:?}"),
    }
    assert_empty(&mut bob_rx);

    // The expiry timer was disarmed along with the entry.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_empty(&mut ana_rx);
    assert_eq!(h.hub.calls().active_calls().await, 0);
}
