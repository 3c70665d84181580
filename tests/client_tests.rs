#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end tests for [`PresenceClient`] against a fake peer on real Unix
//! sockets.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{body, config, dispatch, next_event, FakePeer, Greeting};
use presence_ipc::codec::{Opcode, MAX_PAYLOAD_LEN};
use presence_ipc::discovery::AttemptLogging;
use presence_ipc::{
    CloseCode, Command, CommandKind, ConnectionState, DisconnectReason, EventKind, FrameError,
    IpcError, JoinReply, PartialUser, PresenceClient, PresenceEvent,
};
use serde_json::{json, Value};

fn cmd(value: &Value) -> &str {
    value["cmd"].as_str().unwrap()
}

/// Take the handshake and the three default subscriptions off `peer`.
async fn expect_session_start(peer: &mut FakePeer) {
    let frames = peer.frames(4).await;
    assert_eq!(frames[0].frame.opcode, Opcode::Handshake);
    for received in &frames[1..] {
        assert_eq!(cmd(&body(&received.frame)), "SUBSCRIBE");
    }
}

// ════════════════════════════════════════════════════════════════════
// Discovery
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn discovers_first_listening_socket() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakePeer::bind(dir.path(), 7, Greeting::Ready);
    let (client, mut events) =
        PresenceClient::new(config(dir.path()).with_attempt_logging(AttemptLogging::Debug));

    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.endpoint().await.unwrap().index(), 7);

    let handshake = peer.next_frame().await;
    assert_eq!(handshake.frame.opcode, Opcode::Handshake);
    assert_eq!(body(&handshake.frame), json!({"v": 1, "client_id": "1234567890"}));

    match next_event(&mut events).await {
        PresenceEvent::Ready { user: Some(user) } => assert_eq!(user.username, "ferris"),
        other => panic!("expected Ready, got {other:?}"),
    }
}

#[tokio::test]
async fn exhaustion_leaves_client_disconnected_and_reusable() {
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events) = PresenceClient::new(config(dir.path()));

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, IpcError::DiscoveryExhausted { attempts: 10 }));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(events.try_recv().is_err(), "failed attempts publish nothing");

    let _peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    client.connect().await.unwrap();
    assert_eq!(client.endpoint().await.unwrap().index(), 0);
    assert!(matches!(next_event(&mut events).await, PresenceEvent::Ready { .. }));
}

#[tokio::test]
async fn rejected_handshake_moves_to_next_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let mut rejecting = FakePeer::bind(
        dir.path(),
        1,
        Greeting::Reject {
            code: 4000,
            message: "Invalid Client ID".into(),
        },
    );
    let _accepting = FakePeer::bind(dir.path(), 3, Greeting::Ready);
    let (client, mut events) = PresenceClient::new(config(dir.path()));

    client.connect().await.unwrap();

    assert_eq!(client.endpoint().await.unwrap().index(), 3);
    assert_eq!(rejecting.next_frame().await.frame.opcode, Opcode::Handshake);
    // The rejected candidate contributes no events, not even a disconnect.
    assert!(matches!(next_event(&mut events).await, PresenceEvent::Ready { .. }));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn rejected_candidate_traffic_is_never_published() {
    let dir = tempfile::tempdir().unwrap();
    let _rejecting = FakePeer::bind(
        dir.path(),
        0,
        Greeting::RejectThen {
            code: 4000,
            message: "Invalid Client ID".into(),
            trailing: dispatch("ACTIVITY_JOIN", json!({"secret": "from-rejected"})),
        },
    );
    let _accepting = FakePeer::bind(dir.path(), 1, Greeting::Ready);
    let (client, mut events) = PresenceClient::new(config(dir.path()));

    client.connect().await.unwrap();

    assert_eq!(client.endpoint().await.unwrap().index(), 1);
    assert!(matches!(next_event(&mut events).await, PresenceEvent::Ready { .. }));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err(),
        "frames after a rejection must not be published"
    );
}

#[tokio::test]
async fn silent_peer_is_accepted_after_handshake_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakePeer::bind(dir.path(), 0, Greeting::Silent);
    let (client, mut events) = PresenceClient::new(
        config(dir.path()).with_handshake_timeout(Duration::from_millis(50)),
    );
    let state = client.watch_state();

    client.connect().await.unwrap();

    assert_eq!(*state.borrow(), ConnectionState::Connected);
    expect_session_start(&mut peer).await;
    assert!(events.try_recv().is_err());
}

// ════════════════════════════════════════════════════════════════════
// Session restore
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn subscriptions_then_presence_are_sent_before_other_commands() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, _events) = PresenceClient::new(config(dir.path()));

    client
        .set_presence(&json!({"state": "In lobby", "party": {"size": [1, 4]}}))
        .await
        .unwrap();
    client.connect().await.unwrap();
    client.reply(&user("77"), JoinReply::Yes).await.unwrap();

    let frames = peer.frames(6).await;
    assert_eq!(frames[0].frame.opcode, Opcode::Handshake);

    let bodies: Vec<Value> = frames[1..].iter().map(|r| body(&r.frame)).collect();
    let evts: Vec<&str> = bodies[..3]
        .iter()
        .map(|b| {
            assert_eq!(cmd(b), "SUBSCRIBE");
            b["evt"].as_str().unwrap()
        })
        .collect();
    assert_eq!(evts, ["ACTIVITY_JOIN", "ACTIVITY_SPECTATE", "ACTIVITY_JOIN_REQUEST"]);

    assert_eq!(cmd(&bodies[3]), "SET_ACTIVITY");
    assert_eq!(bodies[3]["args"]["pid"], 4242);
    assert_eq!(bodies[3]["args"]["activity"]["state"], "In lobby");

    assert_eq!(cmd(&bodies[4]), "SEND_ACTIVITY_JOIN_INVITE");
}

#[tokio::test]
async fn reconnect_replays_subscriptions_on_a_new_connection() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, mut events) = PresenceClient::new(config(dir.path()));

    client.unsubscribe(EventKind::ActivitySpectate).await.unwrap();
    client.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, PresenceEvent::Ready { .. }));
    let first = peer.frames(3).await;
    assert!(first.iter().all(|r| r.connection == 1));

    peer.hang_up();
    assert_eq!(
        next_event(&mut events).await,
        PresenceEvent::Disconnected {
            reason: DisconnectReason::PeerClosed {
                code: None,
                message: None,
            },
        }
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, PresenceEvent::Ready { .. }));

    let second = peer.frames(3).await;
    assert!(second.iter().all(|r| r.connection == 2));
    assert_eq!(second[0].frame.opcode, Opcode::Handshake);
    let evts: Vec<String> = second[1..]
        .iter()
        .map(|r| body(&r.frame)["evt"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(evts, ["ACTIVITY_JOIN", "ACTIVITY_JOIN_REQUEST"]);
}

#[tokio::test]
async fn connect_while_connected_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, _events) = PresenceClient::new(config(dir.path()));

    client.connect().await.unwrap();
    expect_session_start(&mut peer).await;

    client.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer.drain().is_empty());
}

// ════════════════════════════════════════════════════════════════════
// Inbound events
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn events_arrive_in_wire_order() {
    let dir = tempfile::tempdir().unwrap();
    let peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, mut events) = PresenceClient::new(config(dir.path()));
    client.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, PresenceEvent::Ready { .. }));

    let mut wire = dispatch("ACTIVITY_JOIN", json!({"secret": "join-1"}));
    wire.extend(dispatch("SOMETHING_NEW", json!({"x": 1})));
    wire.extend(dispatch("ACTIVITY_SPECTATE", json!({"secret": "spec-1"})));
    wire.extend(dispatch(
        "ACTIVITY_JOIN_REQUEST",
        json!({"user": {"id": "77", "username": "crab", "avatar": "abc"}}),
    ));
    peer.push(wire);

    assert_eq!(
        next_event(&mut events).await,
        PresenceEvent::ActivityJoin {
            secret: "join-1".into()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        PresenceEvent::ActivitySpectate {
            secret: "spec-1".into()
        }
    );
    match next_event(&mut events).await {
        PresenceEvent::ActivityJoinRequest { user } => {
            assert_eq!(user.id, "77");
            assert_eq!(user.avatar.as_deref(), Some("abc"));
        }
        other => panic!("expected join request, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_frame_yields_exactly_one_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, mut events) = PresenceClient::new(config(dir.path()));
    client.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, PresenceEvent::Ready { .. }));

    let mut wire = dispatch("ACTIVITY_JOIN", json!({"secret": "before"}));
    wire.extend_from_slice(&Opcode::Frame.as_u32().to_le_bytes());
    wire.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
    wire.extend(dispatch("ACTIVITY_JOIN", json!({"secret": "after"})));
    peer.push(wire);

    assert_eq!(
        next_event(&mut events).await,
        PresenceEvent::ActivityJoin {
            secret: "before".into()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        PresenceEvent::Disconnected {
            reason: DisconnectReason::Malformed(FrameError::PayloadTooLarge {
                len: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN,
            }),
        }
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err(),
        "nothing may follow the disconnect"
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_with_a_full_event_channel_still_reports_once() {
    let dir = tempfile::tempdir().unwrap();
    let peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, mut events) = PresenceClient::new(
        config(dir.path())
            .with_event_channel_capacity(1)
            .with_shutdown_timeout(Duration::from_secs(5)),
    );
    client.connect().await.unwrap();

    // Nobody drains: the read loop ends up waiting for channel space.
    for secret in ["a", "b", "c"] {
        peer.push(dispatch("ACTIVITY_JOIN", json!({"secret": secret})));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(2), client.disconnect())
        .await
        .expect("disconnect must not wait out the shutdown timeout");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let mut seen = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(100), events.recv()).await
    {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(PresenceEvent::Ready { .. })));
    assert_eq!(
        seen.last(),
        Some(&PresenceEvent::Disconnected {
            reason: DisconnectReason::LocalShutdown,
        })
    );
    let disconnects = seen
        .iter()
        .filter(|e| matches!(e, PresenceEvent::Disconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn peer_close_frame_is_reported_on_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, mut events) = PresenceClient::new(config(dir.path()));
    client.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, PresenceEvent::Ready { .. }));

    peer.push(common::close(4002, "Rate limited"));
    peer.hang_up();

    assert_eq!(
        next_event(&mut events).await,
        PresenceEvent::Disconnected {
            reason: DisconnectReason::PeerClosed {
                code: Some(CloseCode::RateLimited),
                message: Some("Rate limited".into()),
            },
        }
    );
}

// ════════════════════════════════════════════════════════════════════
// Outbound commands
// ════════════════════════════════════════════════════════════════════

fn user(id: &str) -> PartialUser {
    PartialUser {
        id: id.into(),
        username: "crab".into(),
        discriminator: None,
        avatar: None,
    }
}

#[tokio::test]
async fn reply_and_presence_wire_shapes() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, _events) = PresenceClient::new(config(dir.path()));
    client.connect().await.unwrap();
    expect_session_start(&mut peer).await;

    client.reply(&user("77"), JoinReply::Yes).await.unwrap();
    client.reply(&user("78"), JoinReply::No).await.unwrap();
    client.reply(&user("79"), JoinReply::Ignore).await.unwrap();
    client
        .set_presence(&json!({"details": "Boss fight"}))
        .await
        .unwrap();
    client.clear_presence().await.unwrap();

    let bodies: Vec<Value> = peer
        .frames(5)
        .await
        .iter()
        .map(|r| {
            assert_eq!(r.frame.opcode, Opcode::Frame);
            body(&r.frame)
        })
        .collect();

    assert_eq!(cmd(&bodies[0]), "SEND_ACTIVITY_JOIN_INVITE");
    assert_eq!(bodies[0]["args"], json!({"user_id": "77"}));
    assert!(bodies[0].get("evt").is_none());
    assert_eq!(cmd(&bodies[1]), "CLOSE_ACTIVITY_JOIN_REQUEST");
    assert_eq!(bodies[1]["args"], json!({"user_id": "78"}));
    assert_eq!(cmd(&bodies[2]), "CLOSE_ACTIVITY_JOIN_REQUEST");
    assert_eq!(bodies[2]["args"], json!({"user_id": "79"}));
    assert_eq!(
        bodies[3]["args"],
        json!({"pid": 4242, "activity": {"details": "Boss fight"}})
    );
    assert_eq!(bodies[4]["args"], json!({"pid": 4242, "activity": null}));

    let mut nonces: Vec<&str> = bodies.iter().map(|b| b["nonce"].as_str().unwrap()).collect();
    nonces.sort_unstable();
    nonces.dedup();
    assert_eq!(nonces.len(), 5, "every command carries its own nonce");
}

#[tokio::test]
async fn send_after_disconnect_fails_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, mut events) = PresenceClient::new(config(dir.path()));
    client.connect().await.unwrap();
    expect_session_start(&mut peer).await;
    assert!(matches!(next_event(&mut events).await, PresenceEvent::Ready { .. }));

    client.disconnect().await;
    assert_eq!(
        next_event(&mut events).await,
        PresenceEvent::Disconnected {
            reason: DisconnectReason::LocalShutdown,
        }
    );

    let err = client
        .send(Command::new(CommandKind::SetActivity))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::NotConnected));
    assert!(matches!(
        client.reply(&user("1"), JoinReply::Yes).await,
        Err(IpcError::NotConnected)
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer.drain().is_empty());

    // A second disconnect is a no-op.
    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_clears_presence_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, _events) = PresenceClient::new(config(dir.path()));
    let presence = client.watch_presence();

    client.connect().await.unwrap();
    expect_session_start(&mut peer).await;
    client.set_presence(&json!({"state": "Playing"})).await.unwrap();
    assert_eq!(*presence.borrow(), Some(json!({"state": "Playing"})));

    client.disconnect().await;

    let frames = peer.frames(2).await;
    assert_eq!(body(&frames[0].frame)["args"]["activity"]["state"], "Playing");
    assert_eq!(body(&frames[1].frame)["args"]["activity"], Value::Null);
    assert_eq!(*presence.borrow(), None);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn concurrent_sends_never_interleave() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 25;

    let dir = tempfile::tempdir().unwrap();
    let mut peer = FakePeer::bind(dir.path(), 0, Greeting::Ready);
    let (client, _events) = PresenceClient::new(config(dir.path()));
    let client = Arc::new(client);
    client.connect().await.unwrap();
    expect_session_start(&mut peer).await;

    let filler = "x".repeat(3000);
    let mut tasks = Vec::new();
    for writer in 0..WRITERS {
        let client = Arc::clone(&client);
        let filler = filler.clone();
        tasks.push(tokio::spawn(async move {
            for seq in 0..PER_WRITER {
                let command = Command::new(CommandKind::SetActivity)
                    .with_arg("pid", 4242)
                    .with_arg(
                        "activity",
                        json!({"writer": writer, "seq": seq, "details": filler}),
                    );
                client.send(command).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut per_writer: HashMap<u64, Vec<u64>> = HashMap::new();
    for received in peer.frames(WRITERS * PER_WRITER).await {
        let activity = body(&received.frame)["args"]["activity"].clone();
        assert_eq!(activity["details"].as_str().unwrap().len(), 3000);
        per_writer
            .entry(activity["writer"].as_u64().unwrap())
            .or_default()
            .push(activity["seq"].as_u64().unwrap());
    }

    assert_eq!(per_writer.len(), WRITERS);
    for seqs in per_writer.values() {
        let expected: Vec<u64> = (0..PER_WRITER as u64).collect();
        assert_eq!(seqs, &expected, "each writer's frames arrive whole and in order");
    }
}
