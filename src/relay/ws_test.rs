use std::sync::Arc;

use frames::{PresenceStatus, SYSCALL_ERROR};
use serde_json::json;
use tokio::time::{Duration, timeout};

use super::*;
use crate::transport::MemoryHub;

fn relay() -> RelayState {
    RelayState::new(Arc::new(MemoryHub::new(16)), None)
}

fn session() -> (Session, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(16);
    (Session::new(tx), rx)
}

fn subscribe(topic: &str, client_id: &str) -> Frame {
    Frame::request(SYSCALL_SUBSCRIBE, json!({ "client_id": client_id })).with_topic(topic)
}

fn track(topic: &str, client_id: &str, record: &PresenceRecord) -> Frame {
    Frame::request(SYSCALL_TRACK, json!({ "client_id": client_id, "record": record })).with_topic(topic)
}

fn send(topic: &str, client_id: &str, message: &ChannelMessage) -> Frame {
    let mut frame = message.to_frame(topic);
    frame.syscall = SYSCALL_SEND.to_owned();
    frame.with_from(client_id)
}

async fn recv(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("forward receive timed out")
        .expect("forward channel closed unexpectedly")
}

async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(timeout(Duration::from_millis(80), rx.recv()).await.is_err(), "expected no forwarded frame");
}

// =============================================================================
// subscribe / unsubscribe
// =============================================================================

#[tokio::test]
async fn subscribe_replies_done_and_joins_hub() {
    let state = relay();
    let (mut alice, _rx) = session();

    let request = subscribe("canvas:c1", "alice");
    let reply = process_frame(&state, &mut alice, request.clone()).await.unwrap();

    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.parent_id.as_deref(), Some(request.id.as_str()));
    assert_eq!(state.hub.subscriber_count("canvas:c1"), 1);
}

#[tokio::test]
async fn duplicate_subscribe_on_one_connection_is_rejected() {
    let state = relay();
    let (mut alice, _rx) = session();
    process_frame(&state, &mut alice, subscribe("canvas:c1", "alice")).await;

    let reply = process_frame(&state, &mut alice, subscribe("canvas:c1", "alice")).await.unwrap();
    assert_eq!(reply.status, Status::Error);
    assert_eq!(reply.syscall, SYSCALL_ERROR);
}

#[tokio::test]
async fn subscribe_without_topic_is_rejected() {
    let state = relay();
    let (mut alice, _rx) = session();
    let frame = Frame::request(SYSCALL_SUBSCRIBE, json!({ "client_id": "alice" }));

    let reply = process_frame(&state, &mut alice, frame).await.unwrap();
    assert_eq!(reply.status, Status::Error);
    assert_eq!(state.hub.topic_count(), 0);
}

#[tokio::test]
async fn unsubscribe_unknown_topic_is_done() {
    let state = relay();
    let (mut alice, _rx) = session();
    let frame = Frame::request(SYSCALL_UNSUBSCRIBE, json!({ "client_id": "alice" })).with_topic("canvas:nope");

    let reply = process_frame(&state, &mut alice, frame).await.unwrap();
    assert_eq!(reply.status, Status::Done);
}

#[tokio::test]
async fn unknown_syscall_is_rejected() {
    let state = relay();
    let (mut alice, _rx) = session();
    let reply = process_frame(&state, &mut alice, Frame::request("board:join", json!({}))).await.unwrap();
    assert_eq!(reply.data["message"], json!("unknown syscall: board:join"));
}

// =============================================================================
// send / track forwarding
// =============================================================================

#[tokio::test]
async fn send_is_forwarded_to_peers_without_reply() {
    let state = relay();
    let (mut alice, mut alice_rx) = session();
    let (mut bob, mut bob_rx) = session();
    process_frame(&state, &mut alice, subscribe("canvas:c1", "alice")).await;
    process_frame(&state, &mut bob, subscribe("canvas:c1", "bob")).await;

    let message = ChannelMessage::AmChange(vec![1, 2, 3]);
    let reply = process_frame(&state, &mut alice, send("canvas:c1", "alice", &message)).await;
    assert!(reply.is_none());

    let forwarded = recv(&mut bob_rx).await;
    assert_eq!(forwarded.syscall, frames::SYSCALL_MESSAGE);
    assert_eq!(forwarded.topic.as_deref(), Some("canvas:c1"));
    assert_eq!(ChannelMessage::from_frame(&forwarded).unwrap(), message);
    assert_no_frame(&mut alice_rx).await;
}

#[tokio::test]
async fn send_as_foreign_client_is_rejected() {
    let state = relay();
    let (mut alice, _rx) = session();
    process_frame(&state, &mut alice, subscribe("canvas:c1", "alice")).await;

    let message = ChannelMessage::Custom { event: "ping".into(), payload: json!(null) };
    let reply = process_frame(&state, &mut alice, send("canvas:c1", "mallory", &message)).await.unwrap();
    assert_eq!(reply.status, Status::Error);
}

#[tokio::test]
async fn track_syncs_presence_to_every_member() {
    let state = relay();
    let (mut alice, mut alice_rx) = session();
    let (mut bob, mut bob_rx) = session();
    process_frame(&state, &mut alice, subscribe("canvas:c1", "alice")).await;
    process_frame(&state, &mut bob, subscribe("canvas:c1", "bob")).await;

    let record = PresenceRecord::viewing("u-alice").with_status(PresenceStatus::Editing);
    let reply = process_frame(&state, &mut alice, track("canvas:c1", "alice", &record)).await.unwrap();
    assert_eq!(reply.status, Status::Done);

    for rx in [&mut alice_rx, &mut bob_rx] {
        let ChannelMessage::PresenceSync(map) = ChannelMessage::from_frame(&recv(rx).await).unwrap() else {
            panic!("expected presence sync");
        };
        assert_eq!(map["u-alice"], vec![record.clone()]);
    }
}

#[tokio::test]
async fn close_leaves_all_topics() {
    let state = relay();
    let (mut alice, _alice_rx) = session();
    let (mut bob, mut bob_rx) = session();
    process_frame(&state, &mut alice, subscribe("canvas:c1", "alice")).await;
    process_frame(&state, &mut alice, subscribe("canvas:c2", "alice")).await;
    process_frame(&state, &mut bob, subscribe("canvas:c1", "bob")).await;
    process_frame(&state, &mut alice, track("canvas:c1", "alice", &PresenceRecord::viewing("u-alice"))).await;
    recv(&mut bob_rx).await;

    alice.close(&state).await;

    assert_eq!(state.hub.subscriber_count("canvas:c1"), 1);
    assert_eq!(state.hub.subscriber_count("canvas:c2"), 0);
    let ChannelMessage::PresenceSync(map) = ChannelMessage::from_frame(&recv(&mut bob_rx).await).unwrap() else {
        panic!("expected presence sync");
    };
    assert!(!map.contains_key("u-alice"));
}
