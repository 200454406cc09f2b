//! End-to-end: websocket clients exchanging presence and deltas through a
//! live relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canvas::doc::{CanvasSnapshot, Node, NodeKind};
use canvas_sync::crdt::Replicator;
use canvas_sync::presence::PresenceChannel;
use canvas_sync::relay::{self, RelayState};
use canvas_sync::transport::{BroadcastTransport, MemoryHub, TransportError, WsTransport};
use frames::{PresenceMap, PresenceRecord};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

async fn spawn_relay() -> (SocketAddr, Arc<MemoryHub>) {
    let hub = Arc::new(MemoryHub::new(64));
    let app = relay::router(RelayState::new(hub.clone(), None));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hub)
}

async fn client(addr: SocketAddr) -> Arc<WsTransport> {
    Arc::new(WsTransport::connect(&format!("ws://{addr}/ws"), 64).await.unwrap())
}

fn snapshot() -> CanvasSnapshot {
    let mut node = Node::new(NodeKind::Metric, "Revenue", 0.0, 0.0);
    node.id = "n1".into();
    CanvasSnapshot { nodes: vec![node], ..CanvasSnapshot::default() }
}

#[tokio::test]
async fn presence_flows_through_relay() {
    let (addr, hub) = spawn_relay().await;
    let alice = PresenceChannel::new(client(addr).await, "alice-tab");
    let bob = PresenceChannel::new(client(addr).await, "bob-tab");

    let (tx, mut syncs) = mpsc::unbounded_channel::<PresenceMap>();
    bob.on_presence_sync(move |map| {
        tx.send(map.clone()).unwrap();
    });

    bob.join("c1", PresenceRecord::viewing("bob")).await.unwrap();
    alice.join("c1", PresenceRecord::viewing("alice")).await.unwrap();
    assert_eq!(hub.subscriber_count("canvas:c1"), 2);

    let mut latest = PresenceMap::new();
    while latest.len() < 2 {
        latest = timeout(WAIT, syncs.recv()).await.unwrap().unwrap();
    }
    assert!(latest.contains_key("alice"));

    alice.leave().await.unwrap();
    while latest.contains_key("alice") {
        latest = timeout(WAIT, syncs.recv()).await.unwrap().unwrap();
    }
    assert_eq!(hub.subscriber_count("canvas:c1"), 1);
}

#[tokio::test]
async fn deltas_replicate_between_ws_clients() {
    let (addr, _hub) = spawn_relay().await;
    let alice_channel = PresenceChannel::new(client(addr).await, "alice-tab");
    let bob_channel = PresenceChannel::new(client(addr).await, "bob-tab");
    alice_channel.join("c1", PresenceRecord::viewing("alice")).await.unwrap();
    bob_channel.join("c1", PresenceRecord::viewing("bob")).await.unwrap();

    let alice = Arc::new(Replicator::new(Uuid::from_u128(1), Arc::new(alice_channel.clone())));
    let bob = Arc::new(Replicator::detached(Uuid::from_u128(2)));
    alice.initialize_from(&snapshot()).unwrap();
    bob.initialize_from(&snapshot()).unwrap();
    let _listener = bob.listen(&bob_channel);

    let mut next = snapshot();
    next.nodes[0].label = "ARR".into();
    alice.record_local_mutation(&next).await.unwrap().unwrap();

    timeout(WAIT, async {
        while bob.to_snapshot().unwrap().nodes[0].label != "ARR" {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(alice.document(), bob.document());
}

#[tokio::test]
async fn track_before_subscribe_is_rejected_by_relay() {
    let (addr, _hub) = spawn_relay().await;
    let transport = client(addr).await;

    let err = transport.track("canvas:c1", "alice-tab", PresenceRecord::viewing("alice")).await.unwrap_err();
    assert!(matches!(err, TransportError::Rejected { .. }), "got {err:?}");
}

#[tokio::test]
async fn healthz_without_database_is_ok() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (addr, _hub) = spawn_relay().await;
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response)).await.unwrap().unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got {response}");
}
