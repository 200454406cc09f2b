//! WebSocket handler: bridges one client socket to the shared hub.
//!
//! DESIGN
//! ======
//! On upgrade, the connection enters a `select!` loop:
//! - Incoming client frames: decode, dispatch by syscall, reply to sender
//! - Hub messages for joined topics: forward to client
//!
//! Every joined topic gets a forwarder task that drains the hub
//! subscription into the connection's outbound queue. `channel:send`
//! produces no reply on success; all other requests are answered with a
//! `done` or an error frame.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade, assign a connection id (logging only)
//! 2. Client frames are dispatched; replies go straight to the socket
//! 3. Close: leave every joined topic so peers get a presence sync

use std::collections::HashMap;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use frames::{
    ChannelMessage, Frame, PresenceRecord, SYSCALL_SEND, SYSCALL_SUBSCRIBE, SYSCALL_TRACK, SYSCALL_UNSUBSCRIBE,
    Status,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RelayState;
use crate::transport::{BroadcastTransport, TransportError};

#[derive(Debug, Deserialize)]
struct ClientData {
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct TrackData {
    client_id: String,
    record: PresenceRecord,
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Debug)]
struct Joined {
    client_id: String,
    forwarder: JoinHandle<()>,
}

/// Topics one connection has joined, and where their traffic goes.
#[derive(Debug)]
pub(crate) struct Session {
    conn_id: Uuid,
    outbound: mpsc::Sender<Frame>,
    joined: HashMap<String, Joined>,
}

impl Session {
    pub(crate) fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self { conn_id: Uuid::new_v4(), outbound, joined: HashMap::new() }
    }

    fn client_for(&self, topic: &str, client_id: &str) -> Result<(), TransportError> {
        match self.joined.get(topic) {
            Some(joined) if joined.client_id == client_id => Ok(()),
            _ => Err(TransportError::NotSubscribed { topic: topic.to_owned(), client_id: client_id.to_owned() }),
        }
    }

    /// Leave every joined topic.
    pub(crate) async fn close(&mut self, state: &RelayState) {
        for (topic, joined) in self.joined.drain() {
            joined.forwarder.abort();
            if let Err(e) = state.hub.unsubscribe(&topic, &joined.client_id).await {
                warn!(conn_id = %self.conn_id, %topic, error = %e, "ws: cleanup unsubscribe failed");
            }
        }
    }
}

// =============================================================================
// UPGRADE / CONNECTION
// =============================================================================

pub async fn handle_ws(State(state): State<RelayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

async fn run_ws(mut socket: WebSocket, state: RelayState) {
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.hub.capacity());
    let mut session = Session::new(client_tx);
    info!(conn_id = %session.conn_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Binary(bytes) => {
                        let reply = match frames::decode_frame(&bytes) {
                            Ok(frame) => process_frame(&state, &mut session, frame).await,
                            Err(e) => {
                                warn!(conn_id = %session.conn_id, error = %e, "ws: invalid inbound frame");
                                None
                            }
                        };
                        if let Some(reply) = reply {
                            if send_frame(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close(&state).await;
    info!(conn_id = %session.conn_id, "ws: client disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    if frame.status == Status::Error {
        let message = frame.data.get("message").and_then(serde_json::Value::as_str).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, message, "ws: send frame status=Error");
    } else {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Binary(frames::encode_frame(frame).into())).await
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Handle one client frame and return the reply for the sender, if any.
pub(crate) async fn process_frame(state: &RelayState, session: &mut Session, frame: Frame) -> Option<Frame> {
    debug!(conn_id = %session.conn_id, id = %frame.id, syscall = %frame.syscall, "ws: recv frame");

    let result = match frame.syscall.as_str() {
        SYSCALL_SUBSCRIBE => handle_subscribe(state, session, &frame).await.map(Some),
        SYSCALL_UNSUBSCRIBE => handle_unsubscribe(state, session, &frame).await.map(Some),
        SYSCALL_TRACK => handle_track(state, session, &frame).await.map(Some),
        SYSCALL_SEND => handle_send(state, session, &frame).await.map(|()| None),
        other => return Some(frame.error(format!("unknown syscall: {other}"))),
    };

    match result {
        Ok(Some(())) => Some(frame.done()),
        Ok(None) => None,
        Err(e) => Some(frame.error(e.to_string())),
    }
}

async fn handle_subscribe(state: &RelayState, session: &mut Session, frame: &Frame) -> Result<(), TransportError> {
    let topic = frame.require_topic()?.to_owned();
    let ClientData { client_id } = frame.payload()?;

    if session.joined.contains_key(&topic) {
        return Err(TransportError::AlreadySubscribed { topic, client_id });
    }

    let mut subscription = state.hub.subscribe(&topic, &client_id).await?;
    let outbound = session.outbound.clone();
    let forward_topic = topic.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(message) = subscription.inbound.recv().await {
            if outbound.send(message.to_frame(&forward_topic)).await.is_err() {
                break;
            }
        }
    });

    info!(conn_id = %session.conn_id, %topic, %client_id, "ws: joined topic");
    session.joined.insert(topic, Joined { client_id, forwarder });
    Ok(())
}

async fn handle_unsubscribe(state: &RelayState, session: &mut Session, frame: &Frame) -> Result<(), TransportError> {
    let topic = frame.require_topic()?;
    let ClientData { client_id } = frame.payload()?;

    if session.client_for(topic, &client_id).is_err() {
        return Ok(());
    }
    if let Some(joined) = session.joined.remove(topic) {
        joined.forwarder.abort();
    }
    state.hub.unsubscribe(topic, &client_id).await?;
    info!(conn_id = %session.conn_id, %topic, %client_id, "ws: left topic");
    Ok(())
}

async fn handle_track(state: &RelayState, session: &Session, frame: &Frame) -> Result<(), TransportError> {
    let topic = frame.require_topic()?;
    let TrackData { client_id, record } = frame.payload()?;
    session.client_for(topic, &client_id)?;
    state.hub.track(topic, &client_id, record).await
}

async fn handle_send(state: &RelayState, session: &Session, frame: &Frame) -> Result<(), TransportError> {
    let topic = frame.require_topic()?;
    let client_id = frame.from.as_deref().unwrap_or_default();
    session.client_for(topic, client_id)?;
    let message = ChannelMessage::from_frame(frame)?;
    state.hub.send(topic, client_id, message).await
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
