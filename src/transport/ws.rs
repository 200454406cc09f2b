//! Websocket client transport speaking protobuf frames to a relay.
//!
//! DESIGN
//! ======
//! One socket carries every topic. A writer task drains an outbound frame
//! queue into the socket; a reader task decodes inbound frames and routes
//! them: terminal replies resolve the pending request with the matching
//! `parent_id`, `channel:message` frames go to the subscription for their
//! topic.
//!
//! `subscribe`, `track` and `unsubscribe` wait for the relay's reply.
//! `send` does not: broadcast is fire-and-forget, and a relay error for a
//! send is only logged.
//!
//! ERROR HANDLING
//! ==============
//! When the socket closes, every open subscription's receiver ends and
//! every in-flight request fails with [`TransportError::Closed`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use frames::{
    ChannelMessage, Frame, PresenceRecord, SYSCALL_MESSAGE, SYSCALL_SEND, SYSCALL_SUBSCRIBE, SYSCALL_TRACK,
    SYSCALL_UNSUBSCRIBE, Status,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{BroadcastTransport, Subscription, TransportError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<String, mpsc::Sender<ChannelMessage>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<ChannelMessage>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Frame>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, frame: Frame) {
        if frame.status.is_terminal() {
            if let Some(parent_id) = frame.parent_id.clone() {
                let waiter = self.pending().remove(&parent_id);
                match waiter {
                    Some(waiter) => {
                        if waiter.send(frame).is_err() {
                            debug!(%parent_id, "reply arrived after requester gave up");
                        }
                    }
                    None if frame.status == Status::Error => {
                        warn!(%parent_id, syscall = %frame.syscall, data = %frame.data, "relay rejected frame");
                    }
                    None => debug!(%parent_id, "unmatched reply"),
                }
                return;
            }
        }

        if frame.syscall != SYSCALL_MESSAGE {
            debug!(syscall = %frame.syscall, "ignoring unexpected frame");
            return;
        }

        let Some(topic) = frame.topic.as_deref() else {
            warn!(id = %frame.id, "message frame without topic");
            return;
        };
        let message = match ChannelMessage::from_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(%topic, error = %e, "dropping undecodable message");
                return;
            }
        };
        let routes = self.routes();
        let Some(tx) = routes.get(topic) else {
            debug!(%topic, "message for topic with no subscription");
            return;
        };
        if let Err(e) = tx.try_send(message) {
            warn!(%topic, error = %e, "subscription queue unavailable; dropping message");
        }
    }

    fn close(&self) {
        self.routes().clear();
        self.pending().clear();
    }
}

/// Relay client over one websocket connection.
pub struct WsTransport {
    outbound: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
    capacity: usize,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("capacity", &self.capacity)
            .field("topics", &self.shared.routes().len())
            .finish_non_exhaustive()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl WsTransport {
    /// Connect to a relay websocket endpoint, e.g. `ws://host:3000/ws`.
    ///
    /// `capacity` bounds both the outbound queue and each subscription's
    /// inbound queue.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::WebSocket`] if the handshake fails.
    pub async fn connect(url: &str, capacity: usize) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url).await?;
        let (mut sink, mut source) = stream.split();
        let capacity = capacity.max(1);

        let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(capacity);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let bytes = frames::encode_frame(&frame);
                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                    warn!(error = %e, syscall = %frame.syscall, "relay write failed; closing writer");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "relay sink close failed");
            }
        });

        let shared = Arc::new(Shared::default());
        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Binary(bytes)) => match frames::decode_frame(&bytes) {
                        Ok(frame) => reader_shared.dispatch(frame),
                        Err(e) => warn!(error = %e, "undecodable relay frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "relay read failed");
                        break;
                    }
                }
            }
            info!("relay connection closed");
            reader_shared.close();
        });

        info!(%url, "connected to relay");
        Ok(Self { outbound, shared, capacity, reader })
    }

    async fn request(&self, frame: Frame) -> Result<Frame, TransportError> {
        let id = frame.id.clone();
        let syscall = frame.syscall.clone();
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id.clone(), tx);

        if self.outbound.send(frame).await.is_err() {
            self.shared.pending().remove(&id);
            return Err(TransportError::Closed);
        }

        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending().remove(&id);
                return Err(TransportError::Timeout { syscall });
            }
        };

        if reply.status == Status::Error {
            let message = reply.data.get("message").and_then(serde_json::Value::as_str).unwrap_or("unknown error");
            return Err(TransportError::Rejected { syscall, message: message.to_owned() });
        }
        Ok(reply)
    }
}

#[async_trait]
impl BroadcastTransport for WsTransport {
    async fn subscribe(&self, topic: &str, client_id: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        {
            let mut routes = self.shared.routes();
            if routes.contains_key(topic) {
                return Err(TransportError::AlreadySubscribed { topic: topic.to_owned(), client_id: client_id.to_owned() });
            }
            routes.insert(topic.to_owned(), tx);
        }

        let frame = Frame::request(SYSCALL_SUBSCRIBE, json!({ "client_id": client_id })).with_topic(topic);
        if let Err(e) = self.request(frame).await {
            self.shared.routes().remove(topic);
            return Err(e);
        }

        Ok(Subscription { topic: topic.to_owned(), client_id: client_id.to_owned(), inbound: rx })
    }

    async fn send(&self, topic: &str, client_id: &str, message: ChannelMessage) -> Result<(), TransportError> {
        if !self.shared.routes().contains_key(topic) {
            return Err(TransportError::NotSubscribed { topic: topic.to_owned(), client_id: client_id.to_owned() });
        }
        let mut frame = message.to_frame(topic);
        frame.syscall = SYSCALL_SEND.to_owned();
        self.outbound
            .send(frame.with_from(client_id))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn track(&self, topic: &str, client_id: &str, record: PresenceRecord) -> Result<(), TransportError> {
        let data = json!({ "client_id": client_id, "record": record });
        self.request(Frame::request(SYSCALL_TRACK, data).with_topic(topic)).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, client_id: &str) -> Result<(), TransportError> {
        if self.shared.routes().remove(topic).is_none() {
            return Ok(());
        }
        let frame = Frame::request(SYSCALL_UNSUBSCRIBE, json!({ "client_id": client_id })).with_topic(topic);
        self.request(frame).await?;
        Ok(())
    }
}
