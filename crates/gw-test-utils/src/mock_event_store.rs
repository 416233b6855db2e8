// mock_event_store: a mock event-store WebSocket endpoint for exercising
// the gateway's reconnecting consumer and WS transport without a real
// streaming backend.
//
// Speaks the same tagged-JSON protocol as `EventStoreTransport`: accepts a
// `subscribe_request`, replies `subscription_ready`, then forwards whatever
// batches the test pushes via `push_batch` as `event_batch` messages. Acks
// and naks sent back by the client are recorded for assertions.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;

#[derive(Debug, Clone, Serialize)]
struct WireEventOut {
    position: u64,
    payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ServerMessage {
    SubscriptionReady,
    EventBatch { events: Vec<WireEventOut> },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ClientMessage {
    SubscribeRequest {
        #[allow(dead_code)]
        subscription_id: String,
        #[allow(dead_code)]
        stream_name: String,
        #[allow(dead_code)]
        group_name: String,
        after: u64,
    },
    EventAck {
        position: u64,
        #[allow(dead_code)]
        subscription_id: String,
    },
    EventNak {
        position: u64,
        action: String,
        #[allow(dead_code)]
        subscription_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedAck {
    Ack(u64),
    Nak(u64, String),
}

/// A queued batch, sent the first time a client subscribes at or below its
/// lowest position, or pushed live via [`MockEventStoreServer::push_batch`].
type OutboundTx = mpsc::UnboundedSender<Vec<WireEventOut>>;

pub struct MockEventStoreServer {
    addr: SocketAddr,
    outbound: Arc<Mutex<Option<OutboundTx>>>,
    acks: Arc<Mutex<Vec<RecordedAck>>>,
    last_subscribed_after: Arc<Mutex<Option<u64>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockEventStoreServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let outbound: Arc<Mutex<Option<OutboundTx>>> = Arc::new(Mutex::new(None));
        let acks = Arc::new(Mutex::new(Vec::new()));
        let last_subscribed_after = Arc::new(Mutex::new(None));

        let outbound_for_task = outbound.clone();
        let acks_for_task = acks.clone();
        let after_for_task = last_subscribed_after.clone();
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, outbound_for_task, acks_for_task, after_for_task).await;
        });

        Ok(Self {
            addr,
            outbound,
            acks,
            last_subscribed_after,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Push a batch of `(position, payload)` events to the currently
    /// connected client, if any. No-op (silently dropped) if nothing has
    /// subscribed yet — tests should await subscription first.
    pub async fn push_batch(&self, events: Vec<(u64, Value)>) {
        let guard = self.outbound.lock().await;
        if let Some(tx) = guard.as_ref() {
            let wire = events
                .into_iter()
                .map(|(position, payload)| WireEventOut { position, payload })
                .collect();
            let _ = tx.send(wire);
        }
    }

    pub async fn acks(&self) -> Vec<RecordedAck> {
        self.acks.lock().await.clone()
    }

    pub async fn last_subscribed_after(&self) -> Option<u64> {
        *self.last_subscribed_after.lock().await
    }

    async fn accept_loop(
        listener: TcpListener,
        outbound: Arc<Mutex<Option<OutboundTx>>>,
        acks: Arc<Mutex<Vec<RecordedAck>>>,
        last_subscribed_after: Arc<Mutex<Option<u64>>>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let outbound = outbound.clone();
                    let acks = acks.clone();
                    let last_subscribed_after = last_subscribed_after.clone();
                    tokio::spawn(async move {
                        let _ = Self::handle_connection(stream, outbound, acks, last_subscribed_after).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        outbound: Arc<Mutex<Option<OutboundTx>>>,
        acks: Arc<Mutex<Vec<RecordedAck>>>,
        last_subscribed_after: Arc<Mutex<Option<u64>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<WireEventOut>>();
        *outbound.lock().await = Some(tx);

        let mut subscribed = false;

        loop {
            tokio::select! {
                incoming = read.next() => {
                    let msg = match incoming {
                        Some(Ok(m)) => m,
                        _ => break,
                    };
                    let text = match msg {
                        Message::Text(t) => t,
                        Message::Close(_) => break,
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        _ => continue,
                    };
                    let parsed: ClientMessage = serde_json::from_str(&text)?;
                    match parsed {
                        ClientMessage::SubscribeRequest { after, .. } => {
                            *last_subscribed_after.lock().await = Some(after);
                            subscribed = true;
                            let ready = serde_json::to_string(&ServerMessage::SubscriptionReady)?;
                            write.send(Message::Text(ready.into())).await?;
                        }
                        ClientMessage::EventAck { position, .. } => {
                            acks.lock().await.push(RecordedAck::Ack(position));
                        }
                        ClientMessage::EventNak { position, action, .. } => {
                            acks.lock().await.push(RecordedAck::Nak(position, action));
                        }
                    }
                }
                batch = rx.recv(), if subscribed => {
                    match batch {
                        Some(events) => {
                            let msg = serde_json::to_string(&ServerMessage::EventBatch { events })?;
                            write.send(Message::Text(msg.into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }
}
