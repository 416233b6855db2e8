//! Native WebSocket binding for the event consumer, modeled on the
//! forwarder/receiver uplink session handshake: connect, send a hello,
//! receive a ready/ack, then exchange batches and acks for the life of the
//! connection.

use super::{NakAction, RawEvent, Transport, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct EventStoreTransportConfig {
    pub url: String,
    pub subscription_id: String,
    pub stream_name: String,
    pub group_name: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutboundMessage<'a> {
    SubscribeRequest {
        subscription_id: &'a str,
        stream_name: &'a str,
        group_name: &'a str,
        after: u64,
    },
    EventAck {
        subscription_id: &'a str,
        position: u64,
    },
    EventNak {
        subscription_id: &'a str,
        position: u64,
        action: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum InboundMessage {
    SubscriptionReady,
    EventBatch { events: Vec<WireEvent> },
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    position: u64,
    payload: serde_json::Value,
}

pub struct EventStoreTransport {
    ws: WsStream,
    subscription_id: String,
}

impl EventStoreTransport {
    pub async fn connect(cfg: &EventStoreTransportConfig, after: u64) -> Result<Self, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(&cfg.url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut transport = Self {
            ws,
            subscription_id: cfg.subscription_id.clone(),
        };

        let subscribe = OutboundMessage::SubscribeRequest {
            subscription_id: &cfg.subscription_id,
            stream_name: &cfg.stream_name,
            group_name: &cfg.group_name,
            after,
        };
        transport.send(&subscribe).await?;

        match transport.recv().await? {
            InboundMessage::SubscriptionReady => Ok(transport),
            InboundMessage::Error { message } => Err(TransportError::Protocol(message)),
            other => Err(TransportError::Protocol(format!(
                "expected subscription_ready, got {other:?}"
            ))),
        }
    }

    async fn send(&mut self, msg: &OutboundMessage<'_>) -> Result<(), TransportError> {
        let json = serde_json::to_string(msg)
            .map_err(|e| TransportError::Protocol(format!("serializing outbound message: {e}")))?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn recv(&mut self) -> Result<InboundMessage, TransportError> {
        loop {
            match self.ws.next().await {
                None => return Err(TransportError::Disconnected),
                Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
                Some(Ok(Message::Text(t))) => {
                    return serde_json::from_str(&t)
                        .map_err(|e| TransportError::Protocol(format!("decoding inbound message: {e}")));
                }
                Some(Ok(Message::Close(_))) => return Err(TransportError::Disconnected),
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                    continue;
                }
                Some(Ok(_)) => continue,
            }
        }
    }
}

#[async_trait]
impl Transport for EventStoreTransport {
    async fn fetch_batch(&mut self, _cursor: u64) -> Result<Vec<RawEvent>, TransportError> {
        // The server pushes batches unsolicited once subscribed; the
        // consumer's delivery loop calls fetch_batch to await the next one.
        match self.recv().await? {
            InboundMessage::EventBatch { events } => Ok(events
                .into_iter()
                .map(|e| RawEvent {
                    position: e.position,
                    payload: serde_json::to_vec(&e.payload).unwrap_or_default(),
                })
                .collect()),
            InboundMessage::Error { message } => Err(TransportError::Protocol(message)),
            other => {
                debug!(?other, "unexpected message while awaiting event batch");
                Ok(Vec::new())
            }
        }
    }

    async fn ack(&mut self, position: u64) -> Result<(), TransportError> {
        let msg = OutboundMessage::EventAck {
            subscription_id: &self.subscription_id,
            position,
        };
        self.send(&msg).await
    }

    async fn nak(&mut self, position: u64, action: NakAction) -> Result<(), TransportError> {
        let action_str = match action {
            NakAction::Retry => "retry",
            NakAction::Skip => "skip",
            NakAction::Park => "park",
        };
        let msg = OutboundMessage::EventNak {
            subscription_id: &self.subscription_id,
            position,
            action: action_str,
        };
        self.send(&msg).await?;
        warn!(position, action = action_str, "nak sent to event store");
        Ok(())
    }
}
