//! Abstract transport seam for the event consumer (C2).
//!
//! Two concrete bindings exist — [`ws::EventStoreTransport`] (a persistent
//! WebSocket client) and [`http_longpoll::HttpLongPollTransport`] — and the
//! consumer never sees which one it is talking to. Trait objects need
//! `async-trait` since these methods must be callable through `Box<dyn
//! Transport>`.

pub mod http_longpoll;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakAction {
    Retry,
    Skip,
    Park,
}

/// One raw event as delivered by the transport, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub position: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport protocol error: {0}")]
    Protocol(String),
    #[error("transport disconnected")]
    Disconnected,
    #[error("transport timed out")]
    Timeout,
}

/// "Fetch next batch since cursor", "emit acknowledgement" — the consumer
/// drives this trait and knows nothing about WebSockets or HTTP long-poll.
#[async_trait]
pub trait Transport: Send {
    /// Fetch events strictly after `cursor`, in increasing stream position.
    /// An empty result means "caught up for now", not an error.
    async fn fetch_batch(&mut self, cursor: u64) -> Result<Vec<RawEvent>, TransportError>;

    async fn ack(&mut self, position: u64) -> Result<(), TransportError>;

    async fn nak(&mut self, position: u64, action: NakAction) -> Result<(), TransportError>;
}
