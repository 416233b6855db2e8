//! HTTP long-poll binding for the event consumer — the fallback transport
//! for event-store deployments with no native streaming client available.

use super::{NakAction, RawEvent, Transport, TransportError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpLongPollConfig {
    pub base_url: String,
    pub stream_name: String,
    pub poll_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    position: u64,
    payload: serde_json::Value,
}

pub struct HttpLongPollTransport {
    client: reqwest::Client,
    base_url: String,
    stream_name: String,
}

impl HttpLongPollTransport {
    pub fn new(cfg: &HttpLongPollConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.poll_timeout)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.clone(),
            stream_name: cfg.stream_name.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpLongPollTransport {
    async fn fetch_batch(&mut self, cursor: u64) -> Result<Vec<RawEvent>, TransportError> {
        let url = format!(
            "{}/streams/{}/events?after={}",
            self.base_url, self.stream_name, cursor
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        if !resp.status().is_success() {
            return Err(TransportError::Protocol(format!(
                "unexpected status {} from {}",
                resp.status(),
                url
            )));
        }
        let body: EventsResponse = resp.json().await.map_err(classify_reqwest_error)?;
        Ok(body
            .events
            .into_iter()
            .map(|e| RawEvent {
                position: e.position,
                payload: serde_json::to_vec(&e.payload).unwrap_or_default(),
            })
            .collect())
    }

    async fn ack(&mut self, position: u64) -> Result<(), TransportError> {
        let url = format!("{}/streams/{}/ack", self.base_url, self.stream_name);
        self.client
            .post(&url)
            .json(&serde_json::json!({ "position": position }))
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        Ok(())
    }

    async fn nak(&mut self, position: u64, action: NakAction) -> Result<(), TransportError> {
        let action_str = match action {
            NakAction::Retry => "retry",
            NakAction::Skip => "skip",
            NakAction::Park => "park",
        };
        let url = format!("{}/streams/{}/nak", self.base_url, self.stream_name);
        self.client
            .post(&url)
            .json(&serde_json::json!({ "position": position, "action": action_str }))
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        Ok(())
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Protocol(e.to_string())
    }
}
