//! Durable, reconnecting event consumer (C2): the state machine in
//! spec.md §4.2, one delivery loop per configured subscription, driven by
//! an abstract [`Transport`] so the WebSocket/long-poll choice never leaks
//! past this module.

use crate::transport::{NakAction, RawEvent, Transport, TransportError};
use async_trait::async_trait;
use metrics::counter;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Ready,
    Delivering,
    Reconnecting,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Begin,
    End,
    Position(u64),
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub subscription_id: String,
    pub stream_name: String,
    pub group_name: String,
    pub start_from: StartFrom,
    pub object_instance_offset: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `-1` (represented as `None`) means unbounded.
    pub max_reconnect_attempts: Option<u32>,
}

/// What the handler decided to do with one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed,
    /// Decode or registry validation rejected the event outright (spec.md
    /// §4.6/§7: "ack and emit counter" / "ack-and-skip"). Acks and advances
    /// the cursor exactly like `Processed`, just without a registry mutation
    /// behind it.
    AckSkip,
    Failed(NakAction),
}

/// Connects a fresh [`Transport`] for a subscription, starting delivery
/// after `after`. Implemented once per binding (WS, HTTP long-poll) so the
/// consumer's reconnect loop stays transport-agnostic.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, after: u64) -> Result<Box<dyn Transport>, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("reconnect attempts exhausted for subscription {0}")]
    ReconnectAttemptsExhausted(String),
}

/// Drives one subscription's delivery loop. `on_event` runs synchronously
/// per event — the consumer does not fetch the next one until it returns,
/// which is the system's sole backpressure mechanism (spec.md §4.2).
pub struct Consumer<F: TransportFactory> {
    config: SubscriptionConfig,
    factory: F,
    state: ConsumerState,
}

impl<F: TransportFactory> Consumer<F> {
    pub fn new(config: SubscriptionConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            state: ConsumerState::Disconnected,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Run until `shutdown` fires or reconnect attempts are exhausted.
    /// `cursor` is the last applied position (the caller reads this from
    /// the cache at startup and updates it as events are applied); `None`
    /// means no cursor has ever been cached, distinct from "applied through
    /// position 0". `start` resolves `max(configured_start, cached_cursor +
    /// 1)` per spec.md §4.2's reconnect discipline, or just `configured`
    /// when nothing is cached yet.
    pub async fn run<Fut>(
        &mut self,
        mut cursor: Option<u64>,
        mut shutdown: watch::Receiver<bool>,
        mut on_event: impl FnMut(RawEvent, u32) -> Fut,
    ) -> Result<(), ConsumerError>
    where
        Fut: std::future::Future<Output = DeliveryOutcome>,
    {
        let mut attempts: u32 = 0;
        let offset = self.config.object_instance_offset;

        loop {
            if *shutdown.borrow() {
                self.state = ConsumerState::Stopping;
                break;
            }

            self.state = ConsumerState::Connecting;
            let start = resolve_start(self.config.start_from, cursor);
            let mut transport = match self.factory.connect(start).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        subscription_id = %self.config.subscription_id,
                        error = %e,
                        attempts,
                        "connect failed"
                    );
                    counter!("gateway_event_store_reconnects_total").increment(1);
                    if self.exhausted(attempts) {
                        self.state = ConsumerState::Stopped;
                        return Err(ConsumerError::ReconnectAttemptsExhausted(
                            self.config.subscription_id.clone(),
                        ));
                    }
                    self.backoff_sleep(attempts, &mut shutdown).await;
                    attempts += 1;
                    self.state = ConsumerState::Reconnecting;
                    continue;
                }
            };
            attempts = 0;
            self.state = ConsumerState::Ready;
            info!(subscription_id = %self.config.subscription_id, start, "subscription ready");

            'delivering: loop {
                if *shutdown.borrow() {
                    self.state = ConsumerState::Stopping;
                    break 'delivering;
                }

                self.state = ConsumerState::Delivering;
                let fetch_after = cursor.unwrap_or_else(|| start.saturating_sub(1));
                let batch = tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        self.state = ConsumerState::Stopping;
                        break 'delivering;
                    }
                    batch = transport.fetch_batch(fetch_after) => batch,
                };

                let events = match batch {
                    Ok(events) => events,
                    Err(e) => {
                        error!(
                            subscription_id = %self.config.subscription_id,
                            error = %e,
                            "transport error, reconnecting"
                        );
                        counter!("gateway_event_store_reconnects_total").increment(1);
                        self.state = ConsumerState::Reconnecting;
                        break 'delivering;
                    }
                };

                for event in events {
                    let position = event.position;
                    match on_event(event, offset).await {
                        DeliveryOutcome::Processed | DeliveryOutcome::AckSkip => {
                            if let Err(e) = transport.ack(position).await {
                                warn!(position, error = %e, "ack failed");
                            } else {
                                cursor = Some(position);
                            }
                        }
                        DeliveryOutcome::Failed(action) => {
                            debug!(position, ?action, "nak");
                            if let Err(e) = transport.nak(position, action).await {
                                warn!(position, error = %e, "nak failed");
                            }
                        }
                    }
                }
                self.state = ConsumerState::Ready;
            }

            if self.state == ConsumerState::Stopping {
                break;
            }
            if self.exhausted(attempts) {
                self.state = ConsumerState::Stopped;
                return Err(ConsumerError::ReconnectAttemptsExhausted(
                    self.config.subscription_id.clone(),
                ));
            }
            self.backoff_sleep(attempts, &mut shutdown).await;
            attempts += 1;
        }

        self.state = ConsumerState::Stopped;
        Ok(())
    }

    fn exhausted(&self, attempts: u32) -> bool {
        matches!(self.config.max_reconnect_attempts, Some(max) if attempts >= max)
    }

    async fn backoff_sleep(&self, attempts: u32, shutdown: &mut watch::Receiver<bool>) {
        let delay = self
            .config
            .base_delay
            .saturating_mul(1u32.checked_shl(attempts).unwrap_or(u32::MAX))
            .min(self.config.max_delay);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }
}

fn resolve_start(start_from: StartFrom, cached_cursor: Option<u64>) -> u64 {
    let configured = match start_from {
        StartFrom::Begin => 0,
        // No cached cursor yet and "end" configured: skip straight to
        // whatever the transport delivers next rather than replaying.
        StartFrom::End => u64::MAX,
        StartFrom::Position(p) => p,
    };
    match cached_cursor {
        // A cached cursor of 0 means position 0 was already applied, so
        // resume strictly after it — distinct from no cursor at all, which
        // must not skip position 0.
        Some(c) => configured.max(c.saturating_add(1)),
        None => configured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_start_takes_the_later_of_configured_and_cached() {
        assert_eq!(resolve_start(StartFrom::Begin, None), 0);
        assert_eq!(resolve_start(StartFrom::Begin, Some(0)), 1);
        assert_eq!(resolve_start(StartFrom::Position(100), Some(41)), 100);
        assert_eq!(resolve_start(StartFrom::Position(10), Some(41)), 42);
    }

    #[test]
    fn backoff_formula_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        let at = |attempts: u32| {
            base.saturating_mul(1u32.checked_shl(attempts).unwrap_or(u32::MAX))
                .min(max)
        };
        assert_eq!(at(0), Duration::from_millis(100));
        assert_eq!(at(1), Duration::from_millis(200));
        assert_eq!(at(2), Duration::from_millis(400));
        assert_eq!(at(10), max);
    }
}
