//! Pipeline supervisor (C6): owns startup/shutdown sequencing, the apply
//! path that decoded messages flow through, and the COV aging tick. Every
//! other module in this crate is a pure building block; this is the one
//! place they're wired together.

use crate::bacnet::MeteredBacnetLayer;
use crate::cache::{CacheError, CacheMirror};
use crate::config::{Config, DeviceSubscriptionConfig, StartFrom as ConfigStartFrom};
use crate::consumer::{Consumer, ConsumerError, DeliveryOutcome, StartFrom, SubscriptionConfig, TransportFactory};
use crate::transport::http_longpoll::{HttpLongPollConfig, HttpLongPollTransport};
use crate::transport::ws::{EventStoreTransport, EventStoreTransportConfig};
use crate::transport::{NakAction, RawEvent, Transport, TransportError};
use async_trait::async_trait;
use gw_core::bacnet::{BacnetObjectLayer, NullBacnetLayer};
use gw_core::cov::CovManager;
use gw_core::object::ObjectId;
use gw_core::registry::Registry;
use gw_protocol::{decode, Message};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Shared mutable state behind one mutex per piece, matching spec.md §5's
/// "registry, cache, and COV table are each protected independently so a
/// slow cache write never blocks COV aging" requirement.
pub(crate) struct Shared {
    pub(crate) registry: Mutex<Registry>,
    pub(crate) cov: Mutex<CovManager>,
    pub(crate) cache: Mutex<CacheMirror>,
    pub(crate) bacnet: Arc<dyn BacnetObjectLayer>,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    config: Config,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Connect the cache, replay its contents into a fresh registry, and
    /// leave the COV table empty (subscriptions do not survive a restart;
    /// spec.md §4.5 treats them as soft state owned by the live process).
    pub async fn startup(config: Config) -> Result<Self, CacheError> {
        let mut cache = CacheMirror::connect(&config.cache).await?;
        let mut registry = Registry::new();
        for record in cache.iterate_objects().await? {
            registry.restore(record);
        }
        info!(objects = registry.len(), "registry restored from cache");

        let bacnet: Arc<dyn BacnetObjectLayer> =
            Arc::new(MeteredBacnetLayer::new(NullBacnetLayer));
        let cov = CovManager::new(config.server.max_cov_subscriptions);

        let shared = Arc::new(Shared {
            registry: Mutex::new(registry),
            cov: Mutex::new(cov),
            cache: Mutex::new(cache),
            bacnet,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            shared,
            config,
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        })
    }

    /// Spawn one consumer task per enabled device subscription plus the COV
    /// aging ticker. Returns once everything is spawned; `join` blocks until
    /// shutdown drains them.
    pub async fn run(&mut self) {
        for device in self.config.devices.iter().filter(|d| d.enabled) {
            let shared = self.shared.clone();
            let device = device.clone();
            let event_store = self.config.event_store.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            let subscription_id = device.subscription_id.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) =
                    run_device_consumer(shared, &device, &event_store, shutdown_rx).await
                {
                    error!(subscription_id = %subscription_id, error = %e, "consumer exited with error");
                }
            });
            self.tasks.push(handle);
        }

        let shared = self.shared.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(cov_tick_loop(shared, shutdown_rx)));
    }

    /// Signal every task to stop and wait for them to drain, then close the
    /// cache connection's owning task (the connection manager is dropped
    /// with `self`).
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("supervisor shutdown complete");
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }
}

async fn cov_tick_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut cov = shared.cov.lock().await;
                cov.tick(1);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// One subscription's full lifecycle: resolve the cached cursor, build the
/// right transport factory for the configured event-store URL, and hand
/// both to [`Consumer::run`].
async fn run_device_consumer(
    shared: Arc<Shared>,
    device: &DeviceSubscriptionConfig,
    event_store: &crate::config::EventStoreConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ConsumerError> {
    // `None` here means no cursor has ever been cached, distinct from
    // "applied through position 0" — both `Consumer::run` and
    // `resolve_start` need that distinction to avoid skipping a genuine
    // event at position 0 (spec.md §4.2).
    let cached_cursor = {
        let mut cache = shared.cache.lock().await;
        cache
            .get_cursor(&device.subscription_id)
            .await
            .unwrap_or(None)
    };

    let start_from = match device.start_from {
        ConfigStartFrom::Begin => StartFrom::Begin,
        ConfigStartFrom::End => StartFrom::End,
        ConfigStartFrom::Position => StartFrom::Position(device.start_position),
    };

    let sub_config = SubscriptionConfig {
        subscription_id: device.subscription_id.clone(),
        stream_name: device.stream_name.clone(),
        group_name: device.group_name.clone(),
        start_from,
        object_instance_offset: device.object_instance_offset,
        base_delay: Duration::from_millis(event_store.reconnect_delay_ms),
        max_delay: Duration::from_secs(60),
        max_reconnect_attempts: event_store.max_reconnect_attempts,
    };

    let factory = GatewayTransportFactory {
        connection_string: event_store.connection_string.clone(),
        subscription_id: device.subscription_id.clone(),
        stream_name: device.stream_name.clone(),
        group_name: device.group_name.clone(),
    };

    let shared_for_events = shared.clone();
    let subscription_id = device.subscription_id.clone();
    let mut consumer = Consumer::new(sub_config, factory);
    consumer
        .run(cached_cursor, shutdown, move |event, offset| {
            let shared = shared_for_events.clone();
            let subscription_id = subscription_id.clone();
            async move { apply_event(&shared, &subscription_id, event, offset).await }
        })
        .await
}

/// Picks the transport binding from the event-store connection string's
/// scheme: `ws://`/`wss://` gets the native streaming client, anything else
/// falls back to HTTP long-poll.
struct GatewayTransportFactory {
    connection_string: String,
    subscription_id: String,
    stream_name: String,
    group_name: String,
}

#[async_trait]
impl TransportFactory for GatewayTransportFactory {
    async fn connect(&self, after: u64) -> Result<Box<dyn Transport>, TransportError> {
        if self.connection_string.starts_with("ws://") || self.connection_string.starts_with("wss://") {
            let cfg = EventStoreTransportConfig {
                url: self.connection_string.clone(),
                subscription_id: self.subscription_id.clone(),
                stream_name: self.stream_name.clone(),
                group_name: self.group_name.clone(),
            };
            let transport = EventStoreTransport::connect(&cfg, after).await?;
            Ok(Box::new(transport))
        } else {
            let cfg = HttpLongPollConfig {
                base_url: self.connection_string.clone(),
                stream_name: self.stream_name.clone(),
                poll_timeout: Duration::from_secs(30),
            };
            let transport = HttpLongPollTransport::new(&cfg)?;
            Ok(Box::new(transport))
        }
    }
}

/// The apply path (spec.md §4.4): decode, apply to the registry, mirror to
/// cache, notify COV subscribers, persist the cursor — in that order, so a
/// crash between any two steps leaves the cache at-or-behind the registry,
/// never ahead of it.
async fn apply_event(
    shared: &Arc<Shared>,
    subscription_id: &str,
    event: RawEvent,
    offset: u32,
) -> DeliveryOutcome {
    let started = Instant::now();
    let outcome = apply_event_inner(shared, subscription_id, event, offset).await;
    histogram!("gateway_processing_latency_ms").record(started.elapsed().as_secs_f64() * 1000.0);
    outcome
}

async fn apply_event_inner(
    shared: &Arc<Shared>,
    subscription_id: &str,
    event: RawEvent,
    offset: u32,
) -> DeliveryOutcome {
    let message = match decode(&event.payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(subscription_id, position = event.position, error = %e, "decode failed, skipping event");
            counter!("gateway_decode_errors_total").increment(1);
            // spec.md §4.6: "on decode error: ack and emit counter" — not a
            // nak, or an unparseable event at the head of the stream with
            // nothing valid behind it would be re-fetched and re-rejected
            // forever.
            return ack_skip(shared, subscription_id, event.position).await;
        }
    };

    let result = apply_message(shared, message, offset).await;
    match result {
        Ok(()) => {
            persist_cursor(shared, subscription_id, event.position).await;
            DeliveryOutcome::Processed
        }
        Err(ApplyError::Skip(e)) => {
            warn!(subscription_id, position = event.position, error = %e, "registry rejected event, ack-and-skip");
            counter!("gateway_apply_errors_total", "kind" => "skip").increment(1);
            ack_skip(shared, subscription_id, event.position).await
        }
        Err(ApplyError::Retry(e)) => {
            warn!(subscription_id, position = event.position, error = %e, "cache failure, nak-retry");
            counter!("gateway_apply_errors_total", "kind" => "retry").increment(1);
            DeliveryOutcome::Failed(NakAction::Retry)
        }
    }
}

/// Persist the subscription cursor past `position` and ack it. Shared by
/// the success path and every ack-and-skip path (decode errors, registry
/// validation errors) — spec.md §8's cursor invariant covers events that
/// were "applied to the registry or ack-and-skipped by the decoder" alike,
/// so both must advance the cursor the same way.
async fn persist_cursor(shared: &Arc<Shared>, subscription_id: &str, position: u64) {
    let mut cache = shared.cache.lock().await;
    if let Err(e) = cache.put_cursor(subscription_id, position).await {
        warn!(subscription_id, error = %e, "failed to persist cursor");
        counter!("gateway_cache_errors_total", "op" => "put_cursor").increment(1);
    }
}

async fn ack_skip(shared: &Arc<Shared>, subscription_id: &str, position: u64) -> DeliveryOutcome {
    persist_cursor(shared, subscription_id, position).await;
    DeliveryOutcome::AckSkip
}

/// Every decode/registry rejection is ack-and-skip; every cache failure
/// (transient or permanent) is nak-retry. Spec.md §7 has no category that
/// maps to park/dead-letter in the apply path — `NakAction::Park` exists
/// for the transport-level enum but this pipeline never produces it.
enum ApplyError {
    Skip(String),
    Retry(String),
}

async fn apply_message(shared: &Arc<Shared>, message: Message, offset: u32) -> Result<(), ApplyError> {
    match message {
        Message::ObjectDefinition(_envelope, def) => {
            let mut registry = shared.registry.lock().await;
            let id = registry
                .apply_definition(&def, offset, shared.bacnet.as_ref())
                .map_err(classify_registry_error)?;
            let record = registry.get(id).expect("just inserted").clone();
            drop(registry);
            mirror_and_log(shared, id, &record).await
        }
        Message::ValueUpdate(_envelope, update) => {
            let mut registry = shared.registry.lock().await;
            let outcome = registry
                .apply_value(&update, offset, shared.bacnet.as_ref())
                .map_err(classify_registry_error)?;
            drop(registry);

            // spec.md §4.4 orders the three side effects of apply_value:
            // in-memory write (above) first, cache mirror second, COV
            // notification third — so a cache failure never leaves a
            // notification sent for state that wasn't durably mirrored.
            mirror_and_log(shared, outcome.object_id, &outcome.record).await?;

            if outcome.should_notify {
                let mut cov = shared.cov.lock().await;
                let now = outcome.record.last_update;
                cov.notify(outcome.object_id, &outcome.record, shared.bacnet.as_ref(), now);
                drop(cov);

                let mut cache = shared.cache.lock().await;
                if let Err(e) = cache.publish_change(outcome.object_id).await {
                    warn!(object = %outcome.object_id, error = %e, "publish_change failed, continuing");
                    counter!("gateway_cache_errors_total", "op" => "publish_change").increment(1);
                }
            }
            Ok(())
        }
        Message::ObjectDelete(_envelope, del) => {
            let mut registry = shared.registry.lock().await;
            let mut cov = shared.cov.lock().await;
            let id_before = ObjectId::new(del.delete.object_type, del.delete.object_instance);
            registry
                .apply_delete(&del.delete, offset, shared.bacnet.as_ref(), &mut cov)
                .map_err(classify_registry_error)?;
            drop(cov);
            drop(registry);
            let mut cache = shared.cache.lock().await;
            let id = ObjectId::new(
                id_before.object_type,
                id_before.object_instance.checked_add(offset).unwrap_or(id_before.object_instance),
            );
            cache.delete_object(id).await.map_err(classify_cache_error)
        }
        Message::DeviceConfig(_envelope, cfg) => {
            let mut cache = shared.cache.lock().await;
            for (field, value) in device_config_fields(&cfg) {
                cache
                    .put_device_config_field(field, &value)
                    .await
                    .map_err(classify_cache_error)?;
            }
            Ok(())
        }
    }
}

async fn mirror_and_log(
    shared: &Arc<Shared>,
    id: ObjectId,
    record: &gw_core::object::ObjectRecord,
) -> Result<(), ApplyError> {
    let mut cache = shared.cache.lock().await;
    cache.put_object(record).await.map_err(classify_cache_error)?;
    drop(cache);
    info!(object = %id, "applied");
    Ok(())
}

/// Registry errors — kind mismatch, out-of-range, not-found — are all
/// structural rejections of one event, never a reason to dead-letter it:
/// spec.md §7 calls for "log at warn, count, ack-and-skip" across the board.
fn classify_registry_error(e: gw_core::registry::RegistryError) -> ApplyError {
    ApplyError::Skip(e.to_string())
}

/// Both cache failure kinds nak-retry: spec.md §7 treats "cache transient"
/// and "cache permanent (authentication, malformed reply)" as two distinct
/// alert-worthy conditions, but the same retry action — the permanent case
/// additionally gets its own counter so operators can alert on it separately
/// from routine transient retries.
fn classify_cache_error(e: CacheError) -> ApplyError {
    match e {
        CacheError::Transient(s) => ApplyError::Retry(s),
        CacheError::Permanent(s) => {
            counter!("gateway_cache_permanent_errors_total").increment(1);
            ApplyError::Retry(s)
        }
    }
}

fn device_config_fields(cfg: &gw_protocol::DeviceConfigUpdate) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    if let Some(v) = cfg.device_instance {
        fields.push(("device_instance", v.to_string()));
    }
    if let Some(v) = &cfg.device_name {
        fields.push(("device_name", v.clone()));
    }
    if let Some(v) = &cfg.device_description {
        fields.push(("device_description", v.clone()));
    }
    if let Some(v) = cfg.vendor_id {
        fields.push(("vendor_id", v.to_string()));
    }
    if let Some(v) = &cfg.vendor_name {
        fields.push(("vendor_name", v.clone()));
    }
    if let Some(v) = &cfg.model_name {
        fields.push(("model_name", v.clone()));
    }
    if let Some(v) = &cfg.application_software_version {
        fields.push(("application_software_version", v.clone()));
    }
    if let Some(v) = &cfg.location {
        fields.push(("location", v.clone()));
    }
    if let Some(v) = cfg.cov_lifetime {
        fields.push(("cov_lifetime", v.to_string()));
    }
    if let Some(v) = cfg.max_cov_subscriptions {
        fields.push(("max_cov_subscriptions", v.to_string()));
    }
    fields
}
