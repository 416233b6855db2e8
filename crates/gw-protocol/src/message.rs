//! The four typed messages the decoder produces, plus the shared envelope
//! fields every one of them carries.

use gw_core::{ObjectDelete, ValueUpdate};
use gw_core::registry::ObjectDefinition;

/// Fields common to every event envelope, independent of `messageType`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source_id: String,
    /// UTC milliseconds since epoch, if the envelope carried a `timestamp`.
    pub timestamp_ms: Option<i64>,
    pub correlation_id: Option<String>,
    pub stream_position: Option<u64>,
}

/// `DeviceConfig` has no counterpart in `gw_core` because it mutates
/// device-level attributes rather than an object; every field replaces the
/// corresponding attribute when present, per spec.md §4.3.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceConfigUpdate {
    pub device_instance: Option<u32>,
    pub device_name: Option<String>,
    pub device_description: Option<String>,
    pub vendor_id: Option<u16>,
    pub vendor_name: Option<String>,
    pub model_name: Option<String>,
    pub application_software_version: Option<String>,
    pub location: Option<String>,
    pub cov_lifetime: Option<u32>,
    pub max_cov_subscriptions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDeleteMessage {
    pub delete: ObjectDelete,
    pub reason: Option<String>,
}

/// One decoded event, still carrying its envelope for the caller to log
/// and to drive cursor bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ObjectDefinition(Envelope, ObjectDefinition),
    ValueUpdate(Envelope, ValueUpdate),
    ObjectDelete(Envelope, ObjectDeleteMessage),
    DeviceConfig(Envelope, DeviceConfigUpdate),
}

impl Message {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Message::ObjectDefinition(e, _)
            | Message::ValueUpdate(e, _)
            | Message::ObjectDelete(e, _)
            | Message::DeviceConfig(e, _) => e,
        }
    }
}
