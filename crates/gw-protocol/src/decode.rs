//! JSON envelope decoding: `serde_json::Value` walked by hand so that every
//! error carries the JSON-pointer-style field path that produced it.

use crate::message::{DeviceConfigUpdate, Envelope, Message, ObjectDeleteMessage};
use chrono::{DateTime, FixedOffset};
use gw_core::object::{MultiStateMeta, ObjectType, PresentValue, StatusFlags, ValueKind};
use gw_core::registry::{ObjectDefinition, ObjectDelete, ValueUpdate};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid_json: {0}")]
    InvalidJson(String),
    #[error("missing_field: {0}")]
    MissingField(String),
    #[error("invalid_type: {0}")]
    InvalidType(String),
    #[error("invalid_value: {0}")]
    InvalidValue(String),
    #[error("unknown_message_type: {0}")]
    UnknownMessageType(String),
}

/// Decode one raw event payload into a [`Message`]. Never panics; every
/// malformed input maps to a [`DecodeError`] variant, which the consumer
/// treats as a permanent failure of that single event (ack-and-skip).
pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
    let root: Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let obj = root
        .as_object()
        .ok_or_else(|| DecodeError::InvalidType("root: expected object".to_owned()))?;

    let message_type = require_str(obj, "messageType", "")?;
    let source_id = require_str(obj, "sourceId", "")?;
    let timestamp_ms = match obj.get("timestamp") {
        Some(Value::String(s)) => Some(parse_timestamp(s, "timestamp")?),
        Some(Value::Null) | None => None,
        Some(_) => return Err(DecodeError::InvalidType("timestamp: expected string".to_owned())),
    };
    let correlation_id = optional_str(obj, "correlationId")?;
    let stream_position = optional_u64(obj, "streamPosition")?;

    let envelope = Envelope {
        source_id: source_id.to_owned(),
        timestamp_ms,
        correlation_id,
        stream_position,
    };

    let payload_obj = obj
        .get("payload")
        .and_then(Value::as_object)
        .ok_or_else(|| DecodeError::MissingField("payload".to_owned()))?;

    match message_type {
        "ObjectDefinition" => {
            let def = decode_object_definition(payload_obj, &envelope)?;
            Ok(Message::ObjectDefinition(envelope, def))
        }
        "ValueUpdate" => {
            let update = decode_value_update(payload_obj, &envelope)?;
            Ok(Message::ValueUpdate(envelope, update))
        }
        "ObjectDelete" => {
            let msg = decode_object_delete(payload_obj)?;
            Ok(Message::ObjectDelete(envelope, msg))
        }
        "DeviceConfig" => {
            let cfg = decode_device_config(payload_obj)?;
            Ok(Message::DeviceConfig(envelope, cfg))
        }
        other => Err(DecodeError::UnknownMessageType(other.to_owned())),
    }
}

fn decode_object_definition(
    p: &serde_json::Map<String, Value>,
    envelope: &Envelope,
) -> Result<ObjectDefinition, DecodeError> {
    let object_type = require_object_type(p, "payload.objectType")?;
    let object_instance = require_u32(p, "payload.objectInstance")?;
    let object_name = require_str(p, "objectName", "payload.")?.to_owned();
    let present_value_type = require_str(p, "presentValueType", "payload.")?;

    let value_kind = object_type
        .intrinsic_value_kind()
        .or_else(|| ValueKind::try_from(present_value_type).ok())
        .ok_or_else(|| {
            DecodeError::InvalidValue(format!(
                "payload.presentValueType: unknown '{present_value_type}'"
            ))
        })?;

    let description = optional_str(p, "description")?;
    let units = optional_u16(p, "units")?;
    let units_text = optional_str(p, "unitsText")?;
    let cov_increment = optional_f32(p, "covIncrement")?;
    let min_value = optional_f32(p, "minPresentValue")?;
    let max_value = optional_f32(p, "maxPresentValue")?;
    let state_texts = optional_state_texts(p, "stateTexts")?;
    let inactive_text = optional_str(p, "inactiveText")?;
    let active_text = optional_str(p, "activeText")?;
    let initial_value = match p.get("initialValue") {
        Some(v) if !v.is_null() => Some(coerce_present_value(v, value_kind, "payload.initialValue")?),
        _ => None,
    };

    Ok(ObjectDefinition {
        object_type,
        object_instance,
        object_name,
        description,
        value_kind,
        units,
        units_text,
        cov_increment,
        min_value,
        max_value,
        state_texts,
        inactive_text,
        active_text,
        initial_value,
        source_id: envelope.source_id.clone(),
        stream_position: envelope.stream_position.unwrap_or(0),
    })
}

fn decode_value_update(
    p: &serde_json::Map<String, Value>,
    envelope: &Envelope,
) -> Result<ValueUpdate, DecodeError> {
    let object_type = require_object_type(p, "payload.objectType")?;
    let object_instance = require_u32(p, "payload.objectInstance")?;
    let value_kind = object_type.intrinsic_value_kind().unwrap_or(ValueKind::Real);
    let raw_value = p
        .get("presentValue")
        .ok_or_else(|| DecodeError::MissingField("payload.presentValue".to_owned()))?;
    let present_value = coerce_present_value(raw_value, value_kind, "payload.presentValue")?;

    let status_flags = match p.get("statusFlags") {
        Some(Value::Object(flags)) => Some(decode_status_flags(flags)?),
        Some(Value::Null) | None => None,
        Some(_) => {
            return Err(DecodeError::InvalidType(
                "payload.statusFlags: expected object".to_owned(),
            ))
        }
    };
    let reliability = optional_u8(p, "reliability")?;
    let event_state = optional_u8(p, "eventState")?;

    Ok(ValueUpdate {
        object_type,
        object_instance,
        present_value,
        status_flags,
        reliability,
        event_state,
        source_id: envelope.source_id.clone(),
        last_update: envelope
            .timestamp_ms
            .map(|ms| (ms / 1000) as u64)
            .unwrap_or(0),
        stream_position: envelope.stream_position.unwrap_or(0),
        clamp_out_of_range: false,
    })
}

fn decode_object_delete(
    p: &serde_json::Map<String, Value>,
) -> Result<ObjectDeleteMessage, DecodeError> {
    let object_type = require_object_type(p, "payload.objectType")?;
    let object_instance = require_u32(p, "payload.objectInstance")?;
    let reason = optional_str(p, "reason")?;
    Ok(ObjectDeleteMessage {
        delete: ObjectDelete {
            object_type,
            object_instance,
        },
        reason,
    })
}

fn decode_device_config(
    p: &serde_json::Map<String, Value>,
) -> Result<DeviceConfigUpdate, DecodeError> {
    Ok(DeviceConfigUpdate {
        device_instance: optional_u32(p, "deviceInstance")?,
        device_name: optional_str(p, "deviceName")?,
        device_description: optional_str(p, "deviceDescription")?,
        vendor_id: optional_u16(p, "vendorId")?,
        vendor_name: optional_str(p, "vendorName")?,
        model_name: optional_str(p, "modelName")?,
        application_software_version: optional_str(p, "applicationSoftwareVersion")?,
        location: optional_str(p, "location")?,
        cov_lifetime: optional_u32(p, "covLifetime")?,
        max_cov_subscriptions: optional_u32(p, "maxCovSubscriptions")?,
    })
}

fn decode_status_flags(flags: &serde_json::Map<String, Value>) -> Result<StatusFlags, DecodeError> {
    Ok(StatusFlags {
        in_alarm: optional_bool(flags, "inAlarm")?.unwrap_or(false),
        fault: optional_bool(flags, "fault")?.unwrap_or(false),
        overridden: optional_bool(flags, "overridden")?.unwrap_or(false),
        out_of_service: optional_bool(flags, "outOfService")?.unwrap_or(false),
    })
}

fn coerce_present_value(
    v: &Value,
    kind: ValueKind,
    path: &str,
) -> Result<PresentValue, DecodeError> {
    match kind {
        ValueKind::Real => v
            .as_f64()
            .map(|f| PresentValue::Real(f as f32))
            .ok_or_else(|| DecodeError::InvalidType(format!("{path}: expected number"))),
        ValueKind::Unsigned => v
            .as_u64()
            .map(|u| PresentValue::Unsigned(u as u32))
            .ok_or_else(|| DecodeError::InvalidType(format!("{path}: expected non-negative integer"))),
        ValueKind::Signed => v
            .as_i64()
            .map(|i| PresentValue::Signed(i as i32))
            .ok_or_else(|| DecodeError::InvalidType(format!("{path}: expected integer"))),
        ValueKind::Boolean => v
            .as_bool()
            .map(PresentValue::Boolean)
            .ok_or_else(|| DecodeError::InvalidType(format!("{path}: expected boolean"))),
        ValueKind::Enumerated => v
            .as_u64()
            .map(|u| PresentValue::Enumerated(u as u32))
            .ok_or_else(|| DecodeError::InvalidType(format!("{path}: expected non-negative integer"))),
    }
}

fn require_object_type(
    p: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<ObjectType, DecodeError> {
    let s = p
        .get("objectType")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::MissingField(path.to_owned()))?;
    ObjectType::try_from(s).map_err(|_| DecodeError::InvalidValue(format!("{path}: '{s}'")))
}

fn require_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    key: &str,
    prefix: &str,
) -> Result<&'a str, DecodeError> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::MissingField(format!("{prefix}{key}")))
}

fn require_u32(p: &serde_json::Map<String, Value>, path: &str) -> Result<u32, DecodeError> {
    let key = path.rsplit('.').next().unwrap_or(path);
    p.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| DecodeError::MissingField(path.to_owned()))
}

fn optional_str(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<String>, DecodeError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(DecodeError::InvalidType(format!("{key}: expected string"))),
    }
}

fn optional_bool(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<bool>, DecodeError> {
    match obj.get(key) {
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(DecodeError::InvalidType(format!("{key}: expected boolean"))),
    }
}

fn optional_u64(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<u64>, DecodeError> {
    match obj.get(key) {
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| DecodeError::InvalidType(format!("{key}: expected non-negative integer"))),
        None => Ok(None),
    }
}

fn optional_u32(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<u32>, DecodeError> {
    Ok(optional_u64(obj, key)?.map(|v| v as u32))
}

fn optional_u16(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<u16>, DecodeError> {
    Ok(optional_u64(obj, key)?.map(|v| v as u16))
}

fn optional_u8(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<u8>, DecodeError> {
    Ok(optional_u64(obj, key)?.map(|v| v as u8))
}

fn optional_f32(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<f32>, DecodeError> {
    match obj.get(key) {
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(|f| Some(f as f32))
            .ok_or_else(|| DecodeError::InvalidType(format!("{key}: expected number"))),
        None => Ok(None),
    }
}

fn optional_state_texts(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, DecodeError> {
    match obj.get(key) {
        Some(Value::Array(items)) => {
            if items.len() > MultiStateMeta::MAX_STATES {
                return Err(DecodeError::InvalidValue(format!(
                    "{key}: at most {} entries",
                    MultiStateMeta::MAX_STATES
                )));
            }
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let s = item
                    .as_str()
                    .ok_or_else(|| DecodeError::InvalidType(format!("{key}[{i}]: expected string")))?;
                out.push(s.to_owned());
            }
            Ok(Some(out))
        }
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(DecodeError::InvalidType(format!("{key}: expected array"))),
    }
}

/// Accepts ISO-8601 with up to 3 fractional-second digits and either `Z` or
/// a `±HH:MM` offset (`-00:00` is treated as UTC); anything else is
/// rejected rather than guessed at.
fn parse_timestamp(s: &str, field: &str) -> Result<i64, DecodeError> {
    let parsed: DateTime<FixedOffset> = DateTime::parse_from_rfc3339(s)
        .map_err(|e| DecodeError::InvalidValue(format!("{field}: {e}")))?;
    Ok(parsed.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_update_matches_scenario_1() {
        let def_json = br#"{"messageType":"ObjectDefinition","sourceId":"s1","payload":{"objectType":"analog-input","objectInstance":1,"objectName":"T","presentValueType":"real","covIncrement":0.5,"initialValue":20.0}}"#;
        let msg = decode(def_json).unwrap();
        match msg {
            Message::ObjectDefinition(_, def) => {
                assert_eq!(def.object_instance, 1);
                assert_eq!(def.cov_increment, Some(0.5));
                assert_eq!(def.initial_value, Some(PresentValue::Real(20.0)));
            }
            _ => panic!("expected ObjectDefinition"),
        }
    }

    #[test]
    fn missing_required_field_reports_field_path() {
        let bad = br#"{"messageType":"ObjectDefinition","sourceId":"s1","payload":{"objectType":"analog-input","objectInstance":1,"presentValueType":"real"}}"#;
        let err = decode(bad).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("payload.objectName".to_owned()));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let bad = br#"{"messageType":"Bogus","sourceId":"s1","payload":{}}"#;
        assert!(matches!(decode(bad), Err(DecodeError::UnknownMessageType(_))));
    }

    #[test]
    fn binary_value_update_derives_boolean_kind_from_object_type() {
        let json = br#"{"messageType":"ValueUpdate","sourceId":"s1","payload":{"objectType":"binary-input","objectInstance":2,"presentValue":true}}"#;
        let msg = decode(json).unwrap();
        match msg {
            Message::ValueUpdate(_, update) => {
                assert_eq!(update.present_value, PresentValue::Boolean(true));
            }
            _ => panic!("expected ValueUpdate"),
        }
    }

    #[test]
    fn multi_state_with_too_many_state_texts_is_rejected() {
        let texts: Vec<String> = (0..17).map(|i| format!("s{i}")).collect();
        let payload = serde_json::json!({
            "messageType": "ObjectDefinition",
            "sourceId": "s1",
            "payload": {
                "objectType": "multi-state-value",
                "objectInstance": 1,
                "objectName": "M",
                "presentValueType": "unsigned",
                "stateTexts": texts,
            }
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue(_)));
    }

    #[test]
    fn timestamp_with_negative_zero_offset_is_treated_as_utc() {
        let json = br#"{"messageType":"ObjectDelete","sourceId":"s1","timestamp":"2024-01-01T00:00:00-00:00","payload":{"objectType":"analog-input","objectInstance":1}}"#;
        let msg = decode(json).unwrap();
        assert_eq!(msg.envelope().timestamp_ms, Some(1704067200000));
    }

    #[test]
    fn invalid_timestamp_is_rejected() {
        let json = br#"{"messageType":"ObjectDelete","sourceId":"s1","timestamp":"not-a-date","payload":{"objectType":"analog-input","objectInstance":1}}"#;
        assert!(matches!(decode(json), Err(DecodeError::InvalidValue(_))));
    }

    #[test]
    fn device_config_leaves_absent_fields_none() {
        let json = br#"{"messageType":"DeviceConfig","sourceId":"s1","payload":{"deviceName":"gw-1"}}"#;
        let msg = decode(json).unwrap();
        match msg {
            Message::DeviceConfig(_, cfg) => {
                assert_eq!(cfg.device_name, Some("gw-1".to_owned()));
                assert_eq!(cfg.vendor_id, None);
            }
            _ => panic!("expected DeviceConfig"),
        }
    }

    #[test]
    fn invalid_json_is_rejected() {
        let bad = b"{not json";
        assert!(matches!(decode(bad), Err(DecodeError::InvalidJson(_))));
    }
}
