//! Object identity, value kinds, and the authoritative object record.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The nine BACnet object categories the gateway projects events into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectType {
    AnalogInput = 0,
    AnalogOutput = 1,
    AnalogValue = 2,
    BinaryInput = 3,
    BinaryOutput = 4,
    BinaryValue = 5,
    MultiStateInput = 13,
    MultiStateOutput = 14,
    MultiStateValue = 19,
}

impl ObjectType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The value kind implied by this object type, independent of any
    /// `presentValueType` field (binary/multi-state objects ignore it).
    pub fn intrinsic_value_kind(self) -> Option<ValueKind> {
        match self {
            ObjectType::BinaryInput | ObjectType::BinaryOutput | ObjectType::BinaryValue => {
                Some(ValueKind::Boolean)
            }
            ObjectType::MultiStateInput
            | ObjectType::MultiStateOutput
            | ObjectType::MultiStateValue => Some(ValueKind::Unsigned),
            ObjectType::AnalogInput | ObjectType::AnalogOutput | ObjectType::AnalogValue => None,
        }
    }

    pub fn is_multi_state(self) -> bool {
        matches!(
            self,
            ObjectType::MultiStateInput | ObjectType::MultiStateOutput | ObjectType::MultiStateValue
        )
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            ObjectType::BinaryInput | ObjectType::BinaryOutput | ObjectType::BinaryValue
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl TryFrom<&str> for ObjectType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "analog-input" => Ok(ObjectType::AnalogInput),
            "analog-output" => Ok(ObjectType::AnalogOutput),
            "analog-value" => Ok(ObjectType::AnalogValue),
            "binary-input" => Ok(ObjectType::BinaryInput),
            "binary-output" => Ok(ObjectType::BinaryOutput),
            "binary-value" => Ok(ObjectType::BinaryValue),
            "multi-state-input" => Ok(ObjectType::MultiStateInput),
            "multi-state-output" => Ok(ObjectType::MultiStateOutput),
            "multi-state-value" => Ok(ObjectType::MultiStateValue),
            other => Err(format!("unknown objectType '{other}'")),
        }
    }
}

impl TryFrom<u8> for ObjectType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(ObjectType::AnalogInput),
            1 => Ok(ObjectType::AnalogOutput),
            2 => Ok(ObjectType::AnalogValue),
            3 => Ok(ObjectType::BinaryInput),
            4 => Ok(ObjectType::BinaryOutput),
            5 => Ok(ObjectType::BinaryValue),
            13 => Ok(ObjectType::MultiStateInput),
            14 => Ok(ObjectType::MultiStateOutput),
            19 => Ok(ObjectType::MultiStateValue),
            other => Err(format!("unknown object type code {other}")),
        }
    }
}

/// `(object_type, object_instance)`, unique across the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub object_instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, object_instance: u32) -> Self {
        Self {
            object_type,
            object_instance,
        }
    }

    /// Cache key suffix, e.g. `"0:1"`.
    pub fn cache_suffix(&self) -> String {
        format!("{}:{}", self.object_type.as_u8(), self.object_instance)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.object_type, self.object_instance)
    }
}

/// The discriminator fixed at object creation; every subsequent update must
/// match it (spec invariant: value_kind is immutable after creation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Real,
    Unsigned,
    Signed,
    Boolean,
    Enumerated,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Real => "real",
            ValueKind::Unsigned => "unsigned",
            ValueKind::Signed => "signed",
            ValueKind::Boolean => "boolean",
            ValueKind::Enumerated => "enumerated",
        }
    }
}

impl TryFrom<&str> for ValueKind {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "real" => Ok(ValueKind::Real),
            "unsigned" => Ok(ValueKind::Unsigned),
            "signed" => Ok(ValueKind::Signed),
            "boolean" => Ok(ValueKind::Boolean),
            "enumerated" => Ok(ValueKind::Enumerated),
            other => Err(format!("unknown presentValueType '{other}'")),
        }
    }
}

/// The present value, tagged by kind so arithmetic never crosses kinds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum PresentValue {
    Real(f32),
    Unsigned(u32),
    Signed(i32),
    Boolean(bool),
    Enumerated(u32),
}

impl PresentValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PresentValue::Real(_) => ValueKind::Real,
            PresentValue::Unsigned(_) => ValueKind::Unsigned,
            PresentValue::Signed(_) => ValueKind::Signed,
            PresentValue::Boolean(_) => ValueKind::Boolean,
            PresentValue::Enumerated(_) => ValueKind::Enumerated,
        }
    }

    /// Absolute distance between two values of the same kind, used for COV
    /// gating. Returns `None` for boolean (handled separately by equality).
    pub fn numeric_delta(&self, other: &PresentValue) -> Option<f64> {
        match (self, other) {
            (PresentValue::Real(a), PresentValue::Real(b)) => Some((*a as f64 - *b as f64).abs()),
            (PresentValue::Unsigned(a), PresentValue::Unsigned(b)) => {
                Some((*a as i64 - *b as i64).unsigned_abs() as f64)
            }
            (PresentValue::Signed(a), PresentValue::Signed(b)) => {
                Some((*a as i64 - *b as i64).unsigned_abs() as f64)
            }
            (PresentValue::Enumerated(a), PresentValue::Enumerated(b)) => {
                Some((*a as i64 - *b as i64).unsigned_abs() as f64)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            PresentValue::Real(v) => *v as f64,
            PresentValue::Unsigned(v) => *v as f64,
            PresentValue::Signed(v) => *v as f64,
            PresentValue::Boolean(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            PresentValue::Enumerated(v) => *v as f64,
        }
    }
}

/// Four booleans describing the runtime health of a BACnet object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusFlags {
    pub in_alarm: bool,
    pub fault: bool,
    pub overridden: bool,
    pub out_of_service: bool,
}

/// Type-specific metadata, stored alongside the shared fields of
/// [`ObjectRecord`]. Kept out of `ObjectRecord` itself so analog/binary
/// objects don't carry multi-state's up-to-16-entry state-text list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MultiStateMeta {
    pub state_texts: Vec<String>,
}

impl MultiStateMeta {
    pub const MAX_STATES: usize = 16;

    pub fn state_count(&self) -> u32 {
        self.state_texts.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryMeta {
    pub inactive_text: String,
    pub active_text: String,
}

impl Default for BinaryMeta {
    fn default() -> Self {
        Self {
            inactive_text: "Inactive".to_owned(),
            active_text: "Active".to_owned(),
        }
    }
}

/// The authoritative in-memory (and cache-mirrored) representation of one
/// BACnet object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub object_name: String,
    #[serde(default)]
    pub description: String,
    pub value_kind: ValueKind,
    pub present_value: PresentValue,
    #[serde(default = "default_units")]
    pub units: u16,
    #[serde(default)]
    pub units_text: String,
    #[serde(default)]
    pub cov_increment: Option<f32>,
    #[serde(default)]
    pub min_value: Option<f32>,
    #[serde(default)]
    pub max_value: Option<f32>,
    #[serde(default)]
    pub multi_state: MultiStateMeta,
    #[serde(default)]
    pub binary: BinaryMeta,
    #[serde(default)]
    pub status_flags: StatusFlags,
    #[serde(default)]
    pub reliability: u8,
    #[serde(default)]
    pub event_state: u8,
    pub source_id: String,
    pub last_update: u64,
    pub stream_position: u64,
    pub last_notified_value: PresentValue,
}

fn default_units() -> u16 {
    95 // no-units
}

impl ObjectRecord {
    /// `|v_new - v_prev| >= c` when `c > 0`; `v_new != v_prev` when `c == 0`
    /// or kind is boolean. Always notifies when `force` is set (status flag
    /// change), independent of `cov_increment`.
    pub fn cov_should_notify(&self, new_value: &PresentValue, force: bool) -> bool {
        if force {
            return true;
        }
        if self.last_notified_value.kind() != new_value.kind() {
            // Can't happen once value_kind is enforced at the registry
            // boundary, but never suppress a change we can't compare.
            return true;
        }
        match new_value {
            PresentValue::Boolean(v) => match self.last_notified_value {
                PresentValue::Boolean(prev) => prev != *v,
                _ => true,
            },
            _ => {
                let increment = self.cov_increment.unwrap_or(0.0);
                let delta = self
                    .last_notified_value
                    .numeric_delta(new_value)
                    .unwrap_or(f64::INFINITY);
                if increment > 0.0 {
                    delta >= increment as f64
                } else {
                    delta != 0.0
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_type_round_trips_through_str_and_code() {
        for (s, code) in [
            ("analog-input", 0u8),
            ("analog-output", 1),
            ("analog-value", 2),
            ("binary-input", 3),
            ("binary-output", 4),
            ("binary-value", 5),
            ("multi-state-input", 13),
            ("multi-state-output", 14),
            ("multi-state-value", 19),
        ] {
            let t = ObjectType::try_from(s).unwrap();
            assert_eq!(t.as_u8(), code);
            assert_eq!(ObjectType::try_from(code).unwrap(), t);
        }
    }

    #[test]
    fn unknown_object_type_string_is_rejected() {
        assert!(ObjectType::try_from("thermostat").is_err());
    }

    #[test]
    fn cov_increment_zero_treats_any_change_as_delta() {
        let mut rec = sample_record(PresentValue::Real(20.0));
        rec.cov_increment = Some(0.0);
        assert!(rec.cov_should_notify(&PresentValue::Real(20.0001), false));
        assert!(!rec.cov_should_notify(&PresentValue::Real(20.0), false));
    }

    #[test]
    fn cov_increment_gates_small_deltas() {
        let mut rec = sample_record(PresentValue::Real(20.0));
        rec.cov_increment = Some(0.5);
        assert!(!rec.cov_should_notify(&PresentValue::Real(20.4), false));
        assert!(rec.cov_should_notify(&PresentValue::Real(20.6), false));
    }

    #[test]
    fn boolean_notifies_on_any_change_regardless_of_increment() {
        let rec = sample_record(PresentValue::Boolean(false));
        assert!(rec.cov_should_notify(&PresentValue::Boolean(true), false));
        assert!(!rec.cov_should_notify(&PresentValue::Boolean(false), false));
    }

    #[test]
    fn status_flag_change_forces_notification_even_under_increment() {
        let mut rec = sample_record(PresentValue::Real(20.0));
        rec.cov_increment = Some(5.0);
        assert!(rec.cov_should_notify(&PresentValue::Real(20.1), true));
    }

    fn sample_record(v: PresentValue) -> ObjectRecord {
        ObjectRecord {
            id: ObjectId::new(ObjectType::AnalogInput, 1),
            object_name: "T".to_owned(),
            description: String::new(),
            value_kind: v.kind(),
            present_value: v,
            units: 95,
            units_text: String::new(),
            cov_increment: None,
            min_value: None,
            max_value: None,
            multi_state: MultiStateMeta::default(),
            binary: BinaryMeta::default(),
            status_flags: StatusFlags::default(),
            reliability: 0,
            event_state: 0,
            source_id: "s1".to_owned(),
            last_update: 0,
            stream_position: 0,
            last_notified_value: v,
        }
    }
}
