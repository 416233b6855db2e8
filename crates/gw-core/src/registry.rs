//! The in-memory authoritative object table (C4).
//!
//! The registry never talks to the cache or to COV subscribers directly —
//! both are handled by the caller (the pipeline supervisor) so this type
//! can be unit tested with nothing but the [`BacnetObjectLayer`] seam.

use crate::bacnet::BacnetObjectLayer;
use crate::cov::CovManager;
use crate::object::{
    BinaryMeta, MultiStateMeta, ObjectId, ObjectRecord, ObjectType, PresentValue, StatusFlags,
    ValueKind,
};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("kind_mismatch: existing {existing:?}, incoming {incoming:?}")]
    KindMismatch {
        existing: ValueKind,
        incoming: ValueKind,
    },
    #[error("not_found")]
    NotFound,
    #[error("out_of_range: {0}")]
    OutOfRange(String),
}

/// A definition message, already offset-adjusted by the caller's
/// `object_instance_offset` is NOT assumed here — `apply_definition` takes
/// the raw instance and the offset together so the arithmetic lives in one
/// place.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDefinition {
    pub object_type: ObjectType,
    pub object_instance: u32,
    pub object_name: String,
    pub description: Option<String>,
    pub value_kind: ValueKind,
    pub units: Option<u16>,
    pub units_text: Option<String>,
    pub cov_increment: Option<f32>,
    pub min_value: Option<f32>,
    pub max_value: Option<f32>,
    pub state_texts: Option<Vec<String>>,
    pub inactive_text: Option<String>,
    pub active_text: Option<String>,
    pub initial_value: Option<PresentValue>,
    pub source_id: String,
    pub stream_position: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub object_type: ObjectType,
    pub object_instance: u32,
    pub present_value: PresentValue,
    pub status_flags: Option<StatusFlags>,
    pub reliability: Option<u8>,
    pub event_state: Option<u8>,
    pub source_id: String,
    pub last_update: u64,
    pub stream_position: u64,
    /// Clamp instead of reject when the value falls outside
    /// `min_value`/`max_value`. Configured per-deployment.
    pub clamp_out_of_range: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDelete {
    pub object_type: ObjectType,
    pub object_instance: u32,
}

/// Outcome of `apply_value`, telling the caller whether to mirror the
/// change to the cache and/or ask the COV manager to fan out a
/// notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyValueOutcome {
    pub object_id: ObjectId,
    pub should_notify: bool,
    pub record: ObjectRecord,
}

/// The authoritative in-memory object table.
pub struct Registry {
    objects: HashMap<ObjectId, ObjectRecord>,
    by_type: HashMap<ObjectType, Vec<u32>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjectRecord> {
        self.objects.get(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids_of_type(&self, object_type: ObjectType) -> Vec<u32> {
        self.by_type.get(&object_type).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.objects.values()
    }

    /// Insert a record recovered from the cache at startup. Bypasses
    /// kind-match validation since the cache is assumed internally
    /// consistent; rebuilds the type index incrementally.
    pub fn restore(&mut self, record: ObjectRecord) {
        let id = record.id;
        self.index_insert(id);
        self.objects.insert(id, record);
    }

    fn index_insert(&mut self, id: ObjectId) {
        let list = self.by_type.entry(id.object_type).or_default();
        if !list.contains(&id.object_instance) {
            list.push(id.object_instance);
        }
    }

    fn index_remove(&mut self, id: ObjectId) {
        if let Some(list) = self.by_type.get_mut(&id.object_type) {
            list.retain(|i| *i != id.object_instance);
        }
    }

    /// `instance' = def.object_instance + offset`. Creates the object if
    /// absent; on an existing object with a matching `value_kind`, updates
    /// metadata in place and leaves the present value untouched unless
    /// `initial_value` is present and the record was just created.
    pub fn apply_definition(
        &mut self,
        def: &ObjectDefinition,
        offset: u32,
        bacnet: &dyn BacnetObjectLayer,
    ) -> Result<ObjectId, RegistryError> {
        let instance = def
            .object_instance
            .checked_add(offset)
            .ok_or_else(|| RegistryError::OutOfRange("object_instance_offset overflow".into()))?;
        let id = ObjectId::new(def.object_type, instance);

        if let Some(existing) = self.objects.get_mut(&id) {
            if existing.value_kind != def.value_kind {
                return Err(RegistryError::KindMismatch {
                    existing: existing.value_kind,
                    incoming: def.value_kind,
                });
            }
            if def.stream_position < existing.stream_position {
                // Stale/duplicate delivery: treat as a no-op re-application
                // rather than regressing stream_position (idempotence,
                // spec.md §8).
                return Ok(id);
            }
            existing.object_name = def.object_name.clone();
            if let Some(d) = &def.description {
                existing.description = d.clone();
            }
            if let Some(u) = def.units {
                existing.units = u;
            }
            if let Some(t) = &def.units_text {
                existing.units_text = t.clone();
            }
            existing.cov_increment = def.cov_increment.or(existing.cov_increment);
            existing.min_value = def.min_value.or(existing.min_value);
            existing.max_value = def.max_value.or(existing.max_value);
            if let Some(texts) = &def.state_texts {
                existing.multi_state = MultiStateMeta {
                    state_texts: texts.clone(),
                };
            }
            if let Some(t) = &def.inactive_text {
                existing.binary.inactive_text = t.clone();
            }
            if let Some(t) = &def.active_text {
                existing.binary.active_text = t.clone();
            }
            existing.source_id = def.source_id.clone();
            existing.stream_position = def.stream_position;
            bacnet
                .create_or_update(existing)
                .map_err(|e| RegistryError::OutOfRange(e.to_string()))?;
            return Ok(id);
        }

        let initial_value = def.initial_value.unwrap_or(default_value_for_kind(def.value_kind));
        let record = ObjectRecord {
            id,
            object_name: def.object_name.clone(),
            description: def.description.clone().unwrap_or_default(),
            value_kind: def.value_kind,
            present_value: initial_value,
            units: def.units.unwrap_or(95),
            units_text: def.units_text.clone().unwrap_or_default(),
            cov_increment: def.cov_increment,
            min_value: def.min_value,
            max_value: def.max_value,
            multi_state: MultiStateMeta {
                state_texts: def.state_texts.clone().unwrap_or_default(),
            },
            binary: BinaryMeta {
                inactive_text: def.inactive_text.clone().unwrap_or_else(|| "Inactive".into()),
                active_text: def.active_text.clone().unwrap_or_else(|| "Active".into()),
            },
            status_flags: StatusFlags::default(),
            reliability: 0,
            event_state: 0,
            source_id: def.source_id.clone(),
            last_update: 0,
            stream_position: def.stream_position,
            last_notified_value: initial_value,
        };
        bacnet
            .create_or_update(&record)
            .map_err(|e| RegistryError::OutOfRange(e.to_string()))?;
        self.index_insert(id);
        self.objects.insert(id, record);
        Ok(id)
    }

    /// Validates the incoming value against `value_kind`, enumerated
    /// ranges, and min/max (clamp if configured; reject if not), then
    /// atomically updates present value, status flags, `last_update`, and
    /// `stream_position`. Returns whether the caller should trigger a COV
    /// notification; the caller is responsible for mirroring to cache and
    /// invoking the COV manager (ordering is prescribed in spec.md §4.4).
    pub fn apply_value(
        &mut self,
        update: &ValueUpdate,
        offset: u32,
        bacnet: &dyn BacnetObjectLayer,
    ) -> Result<ApplyValueOutcome, RegistryError> {
        let instance = update
            .object_instance
            .checked_add(offset)
            .ok_or_else(|| RegistryError::OutOfRange("object_instance_offset overflow".into()))?;
        let id = ObjectId::new(update.object_type, instance);

        let record = self.objects.get_mut(&id).ok_or(RegistryError::NotFound)?;
        if record.value_kind != update.present_value.kind() {
            return Err(RegistryError::KindMismatch {
                existing: record.value_kind,
                incoming: update.present_value.kind(),
            });
        }

        let mut value = update.present_value;
        if record.value_kind == ValueKind::Unsigned && record.id.object_type.is_multi_state() {
            if let PresentValue::Unsigned(v) = value {
                let state_count = record.multi_state.state_count().max(1);
                if v < 1 || v > state_count {
                    return Err(RegistryError::OutOfRange(format!(
                        "presentValue {v} outside [1, {state_count}]"
                    )));
                }
            }
        }
        if let (PresentValue::Real(v), Some(min), Some(max)) =
            (value, record.min_value, record.max_value)
        {
            if v < min || v > max {
                if update.clamp_out_of_range {
                    value = PresentValue::Real(v.clamp(min, max));
                } else {
                    return Err(RegistryError::OutOfRange(format!(
                        "presentValue {v} outside [{min}, {max}]"
                    )));
                }
            }
        }

        if update.stream_position < record.stream_position {
            // Stale/duplicate delivery: treat as a no-op re-application
            // rather than corrupting a more recent state (idempotence,
            // spec.md §8).
            return Ok(ApplyValueOutcome {
                object_id: id,
                should_notify: false,
                record: record.clone(),
            });
        }

        let status_changed = match update.status_flags {
            Some(flags) => flags != record.status_flags,
            None => false,
        };
        let should_notify = record.cov_should_notify(&value, status_changed);

        record.present_value = value;
        if let Some(flags) = update.status_flags {
            record.status_flags = flags;
        }
        if let Some(r) = update.reliability {
            record.reliability = r;
        }
        if let Some(es) = update.event_state {
            record.event_state = es;
        }
        record.last_update = update.last_update;
        record.stream_position = update.stream_position;
        if should_notify {
            record.last_notified_value = value;
        }

        bacnet
            .create_or_update(record)
            .map_err(|e| RegistryError::OutOfRange(e.to_string()))?;

        Ok(ApplyValueOutcome {
            object_id: id,
            should_notify,
            record: record.clone(),
        })
    }

    pub fn apply_delete(
        &mut self,
        del: &ObjectDelete,
        offset: u32,
        bacnet: &dyn BacnetObjectLayer,
        cov: &mut CovManager,
    ) -> Result<(), RegistryError> {
        let instance = del
            .object_instance
            .checked_add(offset)
            .ok_or_else(|| RegistryError::OutOfRange("object_instance_offset overflow".into()))?;
        let id = ObjectId::new(del.object_type, instance);
        if self.objects.remove(&id).is_none() {
            return Err(RegistryError::NotFound);
        }
        self.index_remove(id);
        bacnet
            .remove(id)
            .map_err(|e| RegistryError::OutOfRange(e.to_string()))?;
        cov.cancel_all_for_object(id);
        Ok(())
    }
}

fn default_value_for_kind(kind: ValueKind) -> PresentValue {
    match kind {
        ValueKind::Real => PresentValue::Real(0.0),
        ValueKind::Unsigned => PresentValue::Unsigned(0),
        ValueKind::Signed => PresentValue::Signed(0),
        ValueKind::Boolean => PresentValue::Boolean(false),
        ValueKind::Enumerated => PresentValue::Enumerated(0),
    }
}
