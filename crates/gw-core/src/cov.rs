//! Per-object COV subscriber lists, lifetimes, and notification fan-out.

use crate::bacnet::BacnetObjectLayer;
use crate::object::{ObjectId, ObjectRecord, PresentValue};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CovSubscriptionId {
    pub subscriber_process_id: u32,
    pub subscriber_address: String,
    pub object_id: ObjectId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CovSubscription {
    pub subscriber_process_id: u32,
    pub subscriber_address: String,
    pub object_id: ObjectId,
    pub confirmed: bool,
    /// 0 means indefinite (never expires via `tick`); see DESIGN.md for the
    /// resolution of the open question in spec.md §9.
    pub lifetime_seconds_remaining: u32,
    pub initial_lifetime: u32,
    pub cov_increment_override: Option<f32>,
    pub created_at: u64,
    pub last_notified_at: Option<u64>,
    /// The value this subscriber was last sent, gated independently of the
    /// object's own `last_notified_value` when `cov_increment_override` is
    /// set (spec.md §4.4: "it applies only to that subscription's gating").
    /// `None` until the subscriber's first notification.
    pub last_notified_value: Option<PresentValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    New,
    Renewed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Ok,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CovError {
    #[error("capacity_exceeded")]
    CapacityExceeded,
}

/// In-memory subscriber table, one mutex's worth of state per spec.md §5.
pub struct CovManager {
    subscriptions: HashMap<CovSubscriptionId, CovSubscription>,
    by_object: HashMap<ObjectId, Vec<CovSubscriptionId>>,
    max_subscriptions: usize,
}

impl CovManager {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            subscriptions: HashMap::new(),
            by_object: HashMap::new(),
            max_subscriptions,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &mut self,
        subscriber_process_id: u32,
        subscriber_address: &str,
        object_id: ObjectId,
        confirmed: bool,
        lifetime_seconds: u32,
        cov_increment_override: Option<f32>,
        now: u64,
    ) -> Result<SubscribeOutcome, CovError> {
        let id = CovSubscriptionId {
            subscriber_process_id,
            subscriber_address: subscriber_address.to_owned(),
            object_id,
        };
        if let Some(existing) = self.subscriptions.get_mut(&id) {
            existing.confirmed = confirmed;
            existing.lifetime_seconds_remaining = lifetime_seconds;
            existing.initial_lifetime = lifetime_seconds;
            existing.cov_increment_override = cov_increment_override;
            return Ok(SubscribeOutcome::Renewed);
        }
        if self.subscriptions.len() >= self.max_subscriptions {
            return Err(CovError::CapacityExceeded);
        }
        self.subscriptions.insert(
            id.clone(),
            CovSubscription {
                subscriber_process_id,
                subscriber_address: subscriber_address.to_owned(),
                object_id,
                confirmed,
                lifetime_seconds_remaining: lifetime_seconds,
                initial_lifetime: lifetime_seconds,
                cov_increment_override,
                created_at: now,
                last_notified_at: None,
                last_notified_value: None,
            },
        );
        self.by_object.entry(object_id).or_default().push(id);
        Ok(SubscribeOutcome::New)
    }

    pub fn cancel(
        &mut self,
        subscriber_process_id: u32,
        subscriber_address: &str,
        object_id: ObjectId,
    ) -> CancelOutcome {
        let id = CovSubscriptionId {
            subscriber_process_id,
            subscriber_address: subscriber_address.to_owned(),
            object_id,
        };
        if self.subscriptions.remove(&id).is_some() {
            self.remove_index(&id);
            CancelOutcome::Ok
        } else {
            CancelOutcome::NotFound
        }
    }

    /// Remove every subscription for `object_id`, e.g. on object delete.
    pub fn cancel_all_for_object(&mut self, object_id: ObjectId) -> usize {
        let ids = self.by_object.remove(&object_id).unwrap_or_default();
        let n = ids.len();
        for id in &ids {
            self.subscriptions.remove(id);
        }
        n
    }

    pub fn list_for_object(&self, object_id: ObjectId) -> Vec<CovSubscription> {
        self.by_object
            .get(&object_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.subscriptions.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Fan out a COV notification to every live subscriber of `object_id`
    /// whose own gating allows it. A send failure for one subscriber never
    /// blocks the others; it is simply dropped for this cycle (spec.md
    /// §4.4: "failed subscribers are retried on the next value change
    /// only"). Called only when the object-level delta rule already fired;
    /// a subscriber with `cov_increment_override` set then re-gates against
    /// its own last-sent value instead of the object's, per spec.md §4.4.
    pub fn notify(
        &mut self,
        object_id: ObjectId,
        record: &ObjectRecord,
        bacnet: &dyn BacnetObjectLayer,
        now: u64,
    ) {
        let ids = match self.by_object.get(&object_id) {
            Some(ids) => ids.clone(),
            None => return,
        };
        for id in ids {
            if let Some(sub) = self.subscriptions.get_mut(&id) {
                if !subscriber_should_notify(sub, record.present_value) {
                    continue;
                }
                match bacnet.send_cov_notification(sub, record) {
                    Ok(()) => {
                        sub.last_notified_at = Some(now);
                        sub.last_notified_value = Some(record.present_value);
                    }
                    Err(e) => warn!(object = %object_id, error = %e, "cov notify failed"),
                }
            }
        }
    }

    /// Age out expired subscriptions. Called once per second by the
    /// supervisor. A `lifetime_seconds_remaining` of 0 is indefinite and
    /// never decremented.
    pub fn tick(&mut self, elapsed_seconds: u32) {
        let mut expired = Vec::new();
        for (id, sub) in self.subscriptions.iter_mut() {
            if sub.lifetime_seconds_remaining == 0 {
                continue;
            }
            sub.lifetime_seconds_remaining =
                sub.lifetime_seconds_remaining.saturating_sub(elapsed_seconds);
            if sub.lifetime_seconds_remaining == 0 {
                expired.push(id.clone());
            }
        }
        for id in expired {
            self.subscriptions.remove(&id);
            self.remove_index(&id);
        }
    }

    fn remove_index(&mut self, id: &CovSubscriptionId) {
        if let Some(list) = self.by_object.get_mut(&id.object_id) {
            list.retain(|existing| existing != id);
            if list.is_empty() {
                self.by_object.remove(&id.object_id);
            }
        }
    }
}

/// Per-subscriber gate applied on top of the object-level delta rule that
/// already triggered this notify cycle. No override, or no prior send yet,
/// always passes; otherwise the override increment re-gates against this
/// subscriber's own last-sent value rather than the object's (spec.md §4.4).
fn subscriber_should_notify(sub: &CovSubscription, new_value: PresentValue) -> bool {
    let increment = match sub.cov_increment_override {
        Some(increment) => increment,
        None => return true,
    };
    let prev = match sub.last_notified_value {
        Some(prev) => prev,
        None => return true,
    };
    match new_value {
        PresentValue::Boolean(v) => match prev {
            PresentValue::Boolean(p) => p != v,
            _ => true,
        },
        _ => {
            let delta = prev.numeric_delta(&new_value).unwrap_or(f64::INFINITY);
            if increment > 0.0 {
                delta >= increment as f64
            } else {
                delta != 0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::NullBacnetLayer;
    use crate::object::{ObjectType, PresentValue, ValueKind};

    fn oid() -> ObjectId {
        ObjectId::new(ObjectType::AnalogInput, 1)
    }

    fn record() -> ObjectRecord {
        ObjectRecord {
            id: oid(),
            object_name: "T".to_owned(),
            description: String::new(),
            value_kind: ValueKind::Real,
            present_value: PresentValue::Real(1.0),
            units: 95,
            units_text: String::new(),
            cov_increment: None,
            min_value: None,
            max_value: None,
            multi_state: Default::default(),
            binary: Default::default(),
            status_flags: Default::default(),
            reliability: 0,
            event_state: 0,
            source_id: "s".to_owned(),
            last_update: 0,
            stream_position: 0,
            last_notified_value: PresentValue::Real(1.0),
        }
    }

    #[test]
    fn subscribe_then_resubscribe_renews() {
        let mut mgr = CovManager::new(10);
        let outcome = mgr
            .subscribe(1, "10.0.0.1", oid(), false, 300, None, 0)
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::New);
        let outcome = mgr
            .subscribe(1, "10.0.0.1", oid(), true, 600, None, 10)
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::Renewed);
        assert_eq!(mgr.len(), 1);
        let subs = mgr.list_for_object(oid());
        assert_eq!(subs[0].confirmed, true);
        assert_eq!(subs[0].lifetime_seconds_remaining, 600);
    }

    #[test]
    fn capacity_exceeded_rejects_new_subscriptions() {
        let mut mgr = CovManager::new(1);
        mgr.subscribe(1, "a", oid(), false, 300, None, 0).unwrap();
        let err = mgr
            .subscribe(2, "b", oid(), false, 300, None, 0)
            .unwrap_err();
        assert_eq!(err, CovError::CapacityExceeded);
    }

    #[test]
    fn cancel_removes_subscription_and_index() {
        let mut mgr = CovManager::new(10);
        mgr.subscribe(1, "a", oid(), false, 300, None, 0).unwrap();
        assert_eq!(mgr.cancel(1, "a", oid()), CancelOutcome::Ok);
        assert!(mgr.list_for_object(oid()).is_empty());
        assert_eq!(mgr.cancel(1, "a", oid()), CancelOutcome::NotFound);
    }

    #[test]
    fn tick_expires_lifetime_and_zero_is_indefinite() {
        let mut mgr = CovManager::new(10);
        mgr.subscribe(1, "a", oid(), false, 5, None, 0).unwrap();
        mgr.subscribe(2, "b", oid(), false, 0, None, 0).unwrap();
        mgr.tick(5);
        let subs = mgr.list_for_object(oid());
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].subscriber_process_id, 2);
        mgr.tick(1_000_000);
        assert_eq!(mgr.list_for_object(oid()).len(), 1);
    }

    #[test]
    fn cancel_all_for_object_clears_every_subscriber() {
        let mut mgr = CovManager::new(10);
        mgr.subscribe(1, "a", oid(), false, 300, None, 0).unwrap();
        mgr.subscribe(2, "b", oid(), false, 300, None, 0).unwrap();
        let n = mgr.cancel_all_for_object(oid());
        assert_eq!(n, 2);
        assert!(mgr.list_for_object(oid()).is_empty());
    }

    #[test]
    fn notify_continues_after_one_subscriber_send_fails() {
        struct FlakyLayer;
        impl BacnetObjectLayer for FlakyLayer {
            fn create_or_update(
                &self,
                _record: &ObjectRecord,
            ) -> Result<(), crate::bacnet::BacnetError> {
                Ok(())
            }
            fn remove(&self, _id: ObjectId) -> Result<(), crate::bacnet::BacnetError> {
                Ok(())
            }
            fn send_cov_notification(
                &self,
                sub: &CovSubscription,
                _record: &ObjectRecord,
            ) -> Result<(), crate::bacnet::BacnetError> {
                if sub.subscriber_address == "flaky" {
                    Err(crate::bacnet::BacnetError("send failed".to_owned()))
                } else {
                    Ok(())
                }
            }
        }
        let mut mgr = CovManager::new(10);
        mgr.subscribe(1, "flaky", oid(), false, 300, None, 0)
            .unwrap();
        mgr.subscribe(2, "healthy", oid(), false, 300, None, 0)
            .unwrap();
        mgr.notify(oid(), &record(), &FlakyLayer, 100);
        let subs = mgr.list_for_object(oid());
        let flaky = subs
            .iter()
            .find(|s| s.subscriber_address == "flaky")
            .unwrap();
        let healthy = subs
            .iter()
            .find(|s| s.subscriber_address == "healthy")
            .unwrap();
        assert_eq!(flaky.last_notified_at, None);
        assert_eq!(healthy.last_notified_at, Some(100));
    }

    #[test]
    fn override_increment_gates_per_subscriber_independent_of_object() {
        let mut mgr = CovManager::new(10);
        // Large override: suppressed until its own last-sent value drifts
        // by at least 10.
        mgr.subscribe(1, "picky", oid(), false, 300, Some(10.0), 0)
            .unwrap();
        // No override: always follows the object-level delta rule.
        mgr.subscribe(2, "default", oid(), false, 300, None, 0)
            .unwrap();

        let mut rec = record();
        mgr.notify(oid(), &rec, &NullBacnetLayer, 0);
        let subs = mgr.list_for_object(oid());
        assert_eq!(
            subs.iter().find(|s| s.subscriber_address == "picky").unwrap().last_notified_value,
            Some(PresentValue::Real(1.0))
        );
        assert_eq!(
            subs.iter().find(|s| s.subscriber_address == "default").unwrap().last_notified_value,
            Some(PresentValue::Real(1.0))
        );

        // Small move: below the "picky" subscriber's own override threshold.
        rec.present_value = PresentValue::Real(3.0);
        mgr.notify(oid(), &rec, &NullBacnetLayer, 1);
        let subs = mgr.list_for_object(oid());
        let picky = subs.iter().find(|s| s.subscriber_address == "picky").unwrap();
        let default = subs.iter().find(|s| s.subscriber_address == "default").unwrap();
        assert_eq!(picky.last_notified_at, Some(0));
        assert_eq!(picky.last_notified_value, Some(PresentValue::Real(1.0)));
        assert_eq!(default.last_notified_at, Some(1));
        assert_eq!(default.last_notified_value, Some(PresentValue::Real(3.0)));

        // Large move: now clears the override threshold too.
        rec.present_value = PresentValue::Real(20.0);
        mgr.notify(oid(), &rec, &NullBacnetLayer, 2);
        let subs = mgr.list_for_object(oid());
        let picky = subs.iter().find(|s| s.subscriber_address == "picky").unwrap();
        assert_eq!(picky.last_notified_at, Some(2));
        assert_eq!(picky.last_notified_value, Some(PresentValue::Real(20.0)));
    }

    #[test]
    fn null_bacnet_layer_always_succeeds() {
        let mut mgr = CovManager::new(10);
        mgr.subscribe(1, "a", oid(), false, 300, None, 0).unwrap();
        mgr.notify(oid(), &record(), &NullBacnetLayer, 1);
        assert_eq!(
            mgr.list_for_object(oid())[0].last_notified_at,
            Some(1)
        );
    }
}
