//! Seam to the external BACnet object/datalink layer.
//!
//! The wire codec and datalink themselves are out of scope (spec.md §1);
//! this trait is the narrow interface the registry and COV manager need
//! from whatever library actually owns the BACnet device and sends frames.

use crate::cov::CovSubscription;
use crate::object::{ObjectId, ObjectRecord};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacnetError(pub String);

impl fmt::Display for BacnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bacnet layer error: {}", self.0)
    }
}

impl std::error::Error for BacnetError {}

/// Operations the registry and COV manager need from the external BACnet
/// object/datalink library. A real implementation owns the device, the
/// object database, and the send primitives; this crate never speaks the
/// wire protocol itself.
pub trait BacnetObjectLayer: Send + Sync {
    /// Create the object if absent, or refresh its exposed properties if
    /// already present. Called after every `apply_definition` and
    /// `apply_value`.
    fn create_or_update(&self, record: &ObjectRecord) -> Result<(), BacnetError>;

    /// Remove the object from the device's object list.
    fn remove(&self, id: ObjectId) -> Result<(), BacnetError>;

    /// Send a COV notification (confirmed or unconfirmed per `sub.confirmed`)
    /// for the given object's current state.
    fn send_cov_notification(
        &self,
        sub: &CovSubscription,
        record: &ObjectRecord,
    ) -> Result<(), BacnetError>;
}

/// A no-op BACnet layer: every call logs and succeeds. Used as the default
/// so the gateway is runnable and testable without a real BACnet stack
/// linked in; a production deployment supplies a crate-backed
/// implementation of [`BacnetObjectLayer`] instead.
#[derive(Debug, Default)]
pub struct NullBacnetLayer;

impl BacnetObjectLayer for NullBacnetLayer {
    fn create_or_update(&self, record: &ObjectRecord) -> Result<(), BacnetError> {
        tracing::debug!(object = %record.id, "null bacnet layer: create_or_update");
        Ok(())
    }

    fn remove(&self, id: ObjectId) -> Result<(), BacnetError> {
        tracing::debug!(object = %id, "null bacnet layer: remove");
        Ok(())
    }

    fn send_cov_notification(
        &self,
        sub: &CovSubscription,
        record: &ObjectRecord,
    ) -> Result<(), BacnetError> {
        tracing::debug!(
            object = %record.id,
            subscriber = %sub.subscriber_address,
            "null bacnet layer: send_cov_notification"
        );
        Ok(())
    }
}
