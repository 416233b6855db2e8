//! Domain types, the object registry, and COV subscription management for
//! the presence gateway. Decoupled from the wire protocol (see `gw-protocol`)
//! and from the cache/transport layers (see `services/gateway`).

pub mod bacnet;
pub mod cov;
pub mod object;
pub mod registry;

pub use bacnet::{BacnetError, BacnetObjectLayer, NullBacnetLayer};
pub use cov::{CancelOutcome, CovError, CovManager, CovSubscription, CovSubscriptionId, SubscribeOutcome};
pub use object::{
    BinaryMeta, MultiStateMeta, ObjectId, ObjectRecord, ObjectType, PresentValue, StatusFlags,
    ValueKind,
};
pub use registry::{ApplyValueOutcome, ObjectDefinition, ObjectDelete, Registry, RegistryError, ValueUpdate};
