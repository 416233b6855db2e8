//! JSON event envelope decoding for the presence gateway's wire format.
//! Depends only on `gw-core` for the domain types the decoded messages are
//! expressed in; knows nothing about streams, transports, or the registry.

pub mod decode;
pub mod message;

pub use decode::{decode, DecodeError};
pub use message::{DeviceConfigUpdate, Envelope, Message, ObjectDeleteMessage};
