pub mod mock_event_store;

pub use mock_event_store::{MockEventStoreServer, RecordedAck};
