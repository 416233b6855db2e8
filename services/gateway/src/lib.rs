pub mod bacnet;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod http;
pub mod supervisor;
pub mod transport;
