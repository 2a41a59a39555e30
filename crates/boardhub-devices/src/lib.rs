//! MQTT plumbing between BoardHub and the boards.
//!
//! - [`MqttPublisher`] sends command messages, one connection per publish
//! - [`ReplyListener`] keeps a subscription on the reply topic and hands
//!   every message to the [`ReplyIngestor`], which appends it to the
//!   durable reply stream

pub mod error;
pub mod ingest;
pub mod listener;
pub mod mqtt;

pub use error::BrokerError;
pub use ingest::ReplyIngestor;
pub use listener::ReplyListener;
pub use mqtt::{CommandPublisher, MqttPublisher};
