//! Bridge from a multi-channel CT energy monitor to logical meters.
//!
//! CT channels are grouped by phase and paired into meters whenever a
//! channel configuration arrives; realtime readings are then aggregated
//! per meter and published field by field, skipping unchanged values.

pub mod aggregate;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod meter;
pub mod mqtt;
pub mod profile;
pub mod protocol;
pub mod sink;

pub use bridge::Bridge;
pub use channel::{ChannelDescriptor, Phase, ReadingBatch, ReadingSample, Role};
pub use meter::{allocate, Meter};
pub use sink::{MqttSink, PublicationSink};
