//! chaincdc-bus: message-bus backends for ChainCDC.
//!
//! Backends:
//! - [`memory`]: in-process bus (dev/testing, no persistence)
//! - `kafka`: Apache Kafka via `rdkafka` (feature `kafka`)
//!
//! Every backend implements both `MessageSink` (event publishing) and
//! `CheckpointLog` (cursor records), so the same client carries events and
//! checkpoints.

pub mod error;
pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use error::BusError;
pub use memory::MemoryBus;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBus;
