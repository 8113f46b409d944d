//! Bus backend errors.

use chaincdc_core::error::{CheckpointError, SinkError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("Partition {partition} out of range for topic '{topic}'")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("No open transaction")]
    NoTransaction,

    #[error("Background task failed: {0}")]
    Join(String),

    #[error("{0}")]
    Other(String),
}

impl From<BusError> for SinkError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::NoTransaction => SinkError::Transaction(e.to_string()),
            other => SinkError::Other(other.to_string()),
        }
    }
}

impl From<BusError> for CheckpointError {
    fn from(e: BusError) -> Self {
        CheckpointError::Bus(e.to_string())
    }
}
