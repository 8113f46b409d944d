//! chaincdc-core: typed change events from a blockchain block stream.
//!
//! # Architecture
//!
//! ```text
//! PipelineBuilder → Pipeline
//!                      ├── BlockSource      (firehose / replay)
//!                      ├── BlockHook        (capture, debugging)
//!                      ├── Adapter          (generic | CDC tables | CDC actions)
//!                      │     ├── Program    (compiled expressions over an Activation)
//!                      │     └── RowDecoder (raw row bytes → JSON)
//!                      ├── Sender           (checkpointed publish | dry run)
//!                      │     └── MessageSink
//!                      └── CheckpointStore  (file / bus / noop)
//! ```

pub mod activation;
pub mod adapter;
pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod event;
pub mod expr;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod types;

pub use activation::Activation;
pub use adapter::{
    ActionGenerator, Adapter, BlockHook, CdcAdapter, GenericAdapter, JsonCaptureHook,
    NoopBlockHook, TableGenerator,
};
pub use builder::PipelineBuilder;
pub use checkpoint::{
    BusCheckpointStore, CheckpointLog, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore, NoopCheckpointStore,
};
pub use config::{CdcMode, CompressionType, KafkaConfig, PipelineConfig};
pub use cursor::Cursor;
pub use decoder::{DecodePolicy, NoopRowDecoder, RowDecoder};
pub use error::{
    AdaptError, CheckpointError, ConfigError, DecodeError, EvalError, ExprError, PipelineError,
    SinkError, SourceError,
};
pub use event::{CanonicalEvent, Header, Message};
pub use expr::{Declarations, Program};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::Pipeline;
pub use sink::{CheckpointedSender, DryRunSender, MessageSink, Sender};
pub use source::{BlockRequest, BlockSource, StreamBlock, VecBlockSource};
pub use types::{Block, Step};
