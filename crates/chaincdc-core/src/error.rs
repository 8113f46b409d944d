//! Error types for the chaincdc pipeline.

use thiserror::Error;

/// Errors raised while compiling an expression.
///
/// Expressions are fixed at process start, so these are configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Undeclared reference to '{name}'")]
    Undeclared { name: String },

    #[error("Unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("Empty expression")]
    Empty,
}

/// Errors raised while evaluating a compiled program against an activation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("No such key: {key}")]
    NoSuchKey { key: String },

    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Unbound variable '{name}'")]
    Unbound { name: String },

    #[error("{0}")]
    Execution(String),
}

/// Errors from the external row decoder.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("Row decoder unavailable")]
    Unavailable,

    #[error("Cannot decode row of table '{table}' at block {block_num}: {reason}")]
    Row {
        table: String,
        block_num: u32,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

/// Errors produced while turning a block into messages.
#[derive(Debug, Error)]
pub enum AdaptError {
    #[error("Row decoding failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Evaluating {role} expression: {source}")]
    Eval {
        role: String,
        #[source]
        source: EvalError,
    },

    #[error("Action {execution_index} of transaction {trx_id} carries invalid JSON data: {source}")]
    Payload {
        trx_id: String,
        execution_index: u32,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid correlation in transaction {trx_id}: {reason}")]
    Correlation { trx_id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AdaptError {
    pub(crate) fn eval(role: impl Into<String>, source: EvalError) -> Self {
        Self::Eval {
            role: role.into(),
            source,
        }
    }
}

/// Errors from the message sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Flush timed out: {0}")]
    Flush(String),

    #[error("{0}")]
    Other(String),
}

/// Errors from the block source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Block source connection failed: {0}")]
    Connection(String),

    #[error("Cannot decode block: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors from a checkpoint backend.
///
/// The absence of a checkpoint is not an error: stores report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed checkpoint record: {0}")]
    Malformed(String),

    #[error("Cursor partition {partition} does not exist in topic '{topic}' ({available} partitions)")]
    MissingPartition {
        topic: String,
        partition: i32,
        available: usize,
    },

    #[error("Checkpoint bus error: {0}")]
    Bus(String),

    #[error("Checkpoint sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Invalid or inconsistent configuration detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid setting '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("Cannot compile {role} expression: {source}")]
    Expression {
        role: String,
        #[source]
        source: ExprError,
    },
}

/// Top-level error returned by the delivery pipeline.
///
/// Every variant is fatal to the current run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transform block {block_num} (cursor {cursor}): {source}")]
    Adapt {
        block_num: u32,
        cursor: String,
        #[source]
        source: AdaptError,
    },

    #[error("Sending message: {0}")]
    Sink(#[from] SinkError),

    #[error("Receiving block: {0}")]
    Source(#[from] SourceError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl PipelineError {
    /// Returns `true` if the error came from a strict row-decoding failure.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Self::Adapt {
                source: AdaptError::Decode(_),
                ..
            }
        )
    }
}
