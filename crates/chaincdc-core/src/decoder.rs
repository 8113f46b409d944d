//! Row decoder seam: turns raw table-row bytes into structured JSON.
//!
//! The actual ABI-aware decoder lives outside this crate. When none is
//! configured, [`NoopRowDecoder`] reports itself unavailable and rows stay
//! undecoded.

use async_trait::async_trait;
use tracing::warn;

use crate::error::DecodeError;
use crate::types::{DbOp, DecodedDbOp};

/// Decodes raw row mutations at a given block height.
#[async_trait]
pub trait RowDecoder: Send + Sync {
    /// Decode every mutation, preserving order.
    async fn decode_db_ops(
        &self,
        ops: &[DbOp],
        block_num: u32,
    ) -> Result<Vec<DecodedDbOp>, DecodeError>;

    /// `false` when the decoder is a placeholder that cannot decode anything.
    fn is_available(&self) -> bool {
        true
    }
}

/// Decoder used when no ABI source is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRowDecoder;

#[async_trait]
impl RowDecoder for NoopRowDecoder {
    async fn decode_db_ops(
        &self,
        ops: &[DbOp],
        _block_num: u32,
    ) -> Result<Vec<DecodedDbOp>, DecodeError> {
        Ok(ops.iter().map(DecodedDbOp::undecoded).collect())
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// How the adapters react to a row decoding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodePolicy {
    /// Keep the mutations undecoded and log a warning.
    #[default]
    Lenient,
    /// Fail the whole block.
    Strict,
}

impl DecodePolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            Self::Strict
        } else {
            Self::Lenient
        }
    }
}

/// Decode `ops` and apply `policy` on failure.
pub async fn decode_with_policy(
    decoder: &dyn RowDecoder,
    ops: &[DbOp],
    block_num: u32,
    policy: DecodePolicy,
) -> Result<Vec<DecodedDbOp>, DecodeError> {
    if ops.is_empty() {
        return Ok(Vec::new());
    }
    match decoder.decode_db_ops(ops, block_num).await {
        Ok(decoded) => Ok(decoded),
        Err(err) if policy == DecodePolicy::Strict => Err(err),
        Err(err) => {
            warn!(block_num, error = %err, "cannot decode dbops");
            Ok(ops.iter().map(DecodedDbOp::undecoded).collect())
        }
    }
}
