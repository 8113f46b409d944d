//! The delivery loop: receive, adapt, publish, checkpoint.
//!
//! One block is fully handled before the next one is pulled:
//!
//! ```text
//! recv ─► hook ─► adapt ─► send × N ─► commit_if_after(cursor)
//!   ▲                                         │
//!   └─────────────────────────────────────────┘
//! ```
//!
//! The cursor committed after a block always refers to that block, whose
//! messages were all handed to the sender first, so a restart never skips
//! an unpublished event. Cancellation is checked between blocks and ends
//! the run with a forced commit.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapter::{Adapter, BlockHook};
use crate::checkpoint::CheckpointStore;
use crate::cursor::Cursor;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::sink::Sender;
use crate::source::{BlockRequest, BlockSource, StreamBlock};

/// A configured pipeline. Build it with [`PipelineBuilder`](crate::PipelineBuilder).
pub struct Pipeline {
    pub(crate) request: BlockRequest,
    pub(crate) batch_mode: bool,
    pub(crate) commit_min_delay: Duration,
    pub(crate) source: Box<dyn BlockSource>,
    pub(crate) hook: Arc<dyn BlockHook>,
    pub(crate) adapter: Arc<dyn Adapter>,
    pub(crate) sender: Box<dyn Sender>,
    pub(crate) checkpoint: Arc<dyn CheckpointStore>,
    pub(crate) metrics: Arc<PipelineMetrics>,
}

enum Received {
    Cancelled,
    Block(Option<StreamBlock>),
}

impl Pipeline {
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The request the block source is (or will be) opened with.
    pub fn request(&self) -> &BlockRequest {
        &self.request
    }

    /// Load the checkpoint and open the block source at the right position.
    pub async fn resume(&mut self) -> Result<&BlockRequest, PipelineError> {
        if self.batch_mode {
            info!("running in batch mode, ignoring cursors");
        } else {
            match self.checkpoint.load().await? {
                Some(cursor) => {
                    info!(cursor = %cursor, "running in live mode, found cursor");
                    self.request.start_cursor = Some(cursor);
                }
                None => {
                    info!(
                        start_block_num = self.request.start_block,
                        "running in live mode, no cursor found: starting from beginning"
                    );
                }
            }
        }
        info!(
            filter = %self.request.include_filter,
            start_block = self.request.start_block,
            stop_block = self.request.stop_block,
            irreversible_only = self.request.irreversible_only,
            "Filter blocks"
        );
        self.source.open(&self.request).await?;
        Ok(&self.request)
    }

    /// Resume, then stream until the source ends, an error occurs, or
    /// `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), PipelineError> {
        self.resume().await?;
        info!("Start looping over blocks...");

        let mut last_cursor: Option<Cursor> = None;
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => Received::Cancelled,
                next = self.source.recv() => Received::Block(next?),
            };
            let item = match received {
                Received::Cancelled => {
                    if let Some(cursor) = &last_cursor {
                        self.commit(cursor).await?;
                    }
                    info!("cancelled while waiting for a block, stopping");
                    return Ok(());
                }
                Received::Block(None) => {
                    if let Some(cursor) = &last_cursor {
                        self.commit(cursor).await?;
                    }
                    info!(blocks = self.metrics.snapshot().blocks_received, "end of stream");
                    return Ok(());
                }
                Received::Block(Some(item)) => item,
            };

            self.process(&item).await?;

            if cancel.is_cancelled() {
                self.commit(&item.cursor).await?;
                info!(block_num = item.block.number, "terminating after forced commit");
                return Ok(());
            }
            if self
                .sender
                .commit_if_after(&item.cursor, self.commit_min_delay)
                .await?
            {
                self.metrics.record_commit();
            }
            last_cursor = Some(item.cursor);
        }
    }

    async fn process(&mut self, item: &StreamBlock) -> Result<(), PipelineError> {
        let block = &item.block;
        let actions = block
            .transactions
            .iter()
            .map(|t| t.action_traces.len())
            .sum();
        self.metrics.record_block(block.transactions.len(), actions);

        if block.number % 100 == 0 {
            info!(block_num = block.number, step = %item.step, cursor = %item.cursor, "incoming block");
        } else if block.number % 10 == 0 {
            debug!(block_num = block.number, step = %item.step, cursor = %item.cursor, "incoming block");
        }

        self.hook.on_block(block).await;

        let messages = self
            .adapter
            .adapt(block, item.step)
            .await
            .map_err(|source| PipelineError::Adapt {
                block_num: block.number,
                cursor: item.cursor.to_string(),
                source,
            })?;

        let count = messages.len();
        for message in messages {
            self.sender.send(message).await?;
        }
        self.metrics.record_sent(count);
        Ok(())
    }

    async fn commit(&mut self, cursor: &Cursor) -> Result<(), PipelineError> {
        self.sender.commit(cursor).await?;
        self.metrics.record_commit();
        Ok(())
    }
}
