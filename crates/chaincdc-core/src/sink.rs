//! Message delivery: publishing and cursor commits.
//!
//! A [`MessageSink`] is the bus client. A [`Sender`] wraps it with the
//! commit protocol: a cursor is only saved once every message published
//! before it is durable. With a transactional sink and a store that writes
//! through the sink, the checkpoint record is produced inside the same
//! transaction as the messages it covers and both become visible
//! atomically. Any other store is saved after the transaction commits.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::cursor::Cursor;
use crate::error::{CheckpointError, SinkError};
use crate::event::Message;

/// The message bus client.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Enqueue one message. May return before the message is acknowledged.
    async fn publish(&self, message: Message) -> Result<(), SinkError>;

    /// Wait until every enqueued message is acknowledged.
    async fn flush(&self) -> Result<(), SinkError>;

    fn is_transactional(&self) -> bool {
        false
    }

    async fn begin_transaction(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Publishes messages and commits cursors.
#[async_trait]
pub trait Sender: Send {
    async fn send(&mut self, message: Message) -> Result<(), SinkError>;

    /// Make everything sent so far durable, then save `cursor`.
    async fn commit(&mut self, cursor: &Cursor) -> Result<(), CheckpointError>;

    /// [`commit`](Self::commit) if nothing was committed yet or more than
    /// `min_delay` elapsed since the last commit. Returns whether it did.
    async fn commit_if_after(
        &mut self,
        cursor: &Cursor,
        min_delay: Duration,
    ) -> Result<bool, CheckpointError>;
}

/// Sender that couples publishes with checkpoint saves.
pub struct CheckpointedSender {
    sink: Arc<dyn MessageSink>,
    store: Arc<dyn CheckpointStore>,
    in_transaction: bool,
    last_commit: Option<Instant>,
}

impl CheckpointedSender {
    pub fn new(sink: Arc<dyn MessageSink>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            sink,
            store,
            in_transaction: false,
            last_commit: None,
        }
    }

    async fn ensure_transaction(&mut self) -> Result<(), SinkError> {
        if self.sink.is_transactional() && !self.in_transaction {
            self.sink.begin_transaction().await?;
            self.in_transaction = true;
        }
        Ok(())
    }
}

#[async_trait]
impl Sender for CheckpointedSender {
    async fn send(&mut self, message: Message) -> Result<(), SinkError> {
        self.ensure_transaction().await?;
        self.sink.publish(message).await
    }

    async fn commit(&mut self, cursor: &Cursor) -> Result<(), CheckpointError> {
        if self.sink.is_transactional() {
            self.ensure_transaction().await?;
            if self.store.saves_in_sink_transaction() {
                self.store.save(cursor).await?;
                self.sink.commit_transaction().await?;
                self.in_transaction = false;
            } else {
                self.sink.commit_transaction().await?;
                self.in_transaction = false;
                self.store.save(cursor).await?;
            }
        } else {
            self.sink.flush().await?;
            self.store.save(cursor).await?;
        }
        self.last_commit = Some(Instant::now());
        debug!(cursor = %cursor, "cursor committed");
        Ok(())
    }

    async fn commit_if_after(
        &mut self,
        cursor: &Cursor,
        min_delay: Duration,
    ) -> Result<bool, CheckpointError> {
        let due = self
            .last_commit
            .map_or(true, |at| at.elapsed() > min_delay);
        if due {
            self.commit(cursor).await?;
        }
        Ok(due)
    }
}

/// Logs and discards every message; commits do nothing.
#[derive(Debug, Default)]
pub struct DryRunSender {
    discarded: u64,
}

impl DryRunSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

#[async_trait]
impl Sender for DryRunSender {
    async fn send(&mut self, message: Message) -> Result<(), SinkError> {
        self.discarded += 1;
        debug!(
            key = %message.key,
            ce_type = message.header("ce_type").unwrap_or_default(),
            bytes = message.value.len(),
            "dry-run: message discarded"
        );
        Ok(())
    }

    async fn commit(&mut self, cursor: &Cursor) -> Result<(), CheckpointError> {
        info!(cursor = %cursor, discarded = self.discarded, "dry-run: commit skipped");
        Ok(())
    }

    async fn commit_if_after(&mut self, _: &Cursor, _: Duration) -> Result<bool, CheckpointError> {
        Ok(false)
    }
}
