//! In-memory message bus.
//!
//! Implements both [`MessageSink`] and [`CheckpointLog`], so a single
//! `Arc<MemoryBus>` can back a `CheckpointedSender` and a
//! `BusCheckpointStore` the way one Kafka producer does in production.
//! In transactional mode, messages and checkpoint records stay invisible
//! until the transaction commits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use chaincdc_core::checkpoint::CheckpointLog;
use chaincdc_core::error::{CheckpointError, SinkError};
use chaincdc_core::event::Message;
use chaincdc_core::sink::MessageSink;

use crate::error::BusError;

#[derive(Default)]
struct State {
    /// Committed event messages.
    messages: Vec<Message>,
    /// Committed records per topic, per partition.
    topics: HashMap<String, Vec<Vec<Vec<u8>>>>,
    in_transaction: bool,
    pending_messages: Vec<Message>,
    pending_records: Vec<(String, i32, Vec<u8>)>,
    flushes: usize,
}

impl State {
    fn append(&mut self, topic: &str, partition: i32, payload: Vec<u8>) -> Result<(), BusError> {
        let partitions = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        let log = usize::try_from(partition)
            .ok()
            .and_then(|p| partitions.get_mut(p))
            .ok_or_else(|| BusError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;
        log.push(payload);
        Ok(())
    }

    fn partition(&self, topic: &str, partition: i32) -> Result<&Vec<Vec<u8>>, BusError> {
        self.topics
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?
            .get(usize::try_from(partition).unwrap_or(usize::MAX))
            .ok_or_else(|| BusError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }
}

/// A message bus living in process memory.
pub struct MemoryBus {
    brokers: usize,
    transactional: bool,
    state: Mutex<State>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Non-transactional bus backed by a single broker.
    pub fn new() -> Self {
        Self {
            brokers: 1,
            transactional: false,
            state: Mutex::new(State::default()),
        }
    }

    pub fn transactional() -> Self {
        Self {
            transactional: true,
            ..Self::new()
        }
    }

    pub fn with_brokers(mut self, brokers: usize) -> Self {
        self.brokers = brokers;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed messages, in publish order.
    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    /// Committed records of a topic partition.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Vec<u8>> {
        self.state()
            .partition(topic, partition)
            .map(Clone::clone)
            .unwrap_or_default()
    }

    /// Partition count of a topic, if it exists.
    pub fn topic_partitions(&self, topic: &str) -> Option<usize> {
        self.state().topics.get(topic).map(Vec::len)
    }

    pub fn flushes(&self) -> usize {
        self.state().flushes
    }

    /// Drop everything written since the transaction began.
    pub fn abort_transaction(&self) {
        let mut state = self.state();
        state.pending_messages.clear();
        state.pending_records.clear();
        state.in_transaction = false;
    }
}

#[async_trait]
impl MessageSink for MemoryBus {
    async fn publish(&self, message: Message) -> Result<(), SinkError> {
        let mut state = self.state();
        if state.in_transaction {
            state.pending_messages.push(message);
        } else if self.transactional {
            return Err(BusError::NoTransaction.into());
        } else {
            state.messages.push(message);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.state().flushes += 1;
        Ok(())
    }

    fn is_transactional(&self) -> bool {
        self.transactional
    }

    async fn begin_transaction(&self) -> Result<(), SinkError> {
        let mut state = self.state();
        if state.in_transaction {
            return Err(SinkError::Transaction("transaction already open".into()));
        }
        state.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), SinkError> {
        let mut state = self.state();
        if !state.in_transaction {
            return Err(BusError::NoTransaction.into());
        }
        let messages = std::mem::take(&mut state.pending_messages);
        let records = std::mem::take(&mut state.pending_records);
        debug!(messages = messages.len(), records = records.len(), "committing transaction");
        state.messages.extend(messages);
        for (topic, partition, payload) in records {
            state.append(&topic, partition, payload)?;
        }
        state.in_transaction = false;
        Ok(())
    }
}

#[async_trait]
impl CheckpointLog for MemoryBus {
    async fn partition_count(&self, topic: &str) -> Result<usize, CheckpointError> {
        Ok(self.topic_partitions(topic).unwrap_or(0))
    }

    async fn broker_count(&self) -> Result<usize, CheckpointError> {
        Ok(self.brokers)
    }

    async fn create_topic(
        &self,
        topic: &str,
        partitions: usize,
        replication: usize,
    ) -> Result<(), CheckpointError> {
        if replication > self.brokers {
            return Err(CheckpointError::Bus(format!(
                "replication factor {replication} exceeds {} brokers",
                self.brokers
            )));
        }
        self.state()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
        Ok(())
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64), CheckpointError> {
        let state = self.state();
        let len = state.partition(topic, partition)?.len();
        Ok((0, len as i64))
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<Option<Vec<u8>>, CheckpointError> {
        let state = self.state();
        let log = state.partition(topic, partition)?;
        Ok(usize::try_from(offset).ok().and_then(|o| log.get(o)).cloned())
    }

    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        payload: Vec<u8>,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state();
        if state.in_transaction {
            state.pending_records.push((topic.to_string(), partition, payload));
        } else {
            state.append(topic, partition, payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> Message {
        Message {
            key: key.into(),
            headers: vec![],
            value: vec![],
        }
    }

    #[tokio::test]
    async fn plain_publish_is_immediate() {
        let bus = MemoryBus::new();
        bus.publish(message("a")).await.unwrap();
        assert_eq!(bus.messages().len(), 1);
    }

    #[tokio::test]
    async fn transaction_hides_until_commit() {
        let bus = MemoryBus::transactional();
        bus.create_topic("cursors", 1, 1).await.unwrap();

        assert!(bus.publish(message("a")).await.is_err());

        bus.begin_transaction().await.unwrap();
        bus.publish(message("a")).await.unwrap();
        bus.produce("cursors", 0, b"c".to_vec()).await.unwrap();
        assert!(bus.messages().is_empty());
        assert!(bus.records("cursors", 0).is_empty());

        bus.commit_transaction().await.unwrap();
        assert_eq!(bus.messages().len(), 1);
        assert_eq!(bus.records("cursors", 0), vec![b"c".to_vec()]);
    }

    #[tokio::test]
    async fn abort_discards_pending() {
        let bus = MemoryBus::transactional();
        bus.begin_transaction().await.unwrap();
        bus.publish(message("a")).await.unwrap();
        bus.abort_transaction();
        assert!(bus.messages().is_empty());
        assert!(bus.commit_transaction().await.is_err());
    }

    #[tokio::test]
    async fn log_primitives() {
        let bus = MemoryBus::new().with_brokers(2);
        assert_eq!(bus.partition_count("t").await.unwrap(), 0);
        assert!(bus.create_topic("t", 3, 3).await.is_err());
        bus.create_topic("t", 3, 2).await.unwrap();
        assert_eq!(bus.partition_count("t").await.unwrap(), 3);

        bus.produce("t", 1, b"x".to_vec()).await.unwrap();
        assert_eq!(bus.watermarks("t", 1).await.unwrap(), (0, 1));
        assert_eq!(bus.fetch("t", 1, 0).await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(bus.fetch("t", 1, 5).await.unwrap(), None);
        assert!(bus.produce("t", 7, vec![]).await.is_err());
        assert!(bus.produce("missing", 0, vec![]).await.is_err());
    }
}
