//! Checkpoint stores: persist the stream cursor so a run can resume.
//!
//! `load()` returns `Ok(None)` when nothing was ever saved. That is the
//! cold-start signal, not an error.
//!
//! Backends:
//!
//! | Store                    | Medium                                    |
//! |--------------------------|-------------------------------------------|
//! | [`FileCheckpointStore`]  | whole contents of a local file            |
//! | [`BusCheckpointStore`]   | latest record on a checkpoint topic       |
//! | [`MemoryCheckpointStore`]| process memory (tests)                    |
//! | [`NoopCheckpointStore`]  | nothing (batch runs)                      |

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::cursor::{CheckpointRecord, Cursor};
use crate::error::CheckpointError;

/// Persists and restores the resumption cursor.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, cursor: &Cursor) -> Result<(), CheckpointError>;

    /// The last saved cursor, or `None` on cold start.
    async fn load(&self) -> Result<Option<Cursor>, CheckpointError>;

    /// `true` when `save` writes through the message sink's own producer, so
    /// the record commits or aborts with the sink's open transaction.
    fn saves_in_sink_transaction(&self) -> bool {
        false
    }
}

// ─── File ─────────────────────────────────────────────────────────────────────

/// Stores the cursor as the entire contents of a file.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, cursor: &Cursor) -> Result<(), CheckpointError> {
        tokio::fs::write(&self.path, cursor.as_str()).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Cursor>, CheckpointError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let raw = raw.trim();
                if raw.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Cursor::new(raw)))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Noop / memory ────────────────────────────────────────────────────────────

/// Never saves, never loads. Used when the run is not meant to be resumed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpointStore;

#[async_trait]
impl CheckpointStore for NoopCheckpointStore {
    async fn save(&self, _cursor: &Cursor) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn load(&self) -> Result<Option<Cursor>, CheckpointError> {
        Ok(None)
    }
}

/// In-memory store for tests; also records every save.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    saved: Mutex<Vec<Cursor>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(cursor: impl Into<Cursor>) -> Self {
        Self {
            saved: Mutex::new(vec![cursor.into()]),
        }
    }

    /// Every cursor saved so far, oldest first.
    pub fn history(&self) -> Vec<Cursor> {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, cursor: &Cursor) -> Result<(), CheckpointError> {
        self.saved
            .lock()
            .map_err(|e| CheckpointError::Bus(e.to_string()))?
            .push(cursor.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Cursor>, CheckpointError> {
        Ok(self
            .saved
            .lock()
            .map_err(|e| CheckpointError::Bus(e.to_string()))?
            .last()
            .cloned())
    }
}

// ─── Bus ──────────────────────────────────────────────────────────────────────

/// Partition count of a freshly created checkpoint topic.
pub const CHECKPOINT_TOPIC_PARTITIONS: usize = 10;
/// Upper bound on the replication factor of a created checkpoint topic.
pub const MAX_CHECKPOINT_REPLICATION: usize = 3;

/// Log primitives needed to keep checkpoints on a message bus.
#[async_trait]
pub trait CheckpointLog: Send + Sync {
    /// Number of partitions of `topic`; `0` when the topic does not exist.
    async fn partition_count(&self, topic: &str) -> Result<usize, CheckpointError>;

    async fn broker_count(&self) -> Result<usize, CheckpointError>;

    async fn create_topic(
        &self,
        topic: &str,
        partitions: usize,
        replication: usize,
    ) -> Result<(), CheckpointError>;

    /// `(low, high)` offsets; `high` is one past the last record.
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64), CheckpointError>;

    /// The record at `offset`, or `None` if it is gone (compacted, aborted).
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<Option<Vec<u8>>, CheckpointError>;

    /// Append a record. Delivery is the log's concern.
    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        payload: Vec<u8>,
    ) -> Result<(), CheckpointError>;
}

/// Keeps `{"cursor": ...}` records on a dedicated topic partition.
///
/// The log must be the same client as the message sink: with a transactional
/// sink, records are produced inside its open transaction.
pub struct BusCheckpointStore<L> {
    log: Arc<L>,
    topic: String,
    partition: i32,
}

impl<L: CheckpointLog> BusCheckpointStore<L> {
    pub fn new(log: Arc<L>, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            log,
            topic: topic.into(),
            partition,
        }
    }

    /// Make sure the topic exists and has our partition.
    ///
    /// Returns `false` if the topic had to be created.
    async fn ensure_topic(&self) -> Result<bool, CheckpointError> {
        let partitions = self.log.partition_count(&self.topic).await?;
        if partitions == 0 {
            let replication = self
                .log
                .broker_count()
                .await?
                .clamp(1, MAX_CHECKPOINT_REPLICATION);
            info!(
                cursor_topic = %self.topic,
                num_partitions = CHECKPOINT_TOPIC_PARTITIONS,
                replication_factor = replication,
                "cursor topic does not exist, creating"
            );
            self.log
                .create_topic(&self.topic, CHECKPOINT_TOPIC_PARTITIONS, replication)
                .await?;
            return Ok(false);
        }
        if self.partition < 0 || self.partition as usize >= partitions {
            return Err(CheckpointError::MissingPartition {
                topic: self.topic.clone(),
                partition: self.partition,
                available: partitions,
            });
        }
        Ok(true)
    }
}

#[async_trait]
impl<L: CheckpointLog> CheckpointStore for BusCheckpointStore<L> {
    async fn save(&self, cursor: &Cursor) -> Result<(), CheckpointError> {
        let payload = CheckpointRecord {
            cursor: cursor.clone(),
        }
        .to_bytes()
        .map_err(|e| CheckpointError::Malformed(e.to_string()))?;
        self.log.produce(&self.topic, self.partition, payload).await
    }

    fn saves_in_sink_transaction(&self) -> bool {
        true
    }

    async fn load(&self) -> Result<Option<Cursor>, CheckpointError> {
        if !self.ensure_topic().await? {
            return Ok(None);
        }
        let (low, high) = self.log.watermarks(&self.topic, self.partition).await?;
        debug!(topic = %self.topic, partition = self.partition, low, high, "scanning cursor topic");

        for offset in (low..high).rev() {
            let Some(bytes) = self.log.fetch(&self.topic, self.partition, offset).await? else {
                continue;
            };
            let record = CheckpointRecord::from_bytes(&bytes)
                .map_err(|e| CheckpointError::Malformed(format!("offset {offset}: {e}")))?;
            return Ok(Some(record.cursor));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn file_store_roundtrip_on_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.txt");

        FileCheckpointStore::new(&path)
            .save(&Cursor::new("c1:abc"))
            .await
            .unwrap();
        let loaded = FileCheckpointStore::new(&path).load().await.unwrap();
        assert_eq!(loaded, Some(Cursor::new("c1:abc")));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "c1:abc");
    }

    #[tokio::test]
    async fn file_store_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("missing"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_other_io_errors_surface() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be read as a file
        let store = FileCheckpointStore::new(dir.path());
        assert!(matches!(store.load().await, Err(CheckpointError::Io(_))));
    }

    #[tokio::test]
    async fn memory_and_noop() {
        let mem = MemoryCheckpointStore::new();
        assert_eq!(mem.load().await.unwrap(), None);
        mem.save(&Cursor::new("a")).await.unwrap();
        mem.save(&Cursor::new("b")).await.unwrap();
        assert_eq!(mem.load().await.unwrap(), Some(Cursor::new("b")));
        assert_eq!(mem.history().len(), 2);

        NoopCheckpointStore.save(&Cursor::new("x")).await.unwrap();
        assert_eq!(NoopCheckpointStore.load().await.unwrap(), None);
    }

    /// Single-partition-aware fake log.
    #[derive(Default)]
    struct FakeLog {
        brokers: usize,
        topics: Mutex<HashMap<String, Vec<Vec<Option<Vec<u8>>>>>>,
        created: Mutex<Vec<(String, usize, usize)>>,
    }

    #[async_trait]
    impl CheckpointLog for FakeLog {
        async fn partition_count(&self, topic: &str) -> Result<usize, CheckpointError> {
            Ok(self.topics.lock().unwrap().get(topic).map_or(0, Vec::len))
        }
        async fn broker_count(&self) -> Result<usize, CheckpointError> {
            Ok(self.brokers)
        }
        async fn create_topic(&self, topic: &str, partitions: usize, replication: usize) -> Result<(), CheckpointError> {
            self.created.lock().unwrap().push((topic.into(), partitions, replication));
            self.topics
                .lock()
                .unwrap()
                .insert(topic.into(), vec![Vec::new(); partitions]);
            Ok(())
        }
        async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64), CheckpointError> {
            let topics = self.topics.lock().unwrap();
            Ok((0, topics[topic][partition as usize].len() as i64))
        }
        async fn fetch(&self, topic: &str, partition: i32, offset: i64) -> Result<Option<Vec<u8>>, CheckpointError> {
            Ok(self.topics.lock().unwrap()[topic][partition as usize][offset as usize].clone())
        }
        async fn produce(&self, topic: &str, partition: i32, payload: Vec<u8>) -> Result<(), CheckpointError> {
            self.topics.lock().unwrap().get_mut(topic).unwrap()[partition as usize].push(Some(payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn bus_store_cold_start_creates_topic() {
        let log = Arc::new(FakeLog {
            brokers: 1,
            ..Default::default()
        });
        let store = BusCheckpointStore::new(log.clone(), "cursors", 2);
        assert_eq!(store.load().await.unwrap(), None);
        assert_eq!(
            log.created.lock().unwrap().as_slice(),
            &[("cursors".to_string(), 10, 1)]
        );

        store.save(&Cursor::new("c1")).await.unwrap();
        store.save(&Cursor::new("c2")).await.unwrap();
        let fresh = BusCheckpointStore::new(log.clone(), "cursors", 2);
        assert_eq!(fresh.load().await.unwrap(), Some(Cursor::new("c2")));
    }

    #[tokio::test]
    async fn bus_store_skips_missing_offsets_backwards() {
        let log = Arc::new(FakeLog {
            brokers: 5,
            ..Default::default()
        });
        log.create_topic("cursors", 1, 3).await.unwrap();
        log.produce("cursors", 0, br#"{"cursor":"old"}"#.to_vec()).await.unwrap();
        log.topics.lock().unwrap().get_mut("cursors").unwrap()[0].push(None);

        let store = BusCheckpointStore::new(log, "cursors", 0);
        assert_eq!(store.load().await.unwrap(), Some(Cursor::new("old")));
    }

    #[tokio::test]
    async fn bus_store_rejects_missing_partition_and_garbage() {
        let log = Arc::new(FakeLog {
            brokers: 5,
            ..Default::default()
        });
        log.create_topic("cursors", 2, 3).await.unwrap();
        let err = BusCheckpointStore::new(log.clone(), "cursors", 4)
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::MissingPartition { available: 2, .. }));

        log.produce("cursors", 1, b"not json".to_vec()).await.unwrap();
        let err = BusCheckpointStore::new(log, "cursors", 1).load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed(_)));
    }
}
