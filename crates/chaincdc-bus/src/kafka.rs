//! Kafka backend via `rdkafka`.
//!
//! One [`KafkaBus`] owns one `FutureProducer` used both for event messages
//! and for checkpoint records. With `transactional.id` set, a checkpoint
//! record produced during a transaction commits atomically with the
//! messages it covers.
//!
//! Cursor reads use a `BaseConsumer` with auto-commit disabled, assigned
//! to one offset at a time while scanning the partition backwards.

use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header as KafkaHeader, Message as _, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use chaincdc_core::checkpoint::CheckpointLog;
use chaincdc_core::config::KafkaConfig;
use chaincdc_core::error::{CheckpointError, SinkError};
use chaincdc_core::event::Message;
use chaincdc_core::sink::MessageSink;

use crate::error::BusError;

const METADATA_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

fn client_config(props: &BTreeMap<String, String>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in props {
        config.set(key, value);
    }
    config
}

async fn blocking<T, F>(f: F) -> Result<T, BusError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, KafkaError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BusError::Join(e.to_string()))?
        .map_err(BusError::from)
}

/// Kafka producer, cursor consumer and admin client sharing one configuration.
pub struct KafkaBus {
    topic: String,
    transactional: bool,
    producer: FutureProducer,
    consumer: Arc<BaseConsumer>,
    admin: AdminClient<DefaultClientContext>,
    in_flight: Mutex<Vec<DeliveryFuture>>,
}

impl KafkaBus {
    /// Create the clients. Initialises transactions when a transactional id is set.
    pub async fn connect(config: &KafkaConfig) -> Result<Self, BusError> {
        let producer: FutureProducer = client_config(&config.producer_properties()).create()?;

        let mut consumer_props = config.client_properties();
        consumer_props.insert("group.id".into(), config.cursor_group_id());
        consumer_props.insert("enable.auto.commit".into(), "false".into());
        let consumer: BaseConsumer = client_config(&consumer_props).create()?;

        let admin: AdminClient<DefaultClientContext> =
            client_config(&config.client_properties()).create()?;

        let transactional = config.is_transactional();
        if transactional {
            let p = producer.clone();
            blocking(move || p.init_transactions(Timeout::After(TRANSACTION_TIMEOUT))).await?;
            info!(transactional_id = ?config.transactional_id, "kafka transactions initialised");
        }

        Ok(Self {
            topic: config.topic.clone(),
            transactional,
            producer,
            consumer: Arc::new(consumer),
            admin,
            in_flight: Mutex::new(Vec::new()),
        })
    }

    fn in_flight(&self) -> MutexGuard<'_, Vec<DeliveryFuture>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<&str>,
        headers: Option<OwnedHeaders>,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
        if let Some(partition) = partition {
            record = record.partition(partition);
        }
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(headers) = headers {
            record = record.headers(headers);
        }
        let delivery = self.producer.send_result(record).map_err(|(e, _)| e)?;
        self.in_flight().push(delivery);
        Ok(())
    }

    /// Await every pending delivery report.
    async fn await_deliveries(&self) -> Result<(), BusError> {
        let pending = std::mem::take(&mut *self.in_flight());
        if pending.is_empty() {
            return Ok(());
        }
        let count = pending.len();
        for report in join_all(pending).await {
            match report {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => return Err(e.into()),
                Err(_) => return Err(BusError::Other("delivery report cancelled".into())),
            }
        }
        debug!(count, "deliveries acknowledged");
        Ok(())
    }

    async fn metadata_partitions(&self, topic: &str) -> Result<(usize, usize), BusError> {
        let consumer = Arc::clone(&self.consumer);
        let topic = topic.to_string();
        blocking(move || {
            let md = consumer.fetch_metadata(Some(&topic), METADATA_TIMEOUT)?;
            let partitions = md
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .map_or(0, |t| t.partitions().len());
            Ok((partitions, md.brokers().len()))
        })
        .await
    }
}

fn headers_of(message: &Message) -> OwnedHeaders {
    message
        .headers
        .iter()
        .fold(OwnedHeaders::new(), |acc, h| {
            acc.insert(KafkaHeader {
                key: &h.key,
                value: Some(h.value.as_bytes()),
            })
        })
}

#[async_trait]
impl MessageSink for KafkaBus {
    async fn publish(&self, message: Message) -> Result<(), SinkError> {
        self.enqueue(
            &self.topic,
            None,
            Some(&message.key),
            Some(headers_of(&message)),
            &message.value,
        )
        .map_err(|e| SinkError::Publish {
            topic: self.topic.clone(),
            reason: e.to_string(),
        })
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.await_deliveries().await?;
        let p = self.producer.clone();
        blocking(move || p.flush(Timeout::After(TRANSACTION_TIMEOUT)))
            .await
            .map_err(|e| SinkError::Flush(e.to_string()))
    }

    fn is_transactional(&self) -> bool {
        self.transactional
    }

    async fn begin_transaction(&self) -> Result<(), SinkError> {
        self.producer
            .begin_transaction()
            .map_err(|e| SinkError::Transaction(e.to_string()))
    }

    async fn commit_transaction(&self) -> Result<(), SinkError> {
        let p = self.producer.clone();
        blocking(move || p.commit_transaction(Timeout::After(TRANSACTION_TIMEOUT)))
            .await
            .map_err(|e| SinkError::Transaction(e.to_string()))?;
        // commit flushes; reports are ready
        self.await_deliveries().await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointLog for KafkaBus {
    async fn partition_count(&self, topic: &str) -> Result<usize, CheckpointError> {
        Ok(self.metadata_partitions(topic).await?.0)
    }

    async fn broker_count(&self) -> Result<usize, CheckpointError> {
        Ok(self.metadata_partitions(&self.topic).await?.1)
    }

    async fn create_topic(
        &self,
        topic: &str,
        partitions: usize,
        replication: usize,
    ) -> Result<(), CheckpointError> {
        let new_topic = NewTopic::new(
            topic,
            partitions as i32,
            TopicReplication::Fixed(replication as i32),
        );
        let options = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));
        let results = self
            .admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(BusError::from)?;
        for result in results {
            if let Err((name, code)) = result {
                return Err(CheckpointError::Bus(format!("creating topic '{name}': {code}")));
            }
        }
        info!(topic, partitions, replication, "topic created");
        Ok(())
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64), CheckpointError> {
        let consumer = Arc::clone(&self.consumer);
        let topic = topic.to_string();
        Ok(blocking(move || consumer.fetch_watermarks(&topic, partition, METADATA_TIMEOUT)).await?)
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<Option<Vec<u8>>, CheckpointError> {
        let consumer = Arc::clone(&self.consumer);
        let topic = topic.to_string();
        let polled = blocking(move || {
            let mut assignment = TopicPartitionList::new();
            assignment.add_partition_offset(&topic, partition, Offset::Offset(offset))?;
            consumer.assign(&assignment)?;
            match consumer.poll(POLL_TIMEOUT) {
                Some(Ok(msg)) => Ok(Some(msg.payload().map(<[u8]>::to_vec).unwrap_or_default())),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
        .await?;
        if polled.is_none() {
            debug!(offset, "no cursor record at offset");
        }
        Ok(polled)
    }

    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        payload: Vec<u8>,
    ) -> Result<(), CheckpointError> {
        Ok(self.enqueue(topic, Some(partition), None, None, &payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaincdc_core::event::Header;
    use rdkafka::message::Headers;

    #[test]
    fn client_config_carries_every_property() {
        let kafka = KafkaConfig {
            endpoints: "k1:9092,k2:9092".into(),
            compression_type: "lz4".parse().unwrap(),
            compression_level: 20,
            ..Default::default()
        };
        let config = client_config(&kafka.producer_properties());
        assert_eq!(config.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(config.get("compression.type"), Some("lz4"));
        assert_eq!(config.get("compression.level"), Some("12"));
    }

    #[test]
    fn headers_keep_order() {
        let message = Message {
            key: "k".into(),
            headers: vec![Header::new("ce_id", "1"), Header::new("ce_type", "T")],
            value: vec![],
        };
        let headers = headers_of(&message);
        assert_eq!(headers.count(), 2);
        assert_eq!(headers.get(0).key, "ce_id");
        assert_eq!(headers.get(1).value, Some(&b"T"[..]));
    }
}
