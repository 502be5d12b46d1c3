use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};

use relay_api::{OffsetReset, Polled, ProgressMark, RawRecord, RecordReader, StreamPosition, TransportError};

use crate::transport_error;

#[derive(Debug, Clone)]
pub struct KafkaReaderConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub offset_reset: OffsetReset,
    pub metadata_timeout: Duration,
    pub properties: BTreeMap<String, String>,
}

/// Член consumer group'ы. Прогресс сохраняется только явным `commit`.
pub struct KafkaReader {
    consumer: StreamConsumer,
    topic: String,
    /// Последняя отметка каждой партиции: при закрытии фиксируется синхронно.
    latest: BTreeMap<(String, i32), i64>,
}

impl KafkaReader {
    /// Создать consumer, проверить доступность кластера и подписаться.
    /// Блокирует на время запроса метаданных.
    pub fn connect(config: &KafkaReaderConfig) -> Result<Self, TransportError> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", config.offset_reset.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false");
        for (key, value) in &config.properties {
            client.set(key, value);
        }

        let consumer: StreamConsumer = client
            .create()
            .map_err(|e| transport_error("create consumer", e))?;

        let metadata = consumer
            .fetch_metadata(Some(&config.topic), config.metadata_timeout)
            .map_err(|e| transport_error("connect", e))?;
        let found = metadata
            .topics()
            .iter()
            .find(|t| t.name() == config.topic)
            .map(|t| (t.error().map(|e| format!("{e:?}")), t.partitions().len()));
        let partitions = require_topic(&config.topic, found)?;
        tracing::info!(
            brokers = %config.brokers,
            group = %config.group_id,
            topic = %config.topic,
            partitions,
            "kafka consumer connected"
        );

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| transport_error("subscribe", e))?;

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            latest: BTreeMap::new(),
        })
    }
}

impl RecordReader for KafkaReader {
    fn poll(&mut self, timeout: Duration) -> Pin<Box<dyn Future<Output = Polled> + Send + '_>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.consumer.recv()).await {
                Err(_) => Polled::Empty,
                Ok(Err(e)) => Polled::Error(transport_error("consume", e)),
                Ok(Ok(message)) => Polled::Record(RawRecord {
                    key: message.key().map(<[u8]>::to_vec),
                    // Tombstones carry no payload and fail decoding downstream.
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    position: StreamPosition {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                    },
                }),
            }
        })
    }

    fn commit(&mut self, marks: &[ProgressMark]) -> Result<(), TransportError> {
        let list = partition_list(marks)?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| transport_error("commit", e))?;
        for mark in marks {
            self.latest.insert((mark.topic.clone(), mark.partition), mark.next_offset);
        }
        Ok(())
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            // An async commit still queued at unsubscribe may be lost.
            let marks: Vec<ProgressMark> = std::mem::take(&mut self.latest)
                .into_iter()
                .map(|((topic, partition), next_offset)| ProgressMark { topic, partition, next_offset })
                .collect();
            let committed = if marks.is_empty() {
                Ok(())
            } else {
                partition_list(&marks).and_then(|list| {
                    self.consumer
                        .commit(&list, CommitMode::Sync)
                        .map_err(|e| transport_error("final commit", e))
                })
            };
            self.consumer.unsubscribe();
            tracing::info!(topic = %self.topic, "kafka consumer unsubscribed");
            committed
        })
    }
}

fn partition_list(marks: &[ProgressMark]) -> Result<TopicPartitionList, TransportError> {
    let mut list = TopicPartitionList::new();
    for mark in marks {
        list.add_partition_offset(&mark.topic, mark.partition, Offset::Offset(mark.next_offset))
            .map_err(|e| transport_error("commit", e))?;
    }
    Ok(list)
}

/// Topic из ответа метаданных: `(ошибка брокера, число партиций)`.
/// Неизвестный topic при старте фатален.
fn require_topic(topic: &str, found: Option<(Option<String>, usize)>) -> Result<usize, TransportError> {
    match found {
        Some((None, partitions)) if partitions > 0 => Ok(partitions),
        Some((Some(error), _)) => Err(TransportError::config(format!("unknown topic '{topic}': {error}"))),
        _ => Err(TransportError::config(format!("unknown topic '{topic}'"))),
    }
}
