use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use relay_api::{OffsetReset, Polled, ProgressMark, RawRecord, RecordReader, StreamPosition, TransportError};

use crate::MemoryBroker;

/// Член consumer group'ы: читает все партиции topic'а по кругу.
pub struct MemoryReader {
    broker: MemoryBroker,
    group: String,
    topic: String,
    reset: OffsetReset,
    /// partition → следующий offset для чтения.
    positions: HashMap<i32, i64>,
    next_partition: usize,
    closed: bool,
}

impl MemoryReader {
    pub(crate) fn new(broker: MemoryBroker, group: &str, topic: &str, reset: OffsetReset) -> Self {
        let mut reader = Self {
            broker,
            group: group.to_string(),
            topic: topic.to_string(),
            reset,
            positions: HashMap::new(),
            next_partition: 0,
            closed: false,
        };
        // "latest" is relative to the moment of joining the group.
        reader.try_next_record(false);
        reader
    }

    /// Следующая запись, если она уже есть. Позиции партиций, которые
    /// появились впервые, инициализируются из commit'а группы или по reset.
    fn try_next_record(&mut self, consume: bool) -> Option<Polled> {
        let mut state = self.broker.lock();
        if consume && state.poll_faults > 0 {
            state.poll_faults -= 1;
            return Some(Polled::Error(TransportError::io("injected poll failure")));
        }

        let partitions = state.topics.get(&self.topic)?;
        let count = partitions.len();
        for (index, log) in partitions.iter().enumerate() {
            let partition = index as i32;
            if !self.positions.contains_key(&partition) {
                let key = (self.group.clone(), self.topic.clone(), partition);
                let start = match (state.committed.get(&key), self.reset) {
                    (Some(committed), _) => *committed,
                    (None, OffsetReset::Earliest) => 0,
                    (None, OffsetReset::Latest) => log.len() as i64,
                };
                self.positions.insert(partition, start);
            }
        }
        if !consume {
            return None;
        }

        for step in 0..count {
            let index = (self.next_partition + step) % count;
            let partition = index as i32;
            let next = self.positions.get(&partition).copied().unwrap_or(0);
            let Some(stored) = usize::try_from(next).ok().and_then(|n| partitions[index].get(n)) else {
                continue;
            };
            let record = RawRecord {
                key: stored.key.clone(),
                payload: stored.payload.clone(),
                position: StreamPosition {
                    topic: self.topic.clone(),
                    partition,
                    offset: stored.offset,
                },
            };
            self.positions.insert(partition, next + 1);
            self.next_partition = index + 1;
            return Some(Polled::Record(record));
        }
        None
    }
}

impl RecordReader for MemoryReader {
    fn poll(&mut self, timeout: Duration) -> Pin<Box<dyn Future<Output = Polled> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Polled::Error(TransportError::closed("reader is closed"));
            }
            let deadline = tokio::time::Instant::now() + timeout;
            let shared = self.broker.shared.clone();
            loop {
                // Registered before the check so an append in between is not missed.
                let appended = shared.appended.notified();
                if let Some(polled) = self.try_next_record(true) {
                    return polled;
                }
                if tokio::time::timeout_at(deadline, appended).await.is_err() {
                    return Polled::Empty;
                }
            }
        })
    }

    fn commit(&mut self, marks: &[ProgressMark]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::closed("reader is closed"));
        }
        let mut state = self.broker.lock();
        for mark in marks {
            state
                .committed
                .insert((self.group.clone(), mark.topic.clone(), mark.partition), mark.next_offset);
        }
        Ok(())
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            self.closed = true;
            tracing::debug!(group = %self.group, topic = %self.topic, "memory reader closed");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    async fn payload(reader: &mut MemoryReader) -> Vec<u8> {
        match reader.poll(WAIT).await {
            Polled::Record(record) => record.payload,
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_topic_times_out_without_error() {
        let broker = MemoryBroker::new();
        let mut reader = broker.reader("g", "missing", OffsetReset::Earliest);
        assert!(matches!(reader.poll(WAIT).await, Polled::Empty));
    }

    #[tokio::test]
    async fn earliest_reads_history_latest_only_new() {
        let broker = MemoryBroker::new();
        broker.append("t", None, b"old");

        let mut earliest = broker.reader("a", "t", OffsetReset::Earliest);
        let mut latest = broker.reader("b", "t", OffsetReset::Latest);
        broker.append("t", None, b"new");

        assert_eq!(payload(&mut earliest).await, b"old");
        assert_eq!(payload(&mut earliest).await, b"new");
        assert_eq!(payload(&mut latest).await, b"new");
        assert!(matches!(latest.poll(WAIT).await, Polled::Empty));
    }

    #[tokio::test]
    async fn committed_progress_wins_over_reset() {
        let broker = MemoryBroker::new();
        for p in [b"a", b"b", b"c"] {
            broker.append("t", None, p);
        }
        let mut first = broker.reader("g", "t", OffsetReset::Earliest);
        payload(&mut first).await;
        first
            .commit(&[ProgressMark { topic: "t".into(), partition: 0, next_offset: 2 }])
            .expect("commit");
        first.close().await.expect("close");

        let mut second = broker.reader("g", "t", OffsetReset::Earliest);
        assert_eq!(payload(&mut second).await, b"c");
        assert_eq!(broker.committed("g", "t", 0), Some(2));
    }

    #[tokio::test]
    async fn waiting_poll_wakes_on_append() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 1);
        let mut reader = broker.reader("g", "t", OffsetReset::Earliest);

        let writer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("t", None, b"late");
        });

        match reader.poll(Duration::from_secs(5)).await {
            Polled::Record(record) => assert_eq!(record.payload, b"late"),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn injected_faults_surface_as_stream_errors() {
        let broker = MemoryBroker::new();
        broker.append("t", None, b"x");
        broker.fail_next_polls(2);
        let mut reader = broker.reader("g", "t", OffsetReset::Earliest);

        assert!(matches!(reader.poll(WAIT).await, Polled::Error(_)));
        assert!(matches!(reader.poll(WAIT).await, Polled::Error(_)));
        assert_eq!(payload(&mut reader).await, b"x");
    }
}
