use std::time::Duration;

use relay_api::{Polled, ProgressMark, RawRecord, RecordReader, TransportError};

/// Чтение входного потока поверх транспорта. Ошибки отдельных poll'ов
/// логируются и не прерывают чтение.
pub struct IngestionReader {
    inner: Box<dyn RecordReader>,
    topic: String,
    poll_timeout: Duration,
}

/// Итог одного шага чтения.
#[derive(Debug)]
pub enum ReadStep {
    Record(RawRecord),
    Idle,
    StreamError,
}

impl IngestionReader {
    pub fn new(inner: Box<dyn RecordReader>, topic: impl Into<String>, poll_timeout: Duration) -> Self {
        Self {
            inner,
            topic: topic.into(),
            poll_timeout,
        }
    }

    /// Cancel-safe: future можно бросить в `select!` без потери записи.
    pub async fn next(&mut self) -> ReadStep {
        match self.inner.poll(self.poll_timeout).await {
            Polled::Record(record) => {
                tracing::trace!(position = %record.position, key = %record.display_key(), "record read");
                ReadStep::Record(record)
            }
            Polled::Empty => ReadStep::Idle,
            Polled::Error(e) => {
                tracing::warn!(topic = %self.topic, kind = %e.kind(), error = %e, "stream error, continuing");
                ReadStep::StreamError
            }
        }
    }

    pub fn commit(&mut self, marks: &[ProgressMark]) -> Result<(), TransportError> {
        self.inner.commit(marks)
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
