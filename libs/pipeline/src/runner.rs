use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_api::{DeliveryPublisher, DeliveryReceipt, OutboundRecord, RawRecord, RecordReader};
use relay_transform::{ProcessingOutcome, Validator};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::progress::{PipelineStats, ProgressCoordinator, ReceiptAction};
use crate::publisher::{Publisher, ReceiptStream, Submission};
use crate::reader::{IngestionReader, ReadStep};
use crate::snapshot::Snapshot;

/// Минимальное время на flush транспорта, даже если drain исчерпан.
const MIN_FLUSH: Duration = Duration::from_millis(100);

enum Event {
    Stop,
    Receipt(DeliveryReceipt),
    Read(ReadStep),
}

// ═══════════════════════════════════════════════════════════════
//  Pipeline
// ═══════════════════════════════════════════════════════════════

/// Цикл read → validate → publish → commit.
///
/// Вся обработка идёт в одной задаче: квитанции транспорта приходят
/// через канал и применяются между poll'ами, поэтому состояние
/// прогресса не требует синхронизации.
pub struct Pipeline {
    reader: IngestionReader,
    publisher: Publisher,
    receipts: ReceiptStream,
    validator: Validator,
    progress: ProgressCoordinator,
    snapshot: Option<Snapshot>,
    input_topic: String,
    output_topic: String,
    drain_timeout: Duration,
}

impl Pipeline {
    /// `receipts` должен быть парой к callback'у, переданному `publisher`.
    pub fn new(
        config: &PipelineConfig,
        reader: Box<dyn RecordReader>,
        publisher: Box<dyn DeliveryPublisher>,
        receipts: ReceiptStream,
    ) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        let snapshot = config.snapshot.as_ref().map(Snapshot::open).transpose()?;

        Ok(Self {
            reader: IngestionReader::new(reader, config.input.topic.clone(), config.input.poll_timeout()),
            publisher: Publisher::new(publisher, config.output.submit_backoff()),
            receipts,
            validator: Validator::new(&config.validation),
            progress: ProgressCoordinator::new(config.delivery.clone()),
            snapshot,
            input_topic: config.input.topic.clone(),
            output_topic: config.output.topic.clone(),
            drain_timeout: config.shutdown.drain_timeout(),
        })
    }

    pub fn stats(&self) -> &PipelineStats {
        self.progress.stats()
    }

    /// Работать до отмены `token` или фатальной ошибки. В обоих случаях
    /// выполняется упорядоченная остановка: drain квитанций, flush,
    /// финальный commit, закрытие reader'а, запись snapshot'а.
    pub async fn run(mut self, token: CancellationToken) -> Result<PipelineStats, PipelineError> {
        tracing::info!(input = %self.input_topic, output = %self.output_topic, "pipeline started");

        // Local child: stopping the pipeline after an error must not cancel the caller's token.
        let stop = token.child_token();
        let consumed = self.consume(&stop).await;
        if let Err(e) = &consumed {
            tracing::error!(error = %e, "pipeline stopping after error");
        }
        let shut = self.shutdown(&stop).await;

        let stats = self.progress.stats().clone();
        tracing::info!(
            read = stats.read,
            accepted = stats.accepted,
            rejected = stats.rejected,
            malformed = stats.malformed,
            delivered = stats.delivered,
            skipped = stats.skipped,
            held = stats.held,
            abandoned = stats.abandoned,
            stream_errors = stats.stream_errors,
            "pipeline stopped"
        );

        consumed?;
        shut?;
        Ok(stats)
    }

    async fn consume(&mut self, stop: &CancellationToken) -> Result<(), PipelineError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => Event::Stop,
                Some(receipt) = self.receipts.recv() => Event::Receipt(receipt),
                step = self.reader.next() => Event::Read(step),
            };

            match event {
                Event::Stop => return Ok(()),
                Event::Receipt(receipt) => self.on_receipt(receipt, stop, self.drain_timeout).await?,
                Event::Read(ReadStep::Record(record)) => self.on_record(record, stop).await?,
                Event::Read(ReadStep::StreamError) => self.progress.record_stream_error(),
                Event::Read(ReadStep::Idle) => {}
            }
            self.commit_progress();
        }
    }

    async fn on_record(&mut self, raw: RawRecord, stop: &CancellationToken) -> Result<(), PipelineError> {
        let key = raw.display_key().into_owned();
        let ticket = self.progress.begin(raw.position.clone(), key.clone());

        match self.validator.validate(&raw.payload) {
            ProcessingOutcome::Accepted(record) => {
                self.progress.accept(ticket);
                let payload = record.to_bytes()?;
                if let Some(snapshot) = &mut self.snapshot {
                    snapshot.push(&record);
                }
                let outbound = OutboundRecord {
                    ticket,
                    topic: self.output_topic.clone(),
                    key: raw.key,
                    payload,
                };
                self.submit(outbound, stop, self.drain_timeout).await?;
            }
            ProcessingOutcome::Rejected(reason) => {
                tracing::warn!(key = %key, position = %raw.position, %reason, "record rejected");
                self.progress.reject(ticket, reason);
            }
            ProcessingOutcome::MalformedInput(reason) => {
                tracing::warn!(key = %key, position = %raw.position, %reason, "malformed record skipped");
                self.progress.malformed(ticket, reason);
            }
        }
        Ok(())
    }

    async fn submit(
        &mut self,
        record: OutboundRecord,
        stop: &CancellationToken,
        drain: Duration,
    ) -> Result<(), PipelineError> {
        let ticket = record.ticket;
        self.progress.submitted(&record);
        match self.publisher.submit(record, stop, drain).await {
            Ok(Submission::Submitted) => Ok(()),
            Ok(Submission::Abandoned(record)) => {
                tracing::warn!(key = %record.display_key(), ticket, "publisher queue still full at shutdown, record not sent");
                self.progress.abandoned(ticket);
                Ok(())
            }
            Err(e) => {
                self.progress.abandoned(ticket);
                Err(PipelineError::transport("submit", e))
            }
        }
    }

    async fn on_receipt(
        &mut self,
        receipt: DeliveryReceipt,
        stop: &CancellationToken,
        drain: Duration,
    ) -> Result<(), PipelineError> {
        match self.progress.acknowledge(receipt) {
            ReceiptAction::Delivered { key, destination } => {
                tracing::debug!(key = %key, destination = %destination, "record delivered");
            }
            ReceiptAction::Retry { key, retry, cause, record } => {
                tracing::warn!(key = %key, retry, cause = %cause, "delivery failed, resubmitting");
                self.submit(record, stop, drain).await?;
            }
            ReceiptAction::Skipped { key, position, cause } => {
                tracing::error!(key = %key, position = %position, cause = %cause, "delivery failed, retries exhausted, record skipped");
            }
            ReceiptAction::Held { key, position, cause } => {
                tracing::error!(key = %key, position = %position, cause = %cause, "delivery failed, retries exhausted, partition progress held");
            }
            ReceiptAction::Halt { key, position, cause } => {
                return Err(PipelineError::DeliveryHalted { key, position, cause });
            }
            ReceiptAction::Unknown { ticket } => {
                tracing::debug!(ticket, "receipt for unknown ticket ignored");
            }
        }
        Ok(())
    }

    fn commit_progress(&mut self) {
        let marks = self.progress.pending_marks();
        if marks.is_empty() {
            return;
        }
        match self.reader.commit(&marks) {
            Ok(()) => {
                tracing::trace!(marks = marks.len(), "progress committed");
                self.progress.confirm(&marks);
            }
            Err(e) => tracing::warn!(error = %e, marks = marks.len(), "progress commit failed, will retry"),
        }
    }

    async fn shutdown(&mut self, stop: &CancellationToken) -> Result<(), PipelineError> {
        stop.cancel();
        let deadline = Instant::now() + self.drain_timeout;
        let mut first_err = None;

        if self.progress.in_flight() > 0 {
            tracing::info!(in_flight = self.progress.in_flight(), "draining outstanding deliveries");
        }
        while self.progress.in_flight() > 0 {
            match tokio::time::timeout_at(deadline, self.receipts.recv()).await {
                Ok(Some(receipt)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if let Err(e) = self.on_receipt(receipt, stop, remaining).await {
                        first_err.get_or_insert(e);
                    }
                    self.commit_progress();
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(in_flight = self.progress.in_flight(), "drain timed out, unacknowledged records will be read again");
                    break;
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now()).max(MIN_FLUSH);
        if let Err(e) = self.publisher.flush(remaining).await {
            tracing::warn!(error = %e, "publisher flush failed");
        }
        // Receipts that raced with the flush.
        while let Some(receipt) = self.receipts.try_recv() {
            if let Err(e) = self.on_receipt(receipt, stop, Duration::ZERO).await {
                first_err.get_or_insert(e);
            }
        }
        self.commit_progress();

        if let Err(e) = self.reader.close().await {
            tracing::warn!(error = %e, "reader close failed");
        }
        if let Some(snapshot) = &self.snapshot {
            if let Err(e) = snapshot.write() {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Запустить пайплайн отдельной задачей.
pub fn spawn_pipeline(pipeline: Pipeline, token: CancellationToken) -> JoinHandle<Result<PipelineStats, PipelineError>> {
    tokio::spawn(pipeline.run(token))
}
