use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_api::{DeliveryPublisher, DeliveryReceipt, OutboundRecord, ReceiptCallback, SubmitError, TransportError};

// ═══════════════════════════════════════════════════════════════
//  Receipts
// ═══════════════════════════════════════════════════════════════

/// Канал квитанций: callback отдаётся транспорту, приёмник остаётся пайплайну.
/// Квитанции приходят из потоков транспорта, а обрабатываются только
/// в цикле пайплайна.
pub fn receipt_channel() -> (ReceiptCallback, ReceiptStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ReceiptCallback = Arc::new(move |receipt: DeliveryReceipt| {
        if tx.send(receipt).is_err() {
            tracing::trace!("receipt dropped: pipeline is gone");
        }
    });
    (callback, ReceiptStream { rx })
}

pub struct ReceiptStream {
    rx: mpsc::UnboundedReceiver<DeliveryReceipt>,
}

impl ReceiptStream {
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<DeliveryReceipt> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeliveryReceipt> {
        self.rx.try_recv().ok()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Publisher
// ═══════════════════════════════════════════════════════════════

/// Итог передачи записи транспорту.
#[derive(Debug)]
pub enum Submission {
    Submitted,
    /// Очередь так и не освободилась до конца drain'а.
    Abandoned(OutboundRecord),
}

/// Отправка поверх транспорта с повтором при заполненной очереди.
pub struct Publisher {
    inner: Box<dyn DeliveryPublisher>,
    backoff: Duration,
}

impl Publisher {
    pub fn new(inner: Box<dyn DeliveryPublisher>, backoff: Duration) -> Self {
        Self { inner, backoff }
    }

    /// Передать запись транспорту. Пока очередь заполнена, пауза
    /// `backoff` и повтор. После отмены `stop` повторы ограничены
    /// `drain` от момента, когда отмена была замечена.
    pub async fn submit(
        &mut self,
        mut record: OutboundRecord,
        stop: &CancellationToken,
        drain: Duration,
    ) -> Result<Submission, TransportError> {
        let mut deadline: Option<Instant> = None;
        let mut waits = 0u64;
        loop {
            match self.inner.submit(record) {
                Ok(()) => {
                    if waits > 0 {
                        tracing::debug!(waits, "publisher queue drained, record submitted");
                    }
                    return Ok(Submission::Submitted);
                }
                Err(SubmitError::Fatal(e)) => return Err(e),
                Err(SubmitError::QueueFull(back)) => record = back,
            }

            if waits == 0 {
                tracing::debug!(ticket = record.ticket, "publisher queue full, backing off");
            }
            waits += 1;

            if stop.is_cancelled() {
                let limit = *deadline.get_or_insert_with(|| Instant::now() + drain);
                if Instant::now() >= limit {
                    return Ok(Submission::Abandoned(record));
                }
            }
            tokio::time::sleep(self.backoff).await;
        }
    }

    pub async fn flush(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.inner.flush(timeout).await
    }
}
