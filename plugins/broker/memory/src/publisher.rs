use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};

use relay_api::{DeliveryPublisher, OutboundRecord, ReceiptCallback, SubmitError, TransportError};

use crate::MemoryBroker;

/// Publisher с ограниченной очередью. Доставку выполняет одна фоновая
/// задача в порядке отправки; квитанция приходит через callback.
pub struct MemoryPublisher {
    broker: MemoryBroker,
    tx: mpsc::Sender<OutboundRecord>,
    /// Записи в очереди плюс доставляемая в данный момент.
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl MemoryPublisher {
    pub(crate) fn new(broker: MemoryBroker, capacity: usize, callback: ReceiptCallback) -> Self {
        let (tx, mut rx) = mpsc::channel::<OutboundRecord>(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let worker_broker = broker.clone();
        let worker_pending = pending.clone();
        let worker_idle = idle.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let delay = worker_broker.delivery_delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let receipt = worker_broker.deliver(&record);
                callback(receipt);
                if worker_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    worker_idle.notify_waiters();
                }
            }
            tracing::debug!("memory publisher worker stopped");
        });

        Self { broker, tx, pending, idle }
    }

    /// Сколько записей ещё не получили квитанцию.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl DeliveryPublisher for MemoryPublisher {
    fn submit(&mut self, record: OutboundRecord) -> Result<(), SubmitError> {
        if self.broker.submissions_rejected() {
            return Err(SubmitError::Fatal(TransportError::new("publisher is rejecting submissions")));
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Err(SubmitError::QueueFull(record))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Err(SubmitError::Fatal(TransportError::closed("delivery worker stopped")))
            }
        }
    }

    fn flush(&mut self, timeout: Duration) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let idle = self.idle.notified();
                let pending = self.pending();
                if pending == 0 {
                    return Ok(());
                }
                if tokio::time::timeout_at(deadline, idle).await.is_err() {
                    return Err(TransportError::io(format!(
                        "flush timed out with {} records pending",
                        self.pending()
                    )));
                }
            }
        })
    }
}
