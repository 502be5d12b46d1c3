use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

mod error;
mod types;

pub use error::{ErrorKind, TransportError};
pub use types::{
    DeliveryOutcome, DeliveryReceipt, OffsetReset, OutboundRecord, ProgressMark, RawRecord,
    StreamPosition,
};

// ════════════════════════════════════════════════════════════════
//  Ingestion
// ════════════════════════════════════════════════════════════════

/// Результат одного poll'а входного потока.
#[derive(Debug)]
pub enum Polled {
    /// Следующая запись.
    Record(RawRecord),
    /// За отведённое время записей не было. Не ошибка.
    Empty,
    /// Ошибка на уровне потока (одна запись/один poll). Не фатальна.
    Error(TransportError),
}

/// Чтение входного потока в составе consumer group.
///
/// Реализации: Kafka consumer, in-memory broker. API crate не зависит
/// от async runtime, здесь только трейт.
pub trait RecordReader: Send {
    /// Получить следующую запись. Не должен блокировать дольше `timeout`.
    ///
    /// Future обязан быть cancel-safe: если его дропнули до завершения,
    /// ни одна запись не должна потеряться.
    fn poll(&mut self, timeout: Duration) -> Pin<Box<dyn Future<Output = Polled> + Send + '_>>;

    /// Сохранить прогресс группы. Может выполняться асинхронно на стороне
    /// брокера; ошибка означает, что отметки нужно повторить позже.
    fn commit(&mut self, marks: &[ProgressMark]) -> Result<(), TransportError>;

    /// Отписаться и освободить ресурсы (graceful shutdown).
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

// ════════════════════════════════════════════════════════════════
//  Delivery
// ════════════════════════════════════════════════════════════════

/// Callback, через который транспорт сообщает итог каждой отправки.
/// Вызывается ровно один раз на каждый принятый `submit`.
pub type ReceiptCallback = Arc<dyn Fn(DeliveryReceipt) + Send + Sync>;

/// Причина, по которой `submit` не принял запись.
#[derive(Debug)]
pub enum SubmitError {
    /// Внутренняя очередь транспорта заполнена, запись возвращается
    /// вызывающему для повторной попытки.
    QueueFull(OutboundRecord),
    /// Транспорт не может принимать записи.
    Fatal(TransportError),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::QueueFull(record) => write!(f, "queue full (ticket {})", record.ticket),
            SubmitError::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Публикация в выходной поток.
///
/// `submit` не блокирует: запись ставится в очередь транспорта, итог
/// приходит позже через [`ReceiptCallback`]. Порядок уведомлений
/// не обязан совпадать с порядком отправок.
pub trait DeliveryPublisher: Send {
    /// Поставить запись в очередь отправки.
    fn submit(&mut self, record: OutboundRecord) -> Result<(), SubmitError>;

    /// Дождаться отправки всего, что уже в очереди (graceful shutdown).
    fn flush(&mut self, timeout: Duration) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}
