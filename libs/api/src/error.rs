/// Категория ошибки транспорта. По ней пайплайн и логи отличают
/// неверную настройку клиента от сбоя сети.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Клиент не создаётся с такими настройками. Повтор не поможет.
    Config,
    /// Сеть, брокер, файловая система.
    Io,
    /// Клиент уже закрыт или его фоновая задача остановилась.
    Closed,
    /// Всё остальное (неизвестная партиция, ошибка протокола).
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Closed => "closed",
            ErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ошибка [`RecordReader`](crate::RecordReader) /
/// [`DeliveryPublisher`](crate::DeliveryPublisher): категория + текст
/// от клиента брокера.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportError {
    kind: ErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Other, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Config, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Io, msg)
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Closed, msg)
    }

    fn with_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Debug for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_shows_kind_and_display_shows_message() {
        let e = TransportError::closed("reader is closed");
        assert_eq!(e.kind(), ErrorKind::Closed);
        assert_eq!(e.to_string(), "reader is closed");
        assert_eq!(format!("{e:?}"), "[closed] reader is closed");
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let e: TransportError = std::io::Error::other("broken pipe").into();
        assert_eq!(e.kind(), ErrorKind::Io);
        assert_eq!(e.message(), "broken pipe");
    }
}
