use serde::Serialize;

use crate::NormalizedRecord;

/// Причина отказа в публикации. Закрытый набор, по нему ведутся счётчики.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Нет `user_id` (или он пуст) либо нет `timestamp`.
    MissingRequiredField,
    /// `timestamp` не является числом epoch-секунд в допустимом диапазоне.
    InvalidTimestamp,
    /// `ip` присутствует, но не разбирается как IPv4/IPv6.
    InvalidIp,
    /// `ip` отсутствует.
    MissingIp,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingRequiredField => "missing-required-field",
            RejectReason::InvalidTimestamp => "invalid-timestamp",
            RejectReason::InvalidIp => "invalid-ip",
            RejectReason::MissingIp => "missing-ip",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Почему байты записи не удалось разобрать.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MalformedReason {
    /// Не UTF-8 / не JSON.
    DecodeError,
    /// JSON, но не объект.
    NotAnObject,
}

impl MalformedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MalformedReason::DecodeError => "decode-error",
            MalformedReason::NotAnObject => "not-an-object",
        }
    }
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Итог классификации одной записи.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Accepted(NormalizedRecord),
    Rejected(RejectReason),
    MalformedInput(MalformedReason),
}
