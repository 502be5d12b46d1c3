use std::borrow::Cow;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════
//  Offset Reset
// ════════════════════════════════════════════════════════════════

/// Откуда начинать чтение, если у группы ещё нет сохранённого прогресса.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    /// С самой ранней доступной записи.
    #[default]
    #[serde(alias = "smallest")]
    Earliest,
    /// Только новые записи.
    #[serde(alias = "largest")]
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl std::fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" | "smallest" => Ok(OffsetReset::Earliest),
            "latest" | "largest" => Ok(OffsetReset::Latest),
            other => Err(format!("unknown offset reset policy '{other}' (expected earliest|latest)")),
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Stream positions
// ════════════════════════════════════════════════════════════════

/// Позиция записи во входном потоке. Используется только для учёта
/// прогресса, содержимое записи по ней не интерпретируется.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl std::fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Отметка прогресса для группы: `next_offset` это первая ещё не
/// обработанная запись партиции.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMark {
    pub topic: String,
    pub partition: i32,
    pub next_offset: i64,
}

// ════════════════════════════════════════════════════════════════
//  Records
// ════════════════════════════════════════════════════════════════

/// Запись в том виде, в каком её отдал входной поток.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub position: StreamPosition,
}

impl RawRecord {
    /// Ключ в читаемом виде (для логов).
    pub fn display_key(&self) -> Cow<'_, str> {
        display_key(self.key.as_deref())
    }
}

/// Запись, отправляемая в выходной поток. `ticket` связывает
/// отправку с последующим [`DeliveryReceipt`].
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub ticket: u64,
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    pub fn display_key(&self) -> Cow<'_, str> {
        display_key(self.key.as_deref())
    }
}

fn display_key(key: Option<&[u8]>) -> Cow<'_, str> {
    match key {
        Some(bytes) => String::from_utf8_lossy(bytes),
        None => Cow::Borrowed("<none>"),
    }
}

// ════════════════════════════════════════════════════════════════
//  Delivery
// ════════════════════════════════════════════════════════════════

/// Итог одной попытки публикации.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered { topic: String, partition: i32, offset: i64 },
    Failed { cause: String },
}

/// Асинхронное уведомление транспорта о результате отправки.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    pub ticket: u64,
    pub outcome: DeliveryOutcome,
}

impl DeliveryReceipt {
    pub fn delivered(ticket: u64, topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            ticket,
            outcome: DeliveryOutcome::Delivered { topic: topic.into(), partition, offset },
        }
    }

    pub fn failed(ticket: u64, cause: impl Into<String>) -> Self {
        Self {
            ticket,
            outcome: DeliveryOutcome::Failed { cause: cause.into() },
        }
    }
}
