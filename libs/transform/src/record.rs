use serde::Serialize;
use serde_json::{Map, Value};

/// Декодированная запись: поле → значение, в исходном порядке полей.
pub type ParsedRecord = Map<String, Value>;

/// Имена полей, которые трансформация читает или выставляет.
/// Остальные поля проходят без изменений.
pub mod fields {
    pub const USER_ID: &str = "user_id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const LOCALE: &str = "locale";
    pub const IP: &str = "ip";
    pub const DEVICE_TYPE: &str = "device_type";
    pub const APP_VERSION: &str = "app_version";
    pub const PROCESSED: &str = "processed";
    pub const PROCESSING_TIME: &str = "processing_time";
}

/// Запись, прошедшая нормализацию и валидацию. Создаётся только
/// валидатором, поэтому её инварианты (канонический ip, ISO-8601
/// timestamp, `processed = true`) всегда выполнены.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NormalizedRecord(ParsedRecord);

impl NormalizedRecord {
    pub(crate) fn new(fields: ParsedRecord) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &ParsedRecord {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Строковое значение поля, если оно строка.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// UTF-8 JSON для выходного потока.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }
}
