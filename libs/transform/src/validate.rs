use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::normalize::{normalize_ip, normalize_locale, normalize_timestamp};
use crate::outcome::{MalformedReason, ProcessingOutcome, RejectReason};
use crate::record::{fields, NormalizedRecord, ParsedRecord};

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

/// Настройки валидатора (`[validation]` в конфиге).
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    /// Отклонять записи без `ip` (`missing-ip`). Поле не входит в список
    /// обязательных, но без него запись не публикуется.
    #[serde(default = "default_require_ip")]
    pub require_ip: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            require_ip: default_require_ip(),
        }
    }
}

fn default_require_ip() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════
//  Validator
// ═══════════════════════════════════════════════════════════════

/// Декодирование, нормализация и проверка одной записи.
///
/// Шаги выполняются строго по порядку, первая неудача завершает разбор:
/// decode → обязательные поля → locale → timestamp → ip → отметка обработки.
#[derive(Debug, Clone)]
pub struct Validator {
    require_ip: bool,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(&ValidatorConfig::default())
    }
}

impl Validator {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            require_ip: config.require_ip,
        }
    }

    /// Классифицировать сырые байты записи; `processing_time` = сейчас.
    pub fn validate(&self, payload: &[u8]) -> ProcessingOutcome {
        self.validate_at(payload, Utc::now())
    }

    /// То же, что [`Validator::validate`], с явным временем обработки.
    pub fn validate_at(&self, payload: &[u8], now: DateTime<Utc>) -> ProcessingOutcome {
        let mut record: ParsedRecord = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return ProcessingOutcome::MalformedInput(MalformedReason::NotAnObject),
            Err(_) => return ProcessingOutcome::MalformedInput(MalformedReason::DecodeError),
        };

        if !has_user_id(&record) || is_absent(record.get(fields::TIMESTAMP)) {
            return ProcessingOutcome::Rejected(RejectReason::MissingRequiredField);
        }

        if let Some(Value::String(locale)) = record.get_mut(fields::LOCALE) {
            *locale = normalize_locale(locale);
        }

        let Some(timestamp) = record.get(fields::TIMESTAMP).and_then(normalize_timestamp) else {
            return ProcessingOutcome::Rejected(RejectReason::InvalidTimestamp);
        };
        record.insert(fields::TIMESTAMP.into(), Value::String(timestamp));

        match record.get(fields::IP) {
            None if self.require_ip => {
                return ProcessingOutcome::Rejected(RejectReason::MissingIp);
            }
            None => {}
            Some(Value::String(raw)) => match normalize_ip(raw) {
                Some(canonical) => {
                    record.insert(fields::IP.into(), Value::String(canonical));
                }
                None => return ProcessingOutcome::Rejected(RejectReason::InvalidIp),
            },
            // null and non-string values count as present but unparsable
            Some(_) => return ProcessingOutcome::Rejected(RejectReason::InvalidIp),
        }

        record.insert(fields::PROCESSED.into(), Value::Bool(true));
        record.insert(
            fields::PROCESSING_TIME.into(),
            Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );

        ProcessingOutcome::Accepted(NormalizedRecord::new(record))
    }
}

fn is_absent(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn has_user_id(record: &ParsedRecord) -> bool {
    match record.get(fields::USER_ID) {
        None | Some(Value::Null) => false,
        Some(Value::String(id)) => !id.is_empty(),
        Some(_) => true,
    }
}
