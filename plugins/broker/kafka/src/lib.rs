//! Kafka-транспорт на librdkafka: consumer group с ручным commit'ом
//! и producer с асинхронными квитанциями.

mod publisher;
mod reader;

use std::collections::BTreeMap;
use std::time::Duration;

use rdkafka::error::KafkaError;
use serde::Deserialize;

use relay_api::TransportError;

pub use publisher::{KafkaPublisher, KafkaPublisherConfig};
pub use reader::{KafkaReader, KafkaReaderConfig};

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

fn default_metadata_timeout_ms() -> u64 {
    10_000
}
fn default_message_timeout_ms() -> u64 {
    30_000
}

/// Дополнительные настройки librdkafka (`[kafka]` в конфиге сервера).
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaSettings {
    /// Сколько ждать метаданных брокера при подключении.
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
    /// `message.timeout.ms` producer'а: после него доставка считается неудачной.
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Произвольные свойства consumer'а (перекрывают вычисленные).
    #[serde(default)]
    pub consumer: BTreeMap<String, String>,
    /// Произвольные свойства producer'а.
    #[serde(default)]
    pub producer: BTreeMap<String, String>,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            metadata_timeout_ms: default_metadata_timeout_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            consumer: BTreeMap::new(),
            producer: BTreeMap::new(),
        }
    }
}

impl KafkaSettings {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════

pub(crate) fn transport_error(context: &str, e: KafkaError) -> TransportError {
    let message = format!("{context}: {e}");
    match e {
        KafkaError::ClientConfig(..) | KafkaError::ClientCreation(_) | KafkaError::Subscription(_) => {
            TransportError::config(message)
        }
        KafkaError::MessageConsumption(_) | KafkaError::MetadataFetch(_) | KafkaError::Flush(_) => {
            TransportError::io(message)
        }
        _ => TransportError::new(message),
    }
}
