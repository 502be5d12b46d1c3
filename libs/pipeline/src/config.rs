use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use relay_api::OffsetReset;
use relay_transform::ValidatorConfig;

// ═══════════════════════════════════════════════════════════════
//  Input
// ═══════════════════════════════════════════════════════════════

/// Входной поток: откуда и в составе какой группы читать.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Список брокеров (`host:port[,host:port...]`).
    #[serde(default = "default_brokers")]
    pub brokers: String,
    /// Consumer group, под которой сохраняется прогресс.
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_input_topic")]
    pub topic: String,
    /// Откуда начинать, если у группы ещё нет сохранённого прогресса.
    #[serde(default)]
    pub offset_reset: OffsetReset,
    /// Максимальное ожидание одного poll'а.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            topic: default_input_topic(),
            offset_reset: OffsetReset::default(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl InputConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn default_brokers() -> String {
    "localhost:29092".into()
}
fn default_group_id() -> String {
    "fetch-consumer-group".into()
}
fn default_input_topic() -> String {
    "user-login".into()
}
fn default_poll_timeout_ms() -> u64 {
    1000
}

// ═══════════════════════════════════════════════════════════════
//  Output
// ═══════════════════════════════════════════════════════════════

/// Выходной поток.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Брокеры выходного кластера. По умолчанию те же, что у входа.
    #[serde(default)]
    pub brokers: Option<String>,
    #[serde(default = "default_output_topic")]
    pub topic: String,
    /// Ёмкость очереди отправки транспорта.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Пауза перед повторным submit при заполненной очереди.
    #[serde(default = "default_submit_backoff_ms")]
    pub submit_backoff_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            brokers: None,
            topic: default_output_topic(),
            queue_capacity: default_queue_capacity(),
            submit_backoff_ms: default_submit_backoff_ms(),
        }
    }
}

impl OutputConfig {
    pub fn submit_backoff(&self) -> Duration {
        Duration::from_millis(self.submit_backoff_ms)
    }
}

fn default_output_topic() -> String {
    "processed-data-topic".into()
}
fn default_queue_capacity() -> usize {
    100_000
}
fn default_submit_backoff_ms() -> u64 {
    10
}

// ═══════════════════════════════════════════════════════════════
//  Delivery
// ═══════════════════════════════════════════════════════════════

/// Что делать с записью, для которой исчерпаны повторы отправки.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Залогировать и считать запись обработанной: прогресс идёт дальше.
    #[default]
    Skip,
    /// Не двигать прогресс партиции дальше этой записи; чтение продолжается.
    Hold,
    /// Остановить пайплайн с ошибкой.
    Halt,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailurePolicy::Skip => "skip",
            FailurePolicy::Hold => "hold",
            FailurePolicy::Halt => "halt",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Сколько раз повторять отправку после первой неудачи.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub on_exhausted: FailurePolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            on_exhausted: FailurePolicy::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

// ═══════════════════════════════════════════════════════════════
//  Shutdown / Snapshot
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Сколько ждать квитанций по уже отправленным записям при остановке.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

/// Диагностический JSON-файл с принятыми записями.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    pub path: PathBuf,
    #[serde(default = "default_pretty")]
    pub pretty: bool,
}

fn default_pretty() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════
//  Pipeline Config
// ═══════════════════════════════════════════════════════════════

/// Полная конфигурация пайплайна. Все секции опциональны.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub validation: ValidatorConfig,
    #[serde(default)]
    pub snapshot: Option<SnapshotConfig>,
}

impl PipelineConfig {
    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Брокеры выходного потока с учётом значения по умолчанию.
    pub fn output_brokers(&self) -> &str {
        self.output.brokers.as_deref().unwrap_or(&self.input.brokers)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.input.brokers.trim().is_empty() {
            return Err("input.brokers must not be empty".into());
        }
        if self.output_brokers().trim().is_empty() {
            return Err("output.brokers must not be empty".into());
        }
        if self.input.group_id.trim().is_empty() {
            return Err("input.group_id must not be empty".into());
        }
        if self.input.topic.trim().is_empty() {
            return Err("input.topic must not be empty".into());
        }
        if self.output.topic.trim().is_empty() {
            return Err("output.topic must not be empty".into());
        }
        if self.input.topic == self.output.topic && self.input.brokers == self.output_brokers() {
            return Err(format!(
                "input and output topic are the same ('{}'): records would be consumed again",
                self.input.topic
            ));
        }
        if self.input.poll_timeout_ms == 0 {
            return Err("input.poll_timeout_ms must be > 0".into());
        }
        if self.output.queue_capacity == 0 {
            return Err("output.queue_capacity must be > 0".into());
        }
        if self.output.submit_backoff_ms == 0 {
            return Err("output.submit_backoff_ms must be > 0".into());
        }
        if let Some(snapshot) = &self.snapshot {
            if snapshot.path.as_os_str().is_empty() {
                return Err("snapshot.path must not be empty".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = PipelineConfig::from_toml("").expect("parse");
        assert_eq!(config.input.brokers, "localhost:29092");
        assert_eq!(config.input.group_id, "fetch-consumer-group");
        assert_eq!(config.input.topic, "user-login");
        assert_eq!(config.input.offset_reset, OffsetReset::Earliest);
        assert_eq!(config.output.topic, "processed-data-topic");
        assert_eq!(config.output_brokers(), "localhost:29092");
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.delivery.on_exhausted, FailurePolicy::Skip);
        assert_eq!(config.shutdown.drain_timeout(), Duration::from_secs(5));
        assert!(config.validation.require_ip);
        assert!(config.snapshot.is_none());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn sections_override_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [input]
            brokers = "kafka-a:9092"
            topic = "logins"
            offset_reset = "latest"

            [output]
            brokers = "kafka-b:9092"
            topic = "logins.clean"

            [delivery]
            max_retries = 0
            on_exhausted = "halt"

            [validation]
            require_ip = false

            [snapshot]
            path = "processed.json"
            "#,
        )
        .expect("parse");

        assert_eq!(config.input.offset_reset, OffsetReset::Latest);
        assert_eq!(config.output_brokers(), "kafka-b:9092");
        assert_eq!(config.delivery.on_exhausted, FailurePolicy::Halt);
        assert!(!config.validation.require_ip);
        let snapshot = config.snapshot.as_ref().expect("snapshot section");
        assert!(snapshot.pretty);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn feedback_loop_is_rejected() {
        let mut config = PipelineConfig::default();
        config.output.topic = config.input.topic.clone();
        assert!(config.validate().is_err());

        // Same name on a different cluster is a separate stream.
        config.output.brokers = Some("other:9092".into());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut config = PipelineConfig::default();
        config.output.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.input.poll_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_policy_is_a_parse_error() {
        assert!(PipelineConfig::from_toml("[delivery]\non_exhausted = \"retry\"").is_err());
    }
}
