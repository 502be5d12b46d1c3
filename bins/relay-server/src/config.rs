use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use broker_memory::MemoryBrokerConfig;
use pipeline::{PipelineConfig, SnapshotConfig};
use relay_api::OffsetReset;

use crate::error::RelayError;

#[derive(Parser)]
#[command(name = "relay-server", about = "Нормализация и republish событий входа пользователей")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить пайплайн
    Run(RunArgs),
    /// Прогнать JSON Lines файл через валидатор, без брокера
    Check(CheckArgs),
}

/// Брокер, с которым работает пайплайн. По умолчанию Kafka, если
/// бинарник собран с feature `kafka`, иначе memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Kafka,
    /// In-process брокер: локальные прогоны с `[memory] seed`.
    Memory,
}

impl Default for Transport {
    fn default() -> Self {
        if cfg!(feature = "kafka") {
            Transport::Kafka
        } else {
            Transport::Memory
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Transport::Kafka => "kafka",
            Transport::Memory => "memory",
        })
    }
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Путь к TOML конфиг файлу (необязателен)
    #[arg(long, default_value = "relay.toml", env = "RELAY_CONFIG")]
    pub config: String,

    #[arg(long, value_enum, env = "RELAY_TRANSPORT")]
    pub transport: Option<Transport>,

    /// Брокеры входного потока (host:port[,host:port])
    #[arg(long, env = "RELAY_INPUT_BROKERS")]
    pub input_brokers: Option<String>,

    /// Брокеры выходного потока (по умолчанию входные)
    #[arg(long, env = "RELAY_OUTPUT_BROKERS")]
    pub output_brokers: Option<String>,

    #[arg(long, env = "RELAY_GROUP_ID")]
    pub group_id: Option<String>,

    #[arg(long, env = "RELAY_INPUT_TOPIC")]
    pub input_topic: Option<String>,

    #[arg(long, env = "RELAY_OUTPUT_TOPIC")]
    pub output_topic: Option<String>,

    /// earliest | latest
    #[arg(long, env = "RELAY_OFFSET_RESET")]
    pub offset_reset: Option<OffsetReset>,

    /// Файл snapshot'а принятых записей
    #[arg(long, env = "RELAY_SNAPSHOT")]
    pub snapshot: Option<PathBuf>,

    /// JSON Lines файл для входного topic'а (только memory transport)
    #[arg(long, env = "RELAY_SEED")]
    pub seed: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
pub struct CheckArgs {
    /// JSON Lines файл; `-` значит stdin
    pub input: String,

    /// Конфиг, из которого берётся секция [validation]
    #[arg(long, default_value = "relay.toml", env = "RELAY_CONFIG")]
    pub config: String,

    /// Принимать записи без поля ip
    #[arg(long)]
    pub allow_missing_ip: bool,
}

// ═══════════════════════════════════════════════════════════════
//  Config file (TOML)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub transport: Option<Transport>,
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub memory: MemoryBrokerConfig,
    #[cfg(feature = "kafka")]
    #[serde(default)]
    pub kafka: broker_kafka::KafkaSettings,
}

/// Отсутствующий файл даёт пустой конфиг, существующий, но битый, даёт ошибку.
pub fn load_config(path: &str) -> Result<FileConfig, RelayError> {
    if !Path::new(path).exists() {
        tracing::info!(config = %path, "config file not found, using defaults");
        return Ok(FileConfig::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| RelayError::Config {
        context: "read",
        detail: format!("'{path}': {e}"),
    })?;
    let config = toml::from_str(&content).map_err(|e| RelayError::Config {
        context: "parse",
        detail: format!("'{path}': {e}"),
    })?;
    tracing::info!(config = %path, "loaded config");
    Ok(config)
}

// ═══════════════════════════════════════════════════════════════
//  Effective: merged config
// ═══════════════════════════════════════════════════════════════

/// Итоговая конфигурация: relay.toml < env/CLI.
#[derive(Debug)]
pub struct Effective {
    pub transport: Transport,
    pub pipeline: PipelineConfig,
    pub memory: MemoryBrokerConfig,
    #[cfg(feature = "kafka")]
    pub kafka: broker_kafka::KafkaSettings,
}

impl Effective {
    pub fn new(args: &RunArgs) -> Result<Self, RelayError> {
        Self::merge(load_config(&args.config)?, args)
    }

    fn merge(file: FileConfig, args: &RunArgs) -> Result<Self, RelayError> {
        let mut pipeline = file.pipeline;
        if let Some(brokers) = &args.input_brokers {
            pipeline.input.brokers = brokers.clone();
        }
        if let Some(brokers) = &args.output_brokers {
            pipeline.output.brokers = Some(brokers.clone());
        }
        if let Some(group) = &args.group_id {
            pipeline.input.group_id = group.clone();
        }
        if let Some(topic) = &args.input_topic {
            pipeline.input.topic = topic.clone();
        }
        if let Some(topic) = &args.output_topic {
            pipeline.output.topic = topic.clone();
        }
        if let Some(reset) = args.offset_reset {
            pipeline.input.offset_reset = reset;
        }
        if let Some(path) = &args.snapshot {
            match &mut pipeline.snapshot {
                Some(snapshot) => snapshot.path = path.clone(),
                None => {
                    pipeline.snapshot = Some(SnapshotConfig {
                        path: path.clone(),
                        pretty: true,
                    })
                }
            }
        }

        let mut memory = file.memory;
        if let Some(seed) = &args.seed {
            memory.seed = Some(seed.clone());
        }

        pipeline.validate().map_err(|detail| RelayError::Config {
            context: "validate",
            detail,
        })?;

        Ok(Self {
            transport: args.transport.or(file.transport).unwrap_or_default(),
            pipeline,
            memory,
            #[cfg(feature = "kafka")]
            kafka: file.kafka,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::FailurePolicy;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["relay-server", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).expect("valid command line").command {
            Commands::Run(args) => args,
            Commands::Check(_) => panic!("expected run"),
        }
    }

    fn file(text: &str) -> FileConfig {
        toml::from_str(text).expect("valid toml")
    }

    #[test]
    fn cli_overrides_file_values() {
        let config = file(
            r#"
            transport = "kafka"

            [input]
            brokers = "file:9092"
            topic = "from-file"

            [delivery]
            on_exhausted = "hold"
            "#,
        );
        let args = run_args(&[
            "--transport", "memory",
            "--input-topic", "from-cli",
            "--offset-reset", "latest",
            "--snapshot", "out.json",
        ]);

        let eff = Effective::merge(config, &args).expect("merge");
        assert_eq!(eff.transport, Transport::Memory);
        assert_eq!(eff.pipeline.input.brokers, "file:9092");
        assert_eq!(eff.pipeline.input.topic, "from-cli");
        assert_eq!(eff.pipeline.input.offset_reset, OffsetReset::Latest);
        assert_eq!(eff.pipeline.delivery.on_exhausted, FailurePolicy::Hold);
        let snapshot = eff.pipeline.snapshot.expect("snapshot from cli");
        assert_eq!(snapshot.path, PathBuf::from("out.json"));
        assert!(snapshot.pretty);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str().expect("utf-8 path")).expect("defaults");
        assert!(config.transport.is_none());
        assert_eq!(config.pipeline.input.topic, "user-login");
        assert_eq!(config.memory.partitions, 1);
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[input\nbrokers = 1").expect("write");
        assert!(matches!(
            load_config(path.to_str().expect("utf-8 path")),
            Err(RelayError::Config { context: "parse", .. })
        ));
    }

    #[test]
    fn merged_config_is_validated() {
        let args = run_args(&["--input-topic", "same", "--output-topic", "same"]);
        assert!(matches!(
            Effective::merge(FileConfig::default(), &args),
            Err(RelayError::Config { context: "validate", .. })
        ));
    }

    #[test]
    fn default_transport_follows_build_features() {
        let eff = Effective::merge(FileConfig::default(), &run_args(&[])).expect("merge");
        let expected = if cfg!(feature = "kafka") { Transport::Kafka } else { Transport::Memory };
        assert_eq!(eff.transport, expected);
    }

    #[test]
    fn bad_offset_reset_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["relay-server", "run", "--offset-reset", "middle"]).is_err());
    }
}
