use std::path::{Path, PathBuf};

use serde_json::Value;

use relay_transform::NormalizedRecord;

use crate::config::SnapshotConfig;
use crate::error::PipelineError;

/// Диагностическая копия принятых записей: JSON-массив на диске.
///
/// Существующий файл дочитывается при старте, новые записи
/// добавляются в конец, файл перезаписывается при остановке.
/// На прогресс и доставку не влияет.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    pretty: bool,
    records: Vec<Value>,
}

impl Snapshot {
    pub fn open(config: &SnapshotConfig) -> Result<Self, PipelineError> {
        let records = match std::fs::read(&config.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Array(records)) => records,
                Ok(_) => {
                    return Err(PipelineError::SnapshotFormat {
                        path: display(&config.path),
                        reason: "expected a JSON array".into(),
                    });
                }
                Err(e) => {
                    return Err(PipelineError::SnapshotFormat {
                        path: display(&config.path),
                        reason: e.to_string(),
                    });
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(PipelineError::Snapshot {
                    path: display(&config.path),
                    source,
                });
            }
        };

        tracing::info!(path = %config.path.display(), existing = records.len(), "snapshot opened");
        Ok(Self {
            path: config.path.clone(),
            pretty: config.pretty,
            records,
        })
    }

    pub fn push(&mut self, record: &NormalizedRecord) {
        self.records.push(Value::Object(record.fields().clone()));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Записать файл целиком: сначала во временный, затем rename.
    pub fn write(&self) -> Result<(), PipelineError> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(&self.records)?
        } else {
            serde_json::to_vec(&self.records)?
        };

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let io_err = |source| PipelineError::Snapshot {
            path: display(&self.path),
            source,
        };
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        tracing::info!(path = %self.path.display(), records = self.records.len(), "snapshot written");
        Ok(())
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_transform::{ProcessingOutcome, Validator};

    fn record(user: &str) -> NormalizedRecord {
        let payload = format!(r#"{{"user_id":"{user}","timestamp":1,"ip":"10.0.0.1"}}"#);
        match Validator::default().validate(payload.as_bytes()) {
            ProcessingOutcome::Accepted(record) => record,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    fn config(path: PathBuf) -> SnapshotConfig {
        SnapshotConfig { path, pretty: false }
    }

    #[test]
    fn missing_file_starts_empty_and_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processed.json");

        let mut snapshot = Snapshot::open(&config(path.clone())).expect("open");
        assert!(snapshot.is_empty());
        snapshot.push(&record("u1"));
        snapshot.write().expect("write");

        let mut snapshot = Snapshot::open(&config(path.clone())).expect("reopen");
        assert_eq!(snapshot.len(), 1);
        snapshot.push(&record("u2"));
        snapshot.write().expect("write");

        let saved: Value = serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        let users: Vec<&str> = saved
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|r| r["user_id"].as_str())
            .collect();
        assert_eq!(users, ["u1", "u2"]);
    }

    #[test]
    fn non_array_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processed.json");
        std::fs::write(&path, br#"{"user_id":"u1"}"#).expect("write");

        assert!(matches!(
            Snapshot::open(&config(path)),
            Err(PipelineError::SnapshotFormat { .. })
        ));
    }

    #[test]
    fn blank_file_counts_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processed.json");
        std::fs::write(&path, b"\n").expect("write");
        assert!(Snapshot::open(&config(path)).expect("open").is_empty());
    }
}
