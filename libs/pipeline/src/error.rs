use relay_api::{StreamPosition, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("config: {0}")]
    Config(String),

    #[error("transport ({stage}): {source}")]
    FatalTransport { stage: &'static str, source: TransportError },

    #[error("delivery of record {key} from {position} failed permanently: {cause}")]
    DeliveryHalted { key: String, position: StreamPosition, cause: String },

    #[error("record serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot ({path}): {source}")]
    Snapshot { path: String, source: std::io::Error },

    #[error("snapshot ({path}): {reason}")]
    SnapshotFormat { path: String, reason: String },
}

impl PipelineError {
    pub(crate) fn transport(stage: &'static str, source: TransportError) -> Self {
        PipelineError::FatalTransport { stage, source }
    }
}
