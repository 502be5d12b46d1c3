#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("transport: {0}")]
    Transport(#[from] relay_api::TransportError),

    #[error("{0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("pipeline task: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
