//! Пайплайн ingestion → transform → publish с учётом прогресса
//! чтения (at-least-once).

pub mod config;
pub mod error;
mod progress;
mod publisher;
mod reader;
mod runner;
mod snapshot;

pub use config::{
    DeliveryConfig, FailurePolicy, InputConfig, OutputConfig, PipelineConfig, ShutdownConfig,
    SnapshotConfig,
};
pub use error::PipelineError;
pub use progress::{PipelineStats, ProgressCoordinator, ReceiptAction, Ticket};
pub use publisher::{receipt_channel, Publisher, ReceiptStream, Submission};
pub use reader::{IngestionReader, ReadStep};
pub use runner::{spawn_pipeline, Pipeline};
pub use snapshot::Snapshot;
