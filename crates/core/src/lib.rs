pub mod config;
pub mod credentials;
pub mod error;
pub mod model;
pub mod ops;
pub mod reaper;
pub mod retry;
pub mod sessions;
pub mod staging;
pub mod store;
pub mod telemetry;

pub use error::PipelineError;
pub use model::{Dataset, DatasetStatus, SensorType, SourceDescriptor, SourceType};
pub use store::DatasetStore;
