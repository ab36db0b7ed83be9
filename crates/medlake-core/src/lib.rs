pub mod classifier;
pub mod collector;
pub mod config;
pub mod db;
pub mod detection_loader;
pub mod detector;
pub mod error;
pub mod events;
pub mod loader;
pub mod orchestrator;
pub mod partition_store;
pub mod records;
pub mod retry;
pub mod runs;
pub mod schedule;
pub mod source;
pub mod transform;

pub use config::MedlakeConfig;
pub use error::{ErrorKind, PipelineError, Result};
pub use orchestrator::{JobRun, Orchestrator, PipelineStages, Stage, StageStatus, Trigger};
