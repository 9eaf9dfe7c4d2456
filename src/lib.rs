pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod models;
pub mod trainers;

// Re-export common types
pub use config::{load_config, Config, ProcessConfig};
pub use error::TrainerError;
pub use models::{Adapters, DiffusionModel, NoiseScheduler};
pub use trainers::{run_job, SDTrainer, TrainSummary};
