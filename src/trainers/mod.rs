pub mod checkpoint;
pub mod ddpm_scheduler;
pub mod lr_scheduler;
pub mod memory_utils;
pub mod optimizer;
pub mod progress;
pub mod sampling;
pub mod sd_trainer;
pub mod step_hook;

// Re-export key types
pub use checkpoint::{CheckpointManager, SaveTarget};
pub use ddpm_scheduler::DDPMScheduler;
pub use sd_trainer::{BatchSource, SDTrainer, TrainState, TrainSummary};
pub use step_hook::{StepContext, StepLoss, TrainingMethod, TrainingMode};

use anyhow::Result;
use log::info;

use crate::config::Config;
use crate::error::config_error;
use crate::models::DiffusionModel;

/// Run every `sd_trainer` process of a job. `make_model` builds the model for
/// each process; weights are loaded later by the trainer.
pub fn run_job<M, F>(config: &Config, mut make_model: F) -> Result<Vec<TrainSummary>>
where
    M: DiffusionModel,
    F: FnMut(&crate::config::ProcessConfig) -> Result<M>,
{
    let job_name = &config.config.name;
    let mut summaries = Vec::with_capacity(config.config.process.len());
    for (idx, process) in config.config.process.iter().enumerate() {
        if process.process_type != "sd_trainer" {
            return config_error(format!("unsupported process type: {}", process.process_type));
        }
        info!("Running process {} of job {}", idx + 1, job_name);
        let model = make_model(process)?;
        let mut trainer = SDTrainer::new(job_name, process.clone(), model)?;
        summaries.push(trainer.run()?);
    }
    Ok(summaries)
}
