//! Training loop driver
//!
//! Owns the step counter, the optimizer and the LR schedule. Each step draws
//! a batch (alternating with the regularization loader when one exists),
//! delegates the loss to the mode's [`TrainingMethod`], steps the optimizer,
//! then runs the sample/save/log cadence on absolute step numbers so a
//! resumed run behaves exactly like an uninterrupted one.

use anyhow::{Context, Result};
use candle_core::DType;
use log::info;
use std::collections::{BTreeMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::{parse_dtype, ProcessConfig};
use crate::data::{Batch, BatchStream, DataLoader, PromptConditioner};
use crate::error::TrainerError;
use crate::models::{DiffusionModel, PredictionType};
use crate::trainers::checkpoint::CheckpointManager;
use crate::trainers::lr_scheduler::create_lr_scheduler;
use crate::trainers::memory_utils::release_transient_resources;
use crate::trainers::optimizer::OptimizerHandle;
use crate::trainers::progress::TrainProgress;
use crate::trainers::sampling::Sampler;
use crate::trainers::step_hook::{StepContext, TrainingMethod, TrainingMode};

const LOSS_HISTORY_LEN: usize = 100;

/// Which loader feeds a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSource {
    Primary,
    Reg,
}

impl BatchSource {
    /// Even steps draw regularization data when there is any.
    pub fn for_step(step: usize, has_reg: bool) -> Self {
        if has_reg && step % 2 == 0 {
            BatchSource::Reg
        } else {
            BatchSource::Primary
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainState {
    pub step_num: usize,
    pub start_step: usize,
    loss_history: VecDeque<f32>,
}

impl TrainState {
    pub fn push_loss(&mut self, loss: f32) {
        if self.loss_history.len() == LOSS_HISTORY_LEN {
            self.loss_history.pop_front();
        }
        self.loss_history.push_back(loss);
    }

    pub fn mean_loss(&self) -> Option<f32> {
        if self.loss_history.is_empty() {
            return None;
        }
        Some(self.loss_history.iter().sum::<f32>() / self.loss_history.len() as f32)
    }
}

/// What a finished run did.
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub start_step: usize,
    pub end_step: usize,
    pub steps_run: usize,
    /// Loader used by each step that ran, in order
    pub sources: Vec<BatchSource>,
    pub final_save: PathBuf,
    pub samples: Vec<PathBuf>,
}

pub struct SDTrainer<M: DiffusionModel> {
    job_name: String,
    process: ProcessConfig,
    model: M,
    mode: TrainingMode,
    save_root: PathBuf,
    checkpoints: CheckpointManager,
    save_dtype: DType,
    state: TrainState,
    method: Option<TrainingMethod>,
}

impl<M: DiffusionModel> SDTrainer<M> {
    pub fn new(job_name: &str, process: ProcessConfig, model: M) -> Result<Self> {
        process.validate()?;
        let save_root = process.save_root(job_name);
        let checkpoints = CheckpointManager::new(&save_root, job_name, process.save.max_step_saves_to_keep);
        let save_dtype = parse_dtype(&process.save.dtype)?;
        Ok(Self {
            job_name: job_name.to_string(),
            mode: TrainingMode::from_config(&process),
            process,
            model,
            save_root,
            checkpoints,
            save_dtype,
            state: TrainState::default(),
            method: None,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    /// Trainable weights, available once `run` has built them.
    pub fn method(&self) -> Option<&TrainingMethod> {
        self.method.as_ref()
    }

    pub fn save_root(&self) -> &Path {
        &self.save_root
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn run(&mut self) -> Result<TrainSummary> {
        let train = self.process.train.clone();
        let total_steps = train.steps;

        // data first, so a bad dataset fails before the model is loaded
        let primary = DataLoader::new("train", &self.process.primary_datasets(), &train)?
            .ok_or_else(|| TrainerError::config("at least one non-regularization dataset is required"))?;
        let mut primary = BatchStream::new(primary);
        let mut reg = DataLoader::new("reg", &self.process.reg_datasets(), &train)?.map(BatchStream::new);

        self.mode.before_model_load()?;
        self.model.load_model(parse_dtype(&train.dtype)?)?;
        let mut method = self.mode.build(&mut self.model, &train)?;

        if let Some(path) = self.checkpoints.latest_save_path()? {
            info!("#### IMPORTANT RESUMING FROM {} ####", path.display());
            if let Some(step) = method.load_weights(&mut self.model, &path)? {
                self.state.step_num = step;
                self.state.start_step = step;
            }
        }
        let start_step = self.state.start_step;

        let mut optimizer = OptimizerHandle::new(&train, method.trainable_vars())?;
        let lr_scheduler = create_lr_scheduler(&train.lr_scheduler, train.lr, train.lr_warmup_steps, total_steps)?;
        optimizer.set_learning_rate(lr_scheduler.get_lr(start_step));

        method.before_train_loop()?;

        let conditioner = PromptConditioner::new(self.process.trigger_word.clone());
        let sampler = Sampler::new(&self.save_root, conditioner.clone());
        let mut samples = Vec::new();

        if let Some(first_sample) = &self.process.first_sample {
            samples.extend(sampler.sample(&self.model, &mut method, first_sample, self.state.step_num)?);
        }
        if !train.skip_first_sample {
            samples.extend(sampler.sample(&self.model, &mut method, &self.process.sample, self.state.step_num)?);
        }

        let ctx = StepContext {
            train: &train,
            conditioner: &conditioner,
            prediction_type: PredictionType::from_config(&self.process.model),
        };
        let mut progress = TrainProgress::new(start_step, total_steps, &self.job_name);
        let mut sources = Vec::with_capacity(total_steps.saturating_sub(start_step));
        if start_step < total_steps {
            info!("Training {} steps {}..{}", self.mode.name(), start_step, total_steps);
        }

        for step in start_step..total_steps {
            self.state.step_num = step;

            let source = BatchSource::for_step(step, reg.is_some());
            let batch: Batch = match (source, reg.as_mut()) {
                (BatchSource::Reg, Some(reg)) => reg.next_batch()?,
                _ => primary.next_batch()?,
            };
            sources.push(source);
            release_transient_resources(self.model.device())?;

            let step_loss = method.compute_step_loss(&self.model, &batch, &ctx)?;
            let grads = step_loss.loss.backward()?;
            release_transient_resources(self.model.device())?;

            optimizer.step(&grads)?;
            drop(grads);
            optimizer.set_learning_rate(lr_scheduler.get_lr(step + 1));
            method.after_optimizer_step()?;

            let loss = step_loss.metrics.get("loss").copied().unwrap_or(f32::NAN);
            self.state.push_loss(loss);
            let message = format!(
                "lr: {:.1e} loss: {:.3e}",
                optimizer.learning_rate(),
                self.state.mean_loss().unwrap_or(loss)
            );
            progress.update(step, &message);

            if step != start_step {
                let every = |n: usize| n > 0 && step % n == 0;
                if every(self.process.sample.sample_every) {
                    samples.extend(sampler.sample(&self.model, &mut method, &self.process.sample, step)?);
                }
                if every(self.process.save.save_every) {
                    let path = self.checkpoints.save(
                        Some(step),
                        step,
                        method.save_target(&self.model),
                        self.save_dtype,
                        &self.process.model,
                    )?;
                    progress.println(&format!("Saved checkpoint to {}", path.display()));
                }
                if every(self.process.logging.log_every) {
                    self.log_metrics(step, optimizer.learning_rate(), &step_loss.metrics)?;
                }
            }
        }
        progress.finish();

        self.state.step_num = total_steps.max(start_step);
        samples.extend(sampler.sample(&self.model, &mut method, &self.process.sample, self.state.step_num)?);
        let final_save = self.checkpoints.save(
            None,
            self.state.step_num,
            method.save_target(&self.model),
            self.save_dtype,
            &self.process.model,
        )?;
        info!("Training complete: {}", final_save.display());

        let steps_run = sources.len();
        self.method = Some(method);
        Ok(TrainSummary {
            start_step,
            end_step: self.state.step_num,
            steps_run,
            sources,
            final_save,
            samples,
        })
    }

    fn log_metrics(&self, step: usize, lr: f64, metrics: &BTreeMap<String, f32>) -> Result<()> {
        let rendered: Vec<String> = metrics.iter().map(|(k, v)| format!("{}: {:.4e}", k, v)).collect();
        info!("step {} lr {:.2e} {}", step, lr, rendered.join(" "));
        if self.process.logging.verbose {
            if let Some(mean) = self.state.mean_loss() {
                info!("  mean loss over last {} steps: {:.4e}", self.state.loss_history.len(), mean);
            }
        }

        let Some(file) = &self.process.logging.metrics_file else {
            return Ok(());
        };
        let path = self.save_root.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = serde_json::json!({
            "step": step,
            "lr": lr,
            "metrics": metrics,
            "time": chrono::Local::now().to_rfc3339(),
        });
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open metrics file: {}", path.display()))?;
        writeln!(out, "{}", record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_alternates_by_parity() {
        let sources: Vec<BatchSource> = (4..8).map(|s| BatchSource::for_step(s, true)).collect();
        assert_eq!(
            sources,
            vec![BatchSource::Reg, BatchSource::Primary, BatchSource::Reg, BatchSource::Primary]
        );
        assert!((0..5).all(|s| BatchSource::for_step(s, false) == BatchSource::Primary));
    }

    #[test]
    fn test_loss_history_is_bounded() {
        let mut state = TrainState::default();
        assert!(state.mean_loss().is_none());
        for i in 0..250 {
            state.push_loss(i as f32);
        }
        assert_eq!(state.loss_history.len(), LOSS_HISTORY_LEN);
        // mean of 150..250
        assert_eq!(state.mean_loss(), Some(199.5));
    }
}
