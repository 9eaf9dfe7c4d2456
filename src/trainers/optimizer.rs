use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::config::TrainConfig;
use crate::error::config_error;

/// The configured optimizer. `candle_nn::Optimizer` is not object safe, so
/// the supported kinds are enumerated.
pub enum OptimizerHandle {
    AdamW(AdamW),
    Sgd(SGD),
}

impl OptimizerHandle {
    pub fn new(config: &TrainConfig, vars: Vec<Var>) -> Result<Self> {
        match config.optimizer.to_ascii_lowercase().as_str() {
            "adamw" => Ok(OptimizerHandle::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: config.lr,
                    weight_decay: config.weight_decay,
                    ..Default::default()
                },
            )?)),
            "adam" => Ok(OptimizerHandle::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: config.lr,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?)),
            "sgd" => Ok(OptimizerHandle::Sgd(SGD::new(vars, config.lr)?)),
            other => config_error(format!("unsupported optimizer: {}", other)),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            OptimizerHandle::AdamW(opt) => opt.step(grads)?,
            OptimizerHandle::Sgd(opt) => opt.step(grads)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            OptimizerHandle::AdamW(opt) => opt.learning_rate(),
            OptimizerHandle::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            OptimizerHandle::AdamW(opt) => opt.set_learning_rate(lr),
            OptimizerHandle::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}
