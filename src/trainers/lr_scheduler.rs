//! Learning-rate schedules, queried by absolute step so resuming needs no state

use anyhow::Result;

use crate::error::config_error;

pub trait LRScheduler: Send {
    fn get_lr(&self, step: usize) -> f64;
}

pub fn create_lr_scheduler(
    scheduler_type: &str,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
) -> Result<Box<dyn LRScheduler>> {
    match scheduler_type {
        "constant" => Ok(Box::new(ConstantScheduler { lr: base_lr, warmup_steps: 0 })),
        "constant_with_warmup" => Ok(Box::new(ConstantScheduler { lr: base_lr, warmup_steps })),
        "linear" => Ok(Box::new(LinearScheduler { base_lr, warmup_steps, total_steps })),
        "cosine" => Ok(Box::new(CosineScheduler {
            base_lr,
            min_lr: base_lr / 100.0,
            warmup_steps,
            total_steps,
        })),
        other => config_error(format!("unknown lr_scheduler: {}", other)),
    }
}

fn warmup_factor(step: usize, warmup_steps: usize) -> f64 {
    if step < warmup_steps {
        (step + 1) as f64 / warmup_steps as f64
    } else {
        1.0
    }
}

fn progress(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    let span = total_steps.saturating_sub(warmup_steps).max(1);
    (step.saturating_sub(warmup_steps) as f64 / span as f64).min(1.0)
}

struct ConstantScheduler {
    lr: f64,
    warmup_steps: usize,
}

impl LRScheduler for ConstantScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        self.lr * warmup_factor(step, self.warmup_steps)
    }
}

struct LinearScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LRScheduler for LinearScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * warmup_factor(step, self.warmup_steps);
        }
        self.base_lr * (1.0 - progress(step, self.warmup_steps, self.total_steps))
    }
}

struct CosineScheduler {
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LRScheduler for CosineScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * warmup_factor(step, self.warmup_steps);
        }
        let progress = progress(step, self.warmup_steps, self.total_steps);
        let cosine = ((progress * std::f64::consts::PI).cos() + 1.0) / 2.0;
        self.min_lr + (self.base_lr - self.min_lr) * cosine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_and_warmup() {
        let constant = create_lr_scheduler("constant", 1e-4, 10, 100).unwrap();
        assert_eq!(constant.get_lr(0), 1e-4);
        assert_eq!(constant.get_lr(99), 1e-4);

        let warm = create_lr_scheduler("constant_with_warmup", 1e-4, 4, 100).unwrap();
        assert!((warm.get_lr(0) - 0.25e-4).abs() < 1e-12);
        assert_eq!(warm.get_lr(4), 1e-4);
    }

    #[test]
    fn test_linear_decays_to_zero() {
        let s = create_lr_scheduler("linear", 1.0, 0, 100).unwrap();
        assert_eq!(s.get_lr(0), 1.0);
        assert!((s.get_lr(50) - 0.5).abs() < 1e-9);
        assert_eq!(s.get_lr(100), 0.0);
        assert_eq!(s.get_lr(500), 0.0);
    }

    #[test]
    fn test_cosine_ends_at_min_lr() {
        let s = create_lr_scheduler("cosine", 1.0, 0, 100).unwrap();
        assert_eq!(s.get_lr(0), 1.0);
        assert!((s.get_lr(100) - 0.01).abs() < 1e-9);
        assert!(s.get_lr(30) > s.get_lr(60));
    }

    #[test]
    fn test_unknown_scheduler_rejected() {
        assert!(create_lr_scheduler("onecycle", 1.0, 0, 10).is_err());
    }
}
