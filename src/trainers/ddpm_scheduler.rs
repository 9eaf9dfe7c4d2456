//! DDPM noise schedule used to build training targets

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::error::config_error;
use crate::models::NoiseScheduler;

pub struct DDPMScheduler {
    num_timesteps: usize,
    beta_schedule: String,
    alphas_cumprod: Tensor,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DDPMScheduler {
    pub fn new(
        num_timesteps: usize,
        beta_start: f32,
        beta_end: f32,
        beta_schedule: &str,
        device: &Device,
    ) -> Result<Self> {
        if num_timesteps < 2 {
            return config_error("a DDPM schedule needs at least 2 timesteps");
        }
        let betas = match beta_schedule {
            "linear" => Self::linear_beta_schedule(num_timesteps, beta_start, beta_end),
            "scaled_linear" => Self::scaled_linear_beta_schedule(num_timesteps, beta_start, beta_end),
            "squaredcos_cap_v2" => Self::cosine_beta_schedule(num_timesteps),
            other => return config_error(format!("unknown beta schedule: {}", other)),
        };

        let mut alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut prod = 1.0f32;
        for beta in betas {
            prod *= 1.0 - beta;
            alphas_cumprod.push(prod);
        }
        let alphas_cumprod = Tensor::from_vec(alphas_cumprod, num_timesteps, device)?;
        let sqrt_alphas_cumprod = alphas_cumprod.sqrt()?;
        let sqrt_one_minus_alphas_cumprod = (1.0 - &alphas_cumprod)?.sqrt()?;

        Ok(Self {
            num_timesteps,
            beta_schedule: beta_schedule.to_string(),
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
        })
    }

    /// The Stable Diffusion training schedule.
    pub fn stable_diffusion(device: &Device) -> Result<Self> {
        Self::new(1000, 0.00085, 0.012, "scaled_linear", device)
    }

    pub fn beta_schedule(&self) -> &str {
        &self.beta_schedule
    }

    pub fn alphas_cumprod(&self) -> &Tensor {
        &self.alphas_cumprod
    }

    /// Per-timestep coefficient shaped `[B, 1, 1, ..]` to broadcast against `like`.
    fn gather(&self, table: &Tensor, timesteps: &Tensor, like: &Tensor) -> Result<Tensor> {
        let batch_size = timesteps.dims1()?;
        let timesteps = timesteps.to_dtype(DType::I64)?.to_device(table.device())?;
        let mut shape = vec![1usize; like.rank()];
        shape[0] = batch_size;
        let values = table
            .index_select(&timesteps, 0)?
            .reshape(shape)?
            .to_device(like.device())?
            .to_dtype(like.dtype())?;
        Ok(values)
    }

    fn linear_beta_schedule(num_timesteps: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        (0..num_timesteps)
            .map(|i| beta_start + (beta_end - beta_start) * (i as f32) / (num_timesteps as f32 - 1.0))
            .collect()
    }

    fn scaled_linear_beta_schedule(num_timesteps: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        (0..num_timesteps)
            .map(|i| {
                let t = start + (end - start) * (i as f32) / (num_timesteps as f32 - 1.0);
                t * t
            })
            .collect()
    }

    fn cosine_beta_schedule(num_timesteps: usize) -> Vec<f32> {
        let s = 0.008f32;
        let alpha_bar = |t: f32| ((t + s) / (1.0 + s) * std::f32::consts::PI / 2.0).cos().powi(2);
        (0..num_timesteps)
            .map(|i| {
                let t1 = i as f32 / num_timesteps as f32;
                let t2 = (i + 1) as f32 / num_timesteps as f32;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
            })
            .collect()
    }
}

impl NoiseScheduler for DDPMScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.num_timesteps
    }

    /// `sqrt(a_t) * x0 + sqrt(1 - a_t) * noise`
    fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let sqrt_alpha_prod = self.gather(&self.sqrt_alphas_cumprod, timesteps, original_samples)?;
        let sqrt_one_minus_alpha_prod = self.gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, original_samples)?;
        let noisy = (sqrt_alpha_prod.broadcast_mul(original_samples)? + sqrt_one_minus_alpha_prod.broadcast_mul(noise)?)?;
        Ok(noisy)
    }

    /// `sqrt(a_t) * noise - sqrt(1 - a_t) * x0`
    fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let sqrt_alpha_prod = self.gather(&self.sqrt_alphas_cumprod, timesteps, sample)?;
        let sqrt_one_minus_alpha_prod = self.gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, sample)?;
        let velocity = (sqrt_alpha_prod.broadcast_mul(noise)? - sqrt_one_minus_alpha_prod.broadcast_mul(sample)?)?;
        Ok(velocity)
    }

    fn get_snr(&self, timesteps: &Tensor) -> Result<Tensor> {
        let timesteps = timesteps.to_dtype(DType::I64)?.to_device(self.alphas_cumprod.device())?;
        let alphas_cumprod = self.alphas_cumprod.index_select(&timesteps, 0)?;
        let snr = (&alphas_cumprod / (1.0 - &alphas_cumprod)?)?;
        Ok(snr)
    }
}

/// Min-SNR loss weighting: `min(snr, gamma) / snr`
pub fn compute_snr_loss_weights(snr: &Tensor, gamma: f32) -> Result<Tensor> {
    let clipped_snr = snr.clamp(0f32, gamma)?;
    let weights = (&clipped_snr / snr)?;
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> DDPMScheduler {
        DDPMScheduler::stable_diffusion(&Device::Cpu).unwrap()
    }

    #[test]
    fn test_alphas_cumprod_decrease() {
        for schedule in ["linear", "scaled_linear", "squaredcos_cap_v2"] {
            let s = DDPMScheduler::new(100, 0.0001, 0.02, schedule, &Device::Cpu).unwrap();
            let values: Vec<f32> = s.alphas_cumprod().to_vec1().unwrap();
            assert_eq!(values.len(), 100);
            assert!(values.windows(2).all(|w| w[1] < w[0]), "{}", schedule);
            assert!(values.iter().all(|v| *v > 0.0 && *v < 1.0));
        }
        assert!(DDPMScheduler::new(100, 0.0001, 0.02, "karras", &Device::Cpu).is_err());
    }

    #[test]
    fn test_add_noise_at_extremes() {
        let s = scheduler();
        let x = Tensor::ones((2, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let noise = Tensor::zeros((2, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let t = Tensor::new(&[0i64, 999], &Device::Cpu).unwrap();
        let noisy = s.add_noise(&x, &noise, &t).unwrap();
        let first: f32 = noisy.get(0).unwrap().mean_all().unwrap().to_scalar().unwrap();
        let last: f32 = noisy.get(1).unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!(first > 0.99);
        assert!(last < 0.1);
    }

    #[test]
    fn test_velocity_matches_definition() {
        let s = scheduler();
        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        let noise = Tensor::full(2f32, (1, 3), &Device::Cpu).unwrap();
        let t = Tensor::new(&[500i64], &Device::Cpu).unwrap();
        let v: Vec<Vec<f32>> = s.get_velocity(&x, &noise, &t).unwrap().to_vec2().unwrap();

        let a: Vec<f32> = s.alphas_cumprod().to_vec1().unwrap();
        let expected = a[500].sqrt() * 2.0 - (1.0 - a[500]).sqrt();
        assert!((v[0][0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_min_snr_weights_cap_at_one() {
        let s = scheduler();
        let t = Tensor::new(&[1i64, 500, 990], &Device::Cpu).unwrap();
        let snr = s.get_snr(&t).unwrap();
        let weights: Vec<f32> = compute_snr_loss_weights(&snr, 5.0).unwrap().to_vec1().unwrap();
        assert!(weights[0] < 1.0);
        assert!((weights[2] - 1.0).abs() < 1e-6);
        assert!(weights.iter().all(|w| *w > 0.0 && *w <= 1.0));
    }
}
