//! Memory utilities for training

use anyhow::Result;
use candle_core::Device;

/// Release transient compute resources between phases of a step.
///
/// Called after a batch is fetched and after the backward pass. Waits for
/// queued device work so the buffers it holds are returned before the next
/// allocation-heavy phase. A no-op on the CPU.
pub fn release_transient_resources(device: &Device) -> Result<()> {
    if !device.is_cpu() {
        device.synchronize()?;
    }
    Ok(())
}

/// Map the config's device string onto a candle device.
pub fn parse_device(name: &str) -> Result<Device> {
    let name = name.trim().to_ascii_lowercase();
    if name == "cpu" {
        return Ok(Device::Cpu);
    }
    let ordinal = match name.strip_prefix("cuda") {
        Some("") => 0,
        Some(rest) => rest
            .trim_start_matches(':')
            .parse::<usize>()
            .map_err(|_| anyhow::anyhow!("invalid device: {}", name))?,
        None => anyhow::bail!("invalid device: {}", name),
    };
    Ok(Device::new_cuda(ordinal)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_device() {
        let device = parse_device("CPU").unwrap();
        assert!(device.is_cpu());
        release_transient_resources(&device).unwrap();
        assert!(parse_device("tpu").is_err());
        assert!(parse_device("cuda:x").is_err());
    }
}
