//! Step progress display. Uses an `indicatif` bar with the `progress-bar`
//! feature, plain log lines otherwise.

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

pub struct TrainProgress {
    #[cfg(feature = "progress-bar")]
    bar: ProgressBar,
    position: usize,
    total: usize,
}

impl TrainProgress {
    pub fn new(start_step: usize, total_steps: usize, job_name: &str) -> Self {
        #[cfg(feature = "progress-bar")]
        let bar = {
            let bar = ProgressBar::new(total_steps as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix} {bar:40.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_prefix(job_name.to_string());
            bar.set_position(start_step as u64);
            bar
        };
        #[cfg(not(feature = "progress-bar"))]
        log::info!("{}: starting at step {}/{}", job_name, start_step, total_steps);

        Self {
            #[cfg(feature = "progress-bar")]
            bar,
            position: start_step,
            total: total_steps,
        }
    }

    /// Mark `step` as completed.
    pub fn update(&mut self, step: usize, message: &str) {
        self.position = (step + 1).min(self.total);
        #[cfg(feature = "progress-bar")]
        {
            self.bar.set_position(self.position as u64);
            self.bar.set_message(message.to_string());
        }
        #[cfg(not(feature = "progress-bar"))]
        log::debug!("step {}/{} {}", self.position, self.total, message);
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Print a line without tearing the bar.
    pub fn println(&self, line: &str) {
        #[cfg(feature = "progress-bar")]
        self.bar.println(line);
        #[cfg(not(feature = "progress-bar"))]
        log::info!("{}", line);
    }

    pub fn finish(&self) {
        #[cfg(feature = "progress-bar")]
        self.bar.finish();
    }
}
