//! Error taxonomy for the training harness
//!
//! Everything is carried through `anyhow::Result`; callers that need to react
//! to a specific failure recover it with `err.downcast_ref::<TrainerError>()`.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum TrainerError {
    /// Unusable configuration or dataset, raised before any training step runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A bucketed item no longer matches the geometry recorded at scan time.
    #[error(
        "geometry mismatch for {}: loaded {width}x{height}, recorded scale {scale_to_width}x{scale_to_height}",
        path.display()
    )]
    GeometryMismatch {
        path: PathBuf,
        width: u32,
        height: u32,
        scale_to_width: u32,
        scale_to_height: u32,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A fresh epoch produced no batches, so restarting would spin forever.
    #[error("data loader produced no batches: {0}")]
    EmptyLoader(String),
}

impl TrainerError {
    pub fn config(msg: impl Into<String>) -> Self {
        TrainerError::Configuration(msg.into())
    }
}

/// Shorthand for bailing out with a configuration error.
pub fn config_error<T>(msg: impl Into<String>) -> anyhow::Result<T> {
    Err(TrainerError::config(msg).into())
}
