use std::path::PathBuf;
use thiserror::Error;

/// Failure kinds callers may want to tell apart. Everything else travels as
/// plain `anyhow` context.
#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error("cannot read config {path}: {reason}")]
    ConfigRead { path: PathBuf, reason: String },

    #[error("override proposal {path} is invalid: {reason}")]
    InvalidOverride { path: PathBuf, reason: String },

    #[error("invalid run policy: {0}")]
    InvalidPolicy(String),

    #[error("run {run_id} already exists at {path}")]
    RunCollision { run_id: String, path: PathBuf },

    #[error("trainer failed: {0}")]
    TrainerFailed(String),

    #[error("trainer did not produce a new log in {0}")]
    NoLogProduced(PathBuf),

    #[error("validation failed: {0}")]
    Validation(String),
}
