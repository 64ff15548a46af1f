use anyhow::Result;
use autopilot_analysis::BehaviorReport;
use autopilot_core::{atomic_write_json_pretty, Metrics};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::config::{ConfigDoc, ResumeMode, SaveStrategy};
use crate::envdiff::EnvVerdict;
use crate::error::AutopilotError;
use crate::registry::SUMMARY_FILE;

/// Per-run record written once the trainer has finished. Its presence marks
/// the run as complete.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub timestamp: String,
    pub iteration: u32,
    pub mode: String,
    pub seed: Option<Value>,
    #[serde(flatten)]
    pub metrics: Metrics,
    pub resume_mode: ResumeMode,
    pub resume_from: Option<String>,
    pub load_model_path: Option<String>,
    pub save_strategy: SaveStrategy,
    pub config_diff: ConfigDoc,
    pub dropped_override_keys: Vec<String>,
    pub environment: EnvVerdict,
    pub analysis: BehaviorReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trainer_summary: Option<Value>,
    pub notes: String,
}

impl RunSummary {
    pub fn validate(&self) -> Result<()> {
        if self.run_id.trim().is_empty() {
            return Err(AutopilotError::Validation("summary run_id is empty".to_string()).into());
        }
        if self.timestamp.trim().is_empty() {
            return Err(AutopilotError::Validation("summary timestamp is empty".to_string()).into());
        }
        for name in Metrics::FIELDS {
            if let Some(v) = self.metrics.get(name) {
                if !v.is_finite() {
                    return Err(AutopilotError::Validation(format!(
                        "summary field '{}' is not a finite number ({})",
                        name, v
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn write(&self, run_dir: &Path) -> Result<PathBuf> {
        self.validate()?;
        let path = run_dir.join(SUMMARY_FILE);
        atomic_write_json_pretty(&path, &serde_json::to_value(self)?)?;
        Ok(path)
    }
}
