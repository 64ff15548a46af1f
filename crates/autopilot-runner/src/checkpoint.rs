//! Project-wide checkpoint state: the best record and the `latest`/`best`
//! named links. Nothing outside `ProjectState` reads or writes these paths.

use anyhow::Result;
use autopilot_core::{atomic_write_json_pretty, ensure_dir, timestamp, Metrics};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::SaveStrategy;
use crate::settings::ProjectLayout;

/// Scores closer than this are treated as equal.
pub const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BestScore {
    pub score: Option<f64>,
    pub secondary: Option<f64>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestRecord {
    pub run_id: String,
    pub model_path: String,
    pub primary_score: Option<f64>,
    pub end_to_end_success: Option<f64>,
    pub delivery_success: Option<f64>,
    pub grip_success: Option<f64>,
    pub mean_reward: Option<f64>,
    pub timestamp: String,
}

/// The scores a finished run competes with.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CandidateScores {
    pub end_to_end: Option<f64>,
    pub delivery: Option<f64>,
    pub grip: Option<f64>,
    pub mean_reward: Option<f64>,
}

impl CandidateScores {
    pub fn from_metrics(m: &Metrics) -> Self {
        Self {
            end_to_end: m.end_to_end_success,
            delivery: m.delivery_success,
            grip: m.grip_success,
            mean_reward: m.mean_reward,
        }
    }

    /// Later funnel stages are the more informative signal, so they win.
    pub fn primary(&self) -> Option<f64> {
        self.end_to_end
            .or(self.delivery)
            .or(self.grip)
            .or(self.mean_reward)
    }

    pub fn secondary(&self) -> Option<f64> {
        self.mean_reward
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Symlink,
    Copy,
}

pub fn should_promote(
    strategy: SaveStrategy,
    best: &BestScore,
    primary: Option<f64>,
    secondary: Option<f64>,
) -> bool {
    if strategy == SaveStrategy::Latest {
        return true;
    }
    match (best.score, primary) {
        (None, Some(_)) => true,
        (Some(b), Some(p)) => {
            if p > b + SCORE_EPSILON {
                true
            } else if (p - b).abs() <= SCORE_EPSILON {
                matches!((secondary, best.secondary), (Some(s), Some(bs)) if s > bs)
            } else {
                false
            }
        }
        (None, None) => best.secondary.is_none() && secondary.is_some(),
        (Some(_), None) => false,
    }
}

#[derive(Debug, Clone)]
pub struct ProjectState {
    checkpoint_dir: PathBuf,
    extension: String,
    models_dir: PathBuf,
    best_record: PathBuf,
}

impl ProjectState {
    pub fn new(
        checkpoint_dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        models_dir: impl Into<PathBuf>,
        best_record: impl Into<PathBuf>,
    ) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            extension: extension.into(),
            models_dir: models_dir.into(),
            best_record: best_record.into(),
        }
    }

    pub fn from_layout(layout: &ProjectLayout) -> Self {
        Self::new(
            layout.checkpoint_dir.clone(),
            layout.checkpoint_extension.clone(),
            layout.models_dir.clone(),
            layout.best_record_path(),
        )
    }

    pub fn latest_link(&self) -> PathBuf {
        self.models_dir.join(format!("latest.{}", self.extension))
    }

    pub fn best_link(&self) -> PathBuf {
        self.models_dir.join(format!("best.{}", self.extension))
    }

    /// Newest checkpoint file by modification time, if any.
    pub fn latest_checkpoint(&self) -> Option<PathBuf> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        let walker = walkdir::WalkDir::new(&self.checkpoint_dir)
            .min_depth(1)
            .max_depth(1);
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str())
            {
                continue;
            }
            let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                continue;
            };
            if newest.as_ref().map(|(t, _)| modified >= *t).unwrap_or(true) {
                newest = Some((modified, path.to_path_buf()));
            }
        }
        newest.map(|(_, path)| path)
    }

    pub fn read_best_record(&self) -> Option<BestRecord> {
        let bytes = fs::read(&self.best_record).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Tolerates a missing or malformed record by reporting nothing.
    pub fn read_best(&self) -> BestScore {
        let Ok(bytes) = fs::read(&self.best_record) else {
            return BestScore::default();
        };
        let Ok(Value::Object(data)) = serde_json::from_slice::<Value>(&bytes) else {
            return BestScore::default();
        };
        let number = |key: &str| data.get(key).and_then(|v| v.as_f64());
        BestScore {
            score: number("primary_score")
                .or_else(|| number("end_to_end_success"))
                .or_else(|| number("success_rate")),
            secondary: number("mean_reward"),
            path: data
                .get("model_path")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        }
    }

    pub fn repoint_latest(&self, target: &Path) -> Result<LinkKind> {
        repoint(&self.latest_link(), target)
    }

    /// Applies the promotion policy and, on promotion, rewrites the best
    /// record and repoints the `best` link. Returns whether it promoted.
    pub fn consider_promotion(
        &self,
        strategy: SaveStrategy,
        run_id: &str,
        scores: &CandidateScores,
        candidate: &Path,
    ) -> Result<bool> {
        let best = self.read_best();
        let primary = scores.primary();
        if !should_promote(strategy, &best, primary, scores.secondary()) {
            debug!(
                run_id,
                candidate = ?primary,
                best = ?best.score,
                "checkpoint not promoted"
            );
            return Ok(false);
        }
        let record = BestRecord {
            run_id: run_id.to_string(),
            model_path: candidate.to_string_lossy().to_string(),
            primary_score: primary,
            end_to_end_success: scores.end_to_end,
            delivery_success: scores.delivery,
            grip_success: scores.grip,
            mean_reward: scores.mean_reward,
            timestamp: timestamp(),
        };
        atomic_write_json_pretty(&self.best_record, &serde_json::to_value(&record)?)?;
        let kind = repoint(&self.best_link(), candidate)?;
        info!(
            run_id,
            score = ?primary,
            previous = ?best.score,
            link = ?kind,
            "promoted checkpoint to best"
        );
        Ok(true)
    }
}

/// Unlink then relink. Falls back to a full copy where symlinks are refused.
/// Relative targets are absolutized first: a symlink target resolves against
/// the link's own directory, not the working directory.
fn repoint(link: &Path, target: &Path) -> Result<LinkKind> {
    if let Some(parent) = link.parent() {
        ensure_dir(parent)?;
    }
    let target = if target.is_absolute() {
        target.to_path_buf()
    } else {
        std::env::current_dir()?.join(target)
    };
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    #[cfg(unix)]
    {
        match symlink(&target, link) {
            Ok(()) => return Ok(LinkKind::Symlink),
            Err(e) => warn!(
                link = %link.display(),
                error = %e,
                "symlink refused, copying checkpoint instead"
            ),
        }
    }
    copy_into(link, &target)
}

/// Replaces whatever sits at `link` with a plain copy of `target`.
fn copy_into(link: &Path, target: &Path) -> Result<LinkKind> {
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    fs::copy(target, link)?;
    Ok(LinkKind::Copy)
}
