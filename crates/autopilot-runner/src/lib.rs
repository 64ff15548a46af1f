//! Iteration loop around an external trainer: config resolution, run
//! bookkeeping, metric harvesting and best-checkpoint promotion.

pub mod checkpoint;
pub mod config;
pub mod envdiff;
pub mod error;
pub mod journal;
pub mod metrics;
pub mod registry;
pub mod resume;
pub mod settings;
pub mod summary;
pub mod trainer;

use anyhow::Result;
use autopilot_analysis::{analyze, BehaviorReport};
use autopilot_core::{atomic_write_bytes, atomic_write_json_pretty, timestamp, Metrics};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub use checkpoint::{BestRecord, CandidateScores, ProjectState};
pub use config::{ConfigDoc, EffectiveConfig, OverrideInbox, ResumeMode, RunPolicy, SaveStrategy};
pub use error::AutopilotError;
pub use journal::Journal;
pub use registry::{RunHandle, RunRegistry};
pub use settings::{ProjectLayout, ProjectSettings, RunMode};

pub const OVERRIDE_RECORD_FILE: &str = "override.json";
pub const CONFIG_DIFF_FILE: &str = "config_diff.json";
pub const MODEL_PATH_FILE: &str = "model_path.txt";

#[derive(Debug, Clone)]
pub struct IterationResult {
    pub run: RunHandle,
    pub config: ConfigDoc,
    pub metrics: Metrics,
    pub analysis: BehaviorReport,
    pub checkpoint: Option<PathBuf>,
    pub promoted: bool,
}

pub struct Orchestrator {
    layout: ProjectLayout,
    registry: RunRegistry,
    state: ProjectState,
    inbox: OverrideInbox,
    journal: Journal,
}

impl Orchestrator {
    pub fn open(root: &Path) -> Result<Self> {
        Ok(Self::new(ProjectLayout::open(root)?))
    }

    pub fn new(layout: ProjectLayout) -> Self {
        Self {
            registry: RunRegistry::new(layout.runs_dir.clone()),
            state: ProjectState::from_layout(&layout),
            inbox: OverrideInbox::new(layout.override_proposal.clone()),
            journal: Journal::new(layout.labbook_path()),
            layout,
        }
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    /// Runs `runs` iterations back to back. The first failure stops the session.
    pub fn run_session(&self, runs: u32, mode: RunMode) -> Result<Vec<IterationResult>> {
        self.inbox.ensure()?;
        let mut parent_run = self.registry.latest()?.map(|r| r.run_id);
        let mut prev_config = self.registry.most_recent_with_config()?;

        let mut results = Vec::new();
        for iteration in 1..=runs {
            let result = self.run_iteration(
                iteration,
                mode,
                prev_config.as_ref(),
                parent_run.as_deref(),
            )?;
            prev_config = Some(result.config.clone());
            parent_run = Some(result.run.run_id.clone());
            results.push(result);
        }
        Ok(results)
    }

    pub fn run_iteration(
        &self,
        iteration: u32,
        mode: RunMode,
        prev_config: Option<&ConfigDoc>,
        parent_run: Option<&str>,
    ) -> Result<IterationResult> {
        let template = self.layout.template_for(mode);
        let base = config::load(template)?;
        let proposal = self.inbox.read()?;
        let (merged, dropped) = config::apply_override(&base, &proposal);
        let mut effective = EffectiveConfig::new(merged)?;

        let mut metadata = Map::new();
        metadata.insert("mode".to_string(), json!(mode.as_str()));
        metadata.insert(
            "config_template".to_string(),
            json!(self.layout.display_path(template)),
        );
        metadata.insert("iteration".to_string(), json!(iteration));
        if let Some(parent) = parent_run {
            metadata.insert("parent_run".to_string(), json!(parent));
        }
        let run = self.registry.register(metadata)?;
        info!(run_id = %run.run_id, iteration, mode = mode.as_str(), "registered run");

        if !dropped.is_empty() {
            warn!(run_id = %run.run_id, keys = ?dropped, "override touched locked sections");
            self.journal.append(
                "override policy violation",
                &format!("{}: dropped keys {}", run.run_id, dropped.join(", ")),
                "ignored; only the autopilot section may be overridden",
                "",
            )?;
        }

        let previous_diff = self.previous_env_diff(&run)?;
        let snapshot = envdiff::capture(&self.layout.repo_root, &self.layout.mutable_source);
        snapshot.save(&run.dir)?;
        let environment = envdiff::compare(previous_diff.as_deref(), &snapshot.diff);

        if let Some(path) = resume::resolve_resume_path(&effective.policy, &self.state) {
            info!(run_id = %run.run_id, load_model_path = %path, "resuming from checkpoint");
            effective.inject_load_model_path(&path);
        }

        let empty = ConfigDoc::new();
        let config_diff = config::diff_configs(prev_config.unwrap_or(&empty), effective.doc());
        config::save(&run.dir, effective.doc())?;
        if !proposal.is_empty() {
            atomic_write_json_pretty(
                &run.dir.join(OVERRIDE_RECORD_FILE),
                &Value::Object(proposal.clone()),
            )?;
        }
        if !config_diff.is_empty() {
            atomic_write_json_pretty(
                &run.dir.join(CONFIG_DIFF_FILE),
                &Value::Object(config_diff.clone()),
            )?;
        }
        self.inbox.clear()?;

        let script = self.layout.script_for(mode);
        let log_path = trainer::run_training(&self.layout, script, &run)
            .or_else(|e| self.fail(&run, e))?;

        let trainer_summary =
            metrics::load_trainer_summary(&run.dir.join(trainer::TRAINER_SUMMARY_FILE));
        let log_metrics = metrics::extract(&log_path);
        let merged_metrics = metrics::merge(&log_metrics, trainer_summary.as_ref());
        let analysis = analyze(&merged_metrics);

        let summary = summary::RunSummary {
            run_id: run.run_id.clone(),
            timestamp: timestamp(),
            iteration,
            mode: mode.as_str().to_string(),
            seed: effective.seed(),
            metrics: merged_metrics.clone(),
            resume_mode: effective.policy.resume_mode,
            resume_from: effective.policy.resume_from.clone(),
            load_model_path: effective.load_model_path().map(|s| s.to_string()),
            save_strategy: effective.policy.save_strategy,
            config_diff,
            dropped_override_keys: dropped,
            environment: environment.clone(),
            analysis: analysis.clone(),
            trainer_summary,
            notes: "auto-generated run summary".to_string(),
        };
        summary.write(&run.dir).or_else(|e| self.fail(&run, e))?;

        let (checkpoint, promoted) = self
            .track_checkpoint(&run, effective.policy.save_strategy, &merged_metrics)
            .or_else(|e| self.fail(&run, e))?;

        let scores = CandidateScores::from_metrics(&merged_metrics);
        self.journal.append(
            "run complete",
            &format!(
                "Run {} (iteration {}): primary={} mean_reward={}; {}",
                run.run_id,
                iteration,
                fmt_score(scores.primary()),
                fmt_score(scores.mean_reward),
                environment.describe()
            ),
            &format!(
                "metrics captured; analysis {}{}",
                analysis.severity.as_str(),
                if promoted { "; promoted to best" } else { "" }
            ),
            analysis
                .insights
                .first()
                .map(|i| i.message.as_str())
                .unwrap_or(""),
        )?;
        info!(
            run_id = %run.run_id,
            iteration,
            promoted,
            severity = analysis.severity.as_str(),
            "iteration complete"
        );

        Ok(IterationResult {
            run,
            config: effective.into_doc(),
            metrics: merged_metrics,
            analysis,
            checkpoint,
            promoted,
        })
    }

    /// Newest earlier run that captured an environment diff.
    fn previous_env_diff(&self, current: &RunHandle) -> Result<Option<String>> {
        for run in self.registry.list()?.into_iter().rev() {
            if run.run_id == current.run_id {
                continue;
            }
            if let Some(diff) = envdiff::load_diff(&run.dir) {
                return Ok(Some(diff));
            }
        }
        Ok(None)
    }

    fn track_checkpoint(
        &self,
        run: &RunHandle,
        strategy: SaveStrategy,
        metrics: &Metrics,
    ) -> Result<(Option<PathBuf>, bool)> {
        let Some(checkpoint) = self.state.latest_checkpoint() else {
            info!(run_id = %run.run_id, "no checkpoint found after training");
            return Ok((None, false));
        };
        atomic_write_bytes(
            &run.dir.join(MODEL_PATH_FILE),
            checkpoint.to_string_lossy().as_bytes(),
        )?;
        self.state.repoint_latest(&checkpoint)?;
        let promoted = self.state.consider_promotion(
            strategy,
            &run.run_id,
            &CandidateScores::from_metrics(metrics),
            &checkpoint,
        )?;
        Ok((Some(checkpoint), promoted))
    }

    /// Journals an iteration failure and hands the error back to the caller.
    fn fail<T>(&self, run: &RunHandle, err: anyhow::Error) -> Result<T> {
        warn!(run_id = %run.run_id, error = %err, "iteration failed");
        if let Err(journal_err) =
            self.journal
                .append("run failed", &format!("{}: {}", run.run_id, err), "halt", "")
        {
            warn!(error = %journal_err, "could not journal failure");
        }
        Err(err)
    }
}

fn fmt_score(score: Option<f64>) -> String {
    score
        .map(|v| format!("{:.4}", v))
        .unwrap_or_else(|| "n/a".to_string())
}
