//! Launching the external trainer and finding the log it wrote.

use anyhow::{anyhow, Result};
use autopilot_core::{atomic_write_bytes, ensure_dir};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::SystemTime;
use tracing::info;

use crate::error::AutopilotError;
use crate::registry::RunHandle;
use crate::settings::ProjectLayout;

pub const ENV_SUMMARY: &str = "PUFFER_AUTOPILOT_SUMMARY";
pub const ENV_RUN_ID: &str = "PUFFER_AUTOPILOT_RUN_ID";
pub const ENV_RUN_DIR: &str = "PUFFER_AUTOPILOT_RUN_DIR";

pub const PROMPT_TOKEN: &str = "{prompt}";
pub const TRAINER_SUMMARY_FILE: &str = "trainer_summary.json";
pub const RUN_LOG_FILE: &str = "train.log";
pub const NOTES_FILE: &str = "notes.txt";

pub fn render_prompt(template: &str, script: &str, notes_path: &str) -> String {
    template
        .trim()
        .replace("{script}", script)
        .replace("{notes_path}", notes_path)
}

/// Substitutes the rendered prompt into the configured argv.
pub fn build_command(tokens: &[String], prompt: &str) -> Result<Vec<String>> {
    if tokens.is_empty() {
        return Err(anyhow!("trainer_command is empty"));
    }
    Ok(tokens
        .iter()
        .map(|t| t.replace(PROMPT_TOKEN, prompt))
        .collect())
}

pub type LogSnapshot = BTreeMap<PathBuf, SystemTime>;

pub fn snapshot_logs(logs_dir: &Path) -> Result<LogSnapshot> {
    ensure_dir(logs_dir)?;
    let mut snapshot = LogSnapshot::new();
    for entry in fs::read_dir(logs_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            snapshot.insert(path, modified);
        }
    }
    Ok(snapshot)
}

/// The newest log that appeared or was modified since `before`. Racy when
/// several trainers share `logs_dir`; one invocation at a time is assumed.
pub fn find_new_log(logs_dir: &Path, before: &LogSnapshot) -> Result<Option<PathBuf>> {
    let after = snapshot_logs(logs_dir)?;
    Ok(after
        .into_iter()
        .filter(|(path, modified)| before.get(path).map(|b| modified > b).unwrap_or(true))
        .max_by_key(|(_, modified)| *modified)
        .map(|(path, _)| path))
}

/// Spawns the trainer and blocks until it exits. Non-zero exit is a failure.
pub fn invoke(argv: &[String], cwd: &Path, run: &RunHandle) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("trainer argv is empty"))?;
    let summary_path = run.dir.join(TRAINER_SUMMARY_FILE);
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(cwd);
    cmd.env(ENV_SUMMARY, &summary_path);
    cmd.env(ENV_RUN_ID, &run.run_id);
    cmd.env(ENV_RUN_DIR, &run.dir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    info!(run_id = %run.run_id, program = %program, "invoking trainer");
    let status = cmd
        .status()
        .map_err(|e| AutopilotError::TrainerFailed(format!("cannot spawn {}: {}", program, e)))?;
    if !status.success() {
        let reason = status
            .code()
            .map(|c| format!("exit status {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        return Err(AutopilotError::TrainerFailed(reason).into());
    }
    Ok(())
}

/// Renders the prompt, runs the trainer, and snapshots its new log into the
/// run directory. Returns the run-local log path.
pub fn run_training(layout: &ProjectLayout, script: &Path, run: &RunHandle) -> Result<PathBuf> {
    let before = snapshot_logs(&layout.logs_dir)?;

    let template = fs::read_to_string(&layout.prompt_template).map_err(|e| {
        AutopilotError::ConfigRead {
            path: layout.prompt_template.clone(),
            reason: e.to_string(),
        }
    })?;
    let notes_file = run.dir.join(NOTES_FILE);
    let prompt = render_prompt(
        &template,
        &layout.display_path(script),
        &layout.display_path(&notes_file),
    );
    let argv = build_command(&layout.trainer_command, &prompt)?;
    invoke(&argv, &layout.repo_root, run)?;

    let latest = find_new_log(&layout.logs_dir, &before)?
        .ok_or_else(|| AutopilotError::NoLogProduced(layout.logs_dir.clone()))?;
    let log_path = run.dir.join(RUN_LOG_FILE);
    fs::copy(&latest, &log_path)?;
    info!(run_id = %run.run_id, source = %latest.display(), "captured trainer log");

    if !notes_file.exists() {
        atomic_write_bytes(&notes_file, b"Notes: pending entry\n")?;
    }
    Ok(log_path)
}
