use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::AutopilotError;

pub const SETTINGS_FILE: &str = "autopilot.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Quick,
    Full,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Quick => "quick",
            RunMode::Full => "full",
        }
    }
}

/// On-disk project settings. Every field has a default so a project without
/// `autopilot.yaml` still resolves to the conventional layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub baseline_config: PathBuf,
    pub quick_config: PathBuf,
    pub full_script: PathBuf,
    pub quick_script: PathBuf,
    pub prompt_template: PathBuf,
    pub override_proposal: PathBuf,
    pub logs_dir: PathBuf,
    pub models_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub journal_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_extension: String,
    pub repo_root: PathBuf,
    pub mutable_source: String,
    /// Trainer argv. The token `{prompt}` is replaced by the rendered prompt.
    pub trainer_command: Vec<String>,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            baseline_config: PathBuf::from("configs/baseline_full.json"),
            quick_config: PathBuf::from("configs/baseline_quick.json"),
            full_script: PathBuf::from("scripts/run_training.sh"),
            quick_script: PathBuf::from("scripts/run_training.sh"),
            prompt_template: PathBuf::from("prompts/codex_prompt.txt"),
            override_proposal: PathBuf::from("proposals/next_config.json"),
            logs_dir: PathBuf::from("logs"),
            models_dir: PathBuf::from("models"),
            runs_dir: PathBuf::from("runs"),
            journal_dir: PathBuf::from("journal"),
            checkpoint_dir: PathBuf::from("../PufferLib/experiments"),
            checkpoint_extension: "pt".to_string(),
            repo_root: PathBuf::from(".."),
            mutable_source: "PufferLib/pufferlib/ocean/drone_pickplace".to_string(),
            trainer_command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "{prompt}".to_string(),
                "--dangerously-bypass-approvals-and-sandbox".to_string(),
            ],
        }
    }
}

impl ProjectSettings {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|e| {
            anyhow::Error::from(AutopilotError::ConfigRead {
                path: path.clone(),
                reason: e.to_string(),
            })
        })
    }
}

/// Settings with every path resolved against the project root.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub baseline_config: PathBuf,
    pub quick_config: PathBuf,
    pub full_script: PathBuf,
    pub quick_script: PathBuf,
    pub prompt_template: PathBuf,
    pub override_proposal: PathBuf,
    pub logs_dir: PathBuf,
    pub models_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub journal_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_extension: String,
    pub repo_root: PathBuf,
    pub mutable_source: String,
    pub trainer_command: Vec<String>,
}

impl ProjectLayout {
    /// Loads settings and resolves them against the absolute project root, so
    /// checkpoint paths and links stay valid from any working directory.
    pub fn open(root: &Path) -> Result<Self> {
        let root = absolute_root(root)?;
        let settings = ProjectSettings::load(&root)?;
        Ok(Self::from_settings(&root, settings))
    }

    pub fn from_settings(root: &Path, s: ProjectSettings) -> Self {
        let at = |p: &Path| {
            let joined = if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            };
            if joined.is_absolute() {
                normalize_path(&joined)
            } else {
                joined
            }
        };
        Self {
            root: root.to_path_buf(),
            baseline_config: at(&s.baseline_config),
            quick_config: at(&s.quick_config),
            full_script: at(&s.full_script),
            quick_script: at(&s.quick_script),
            prompt_template: at(&s.prompt_template),
            override_proposal: at(&s.override_proposal),
            logs_dir: at(&s.logs_dir),
            models_dir: at(&s.models_dir),
            runs_dir: at(&s.runs_dir),
            journal_dir: at(&s.journal_dir),
            checkpoint_dir: at(&s.checkpoint_dir),
            checkpoint_extension: s.checkpoint_extension,
            repo_root: at(&s.repo_root),
            mutable_source: s.mutable_source,
            trainer_command: s.trainer_command,
        }
    }

    pub fn template_for(&self, mode: RunMode) -> &Path {
        match mode {
            RunMode::Quick => &self.quick_config,
            RunMode::Full => &self.baseline_config,
        }
    }

    pub fn script_for(&self, mode: RunMode) -> &Path {
        match mode {
            RunMode::Quick => &self.quick_script,
            RunMode::Full => &self.full_script,
        }
    }

    pub fn best_record_path(&self) -> PathBuf {
        self.runs_dir.join("best.json")
    }

    pub fn labbook_path(&self) -> PathBuf {
        self.journal_dir.join("labbook.md")
    }

    /// Path shown to the trainer: relative to the project root when possible.
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }
}

fn absolute_root(root: &Path) -> Result<PathBuf> {
    match root.canonicalize() {
        Ok(path) => Ok(path),
        Err(_) => Ok(normalize_path(&std::env::current_dir()?.join(root))),
    }
}

/// Lexically drops `.` and folds `..` components. Only meaningful for absolute paths.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
