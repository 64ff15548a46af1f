//! Append-only run records. Each run owns one directory under the registry root.

use anyhow::{anyhow, Result};
use autopilot_core::{atomic_write_json_pretty, ensure_dir, timestamp};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{self, ConfigDoc};
use crate::error::AutopilotError;

pub const MANIFEST_FILE: &str = "run.json";
pub const CONFIG_FILE: &str = "config.json";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: String,
    pub dir: PathBuf,
}

impl RunHandle {
    fn at(dir: PathBuf) -> Self {
        let run_id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Self { run_id, dir }
    }

    pub fn manifest(&self) -> Result<Value> {
        let path = self.dir.join(MANIFEST_FILE);
        Ok(serde_json::from_slice(&fs::read(&path)?)?)
    }

    pub fn has_config(&self) -> bool {
        self.dir.join(CONFIG_FILE).exists()
    }

    /// A run is complete once its summary has been written.
    pub fn is_complete(&self) -> bool {
        self.dir.join(SUMMARY_FILE).exists()
    }

    pub fn load_config(&self) -> Result<ConfigDoc> {
        config::load(&self.dir.join(CONFIG_FILE))
    }
}

#[derive(Debug, Clone)]
pub struct RunRegistry {
    root: PathBuf,
}

impl RunRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the run directory exclusively and writes its manifest. The id is
    /// `metadata.run_id` when given, otherwise a UTC timestamp.
    pub fn register(&self, metadata: Map<String, Value>) -> Result<RunHandle> {
        let requested = metadata
            .get("run_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(default_run_id);
        let run_id = sanitize_run_id(&requested);
        if run_id.is_empty() {
            return Err(anyhow!("run id {:?} has no filesystem-safe characters", requested));
        }

        ensure_dir(&self.root)?;
        let dir = self.root.join(&run_id);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(AutopilotError::RunCollision { run_id, path: dir }.into());
            }
            Err(e) => return Err(e.into()),
        }

        let manifest = json!({
            "run_id": run_id,
            "created_at": timestamp(),
            "metadata": Value::Object(metadata),
        });
        atomic_write_json_pretty(&dir.join(MANIFEST_FILE), &manifest)?;
        Ok(RunHandle { run_id, dir })
    }

    /// All runs in lexicographic order, which is creation order for generated ids.
    pub fn list(&self) -> Result<Vec<RunHandle>> {
        ensure_dir(&self.root)?;
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs.into_iter().map(RunHandle::at).collect())
    }

    pub fn latest(&self) -> Result<Option<RunHandle>> {
        Ok(self.list()?.pop())
    }

    /// Config of the newest run that saved one; the diff baseline for the next iteration.
    pub fn most_recent_with_config(&self) -> Result<Option<ConfigDoc>> {
        for run in self.list()?.into_iter().rev() {
            if run.has_config() {
                return run.load_config().map(Some);
            }
        }
        Ok(None)
    }
}

fn default_run_id() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%6fZ").to_string()
}

pub fn sanitize_run_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
