//! Config templates, the restricted override policy and per-run persistence.

use anyhow::Result;
use autopilot_core::{atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AutopilotError;

/// The only top-level section an override may touch.
pub const POLICY_KEY: &str = "autopilot";
pub const LOAD_MODEL_KEY: &str = "load_model_path";

pub type ConfigDoc = Map<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    #[default]
    Fresh,
    Continue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStrategy {
    All,
    #[default]
    Best,
    Latest,
}

impl SaveStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveStrategy::All => "all",
            SaveStrategy::Best => "best",
            SaveStrategy::Latest => "latest",
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Typed view of the run-policy section. Unknown keys ride along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPolicy {
    #[serde(default, deserialize_with = "null_as_default")]
    pub resume_mode: ResumeMode,
    #[serde(default)]
    pub resume_from: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub save_strategy: SaveStrategy,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunPolicy {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        match doc.get(POLICY_KEY) {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(section @ Value::Object(_)) => serde_json::from_value(section.clone())
                .map_err(|e| anyhow::Error::from(AutopilotError::InvalidPolicy(e.to_string()))),
            Some(other) => Err(AutopilotError::InvalidPolicy(format!(
                "{} section must be an object, found {}",
                POLICY_KEY,
                value_type_name(other)
            ))
            .into()),
        }
    }
}

/// Effective configuration: the verbatim document plus a typed read of the
/// fields the orchestrator owns.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    doc: ConfigDoc,
    pub policy: RunPolicy,
}

impl EffectiveConfig {
    pub fn new(doc: ConfigDoc) -> Result<Self> {
        let policy = RunPolicy::from_doc(&doc)?;
        Ok(Self { doc, policy })
    }

    pub fn doc(&self) -> &ConfigDoc {
        &self.doc
    }

    pub fn into_doc(self) -> ConfigDoc {
        self.doc
    }

    pub fn load_model_path(&self) -> Option<&str> {
        self.doc.get(LOAD_MODEL_KEY).and_then(|v| v.as_str())
    }

    pub fn inject_load_model_path(&mut self, path: &str) {
        self.doc
            .insert(LOAD_MODEL_KEY.to_string(), Value::String(path.to_string()));
    }

    pub fn seed(&self) -> Option<Value> {
        self.doc
            .get("train")
            .and_then(|t| t.get("seed"))
            .cloned()
    }
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let read_err = |reason: String| AutopilotError::ConfigRead {
        path: path.to_path_buf(),
        reason,
    };
    let raw = fs::read_to_string(path).map_err(|e| read_err(e.to_string()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let value: Value = if is_yaml {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&raw).map_err(|e| read_err(e.to_string()))?;
        serde_json::to_value(yaml).map_err(|e| read_err(e.to_string()))?
    } else {
        serde_json::from_str(&raw).map_err(|e| read_err(e.to_string()))?
    };
    match value {
        Value::Object(map) => Ok(map),
        other => Err(read_err(format!(
            "root must be an object, found {}",
            value_type_name(&other)
        ))
        .into()),
    }
}

/// Replaces the run-policy subtree with the override's and drops every other
/// key. Returns the merged document and the dropped keys for the journal.
pub fn apply_override(base: &ConfigDoc, proposal: &ConfigDoc) -> (ConfigDoc, Vec<String>) {
    let mut merged = base.clone();
    let mut dropped = Vec::new();
    for (key, value) in proposal {
        if key == POLICY_KEY && value.is_object() {
            merged.insert(key.clone(), value.clone());
        } else {
            dropped.push(key.clone());
        }
    }
    (merged, dropped)
}

/// Writes `config.json` verbatim plus its canonical digest.
pub fn save(run_dir: &Path, doc: &ConfigDoc) -> Result<PathBuf> {
    let value = Value::Object(doc.clone());
    let path = run_dir.join("config.json");
    atomic_write_json_pretty(&path, &value)?;
    atomic_write_bytes(
        &run_dir.join("config.digest"),
        canonical_json_digest(&value).as_bytes(),
    )?;
    Ok(path)
}

/// Staging file where the previous iteration (or a human) proposes the next
/// run policy. `read` then `clear` brackets one consumption.
#[derive(Debug, Clone)]
pub struct OverrideInbox {
    path: PathBuf,
}

impl OverrideInbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the staging file as `{}` when absent.
    pub fn ensure(&self) -> Result<()> {
        if !self.path.exists() {
            self.clear()?;
        }
        Ok(())
    }

    pub fn read(&self) -> Result<ConfigDoc> {
        if !self.path.exists() {
            return Ok(ConfigDoc::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(ConfigDoc::new());
        }
        let invalid = |reason: String| AutopilotError::InvalidOverride {
            path: self.path.clone(),
            reason,
        };
        match serde_json::from_str::<Value>(&raw).map_err(|e| invalid(e.to_string()))? {
            Value::Object(map) => Ok(map),
            other => Err(invalid(format!(
                "must contain a JSON object, found {}",
                value_type_name(&other)
            ))
            .into()),
        }
    }

    pub fn clear(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        atomic_write_bytes(&self.path, b"{}\n")
    }
}

/// Leaf-level diff keyed by JSON pointer: `{"/train/lr": {"before": .., "after": ..}}`.
pub fn diff_configs(previous: &ConfigDoc, next: &ConfigDoc) -> ConfigDoc {
    let mut before = Map::new();
    let mut after = Map::new();
    for (k, v) in previous {
        flatten_into(&pointer_segment("", k), v, &mut before);
    }
    for (k, v) in next {
        flatten_into(&pointer_segment("", k), v, &mut after);
    }
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    let mut diff = Map::new();
    for key in keys {
        let b = before.get(key);
        let a = after.get(key);
        if b != a {
            diff.insert(
                key.clone(),
                json!({
                    "before": b.cloned().unwrap_or(Value::Null),
                    "after": a.cloned().unwrap_or(Value::Null),
                }),
            );
        }
    }
    diff
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                flatten_into(&pointer_segment(prefix, k), v, out);
            }
        }
        _ => {
            out.insert(prefix.to_string(), value.clone());
        }
    }
}

fn pointer_segment(prefix: &str, key: &str) -> String {
    format!("{}/{}", prefix, key.replace('~', "~0").replace('/', "~1"))
}

/// Renders a config document as trainer CLI flags: `--train.learning-rate 0.01`.
/// `true` becomes a bare flag, `false` is omitted.
pub fn render_cli_args(doc: &ConfigDoc) -> Vec<String> {
    let mut argv = Vec::new();
    for (key, value) in doc {
        emit_args(&hyphenate(key), value, &mut argv);
    }
    argv
}

fn hyphenate(key: &str) -> String {
    key.replace('_', "-")
}

fn emit_args(prefix: &str, value: &Value, argv: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                emit_args(&format!("{}.{}", prefix, hyphenate(k)), v, argv);
            }
        }
        Value::Bool(true) => argv.push(format!("--{}", prefix)),
        Value::Bool(false) => {}
        Value::String(s) => {
            argv.push(format!("--{}", prefix));
            argv.push(s.clone());
        }
        other => {
            argv.push(format!("--{}", prefix));
            argv.push(other.to_string());
        }
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
