use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a sibling temp file and renames into place, so readers
/// never observe a half-written document.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Digest over the compact serialization. Object keys come out sorted, so two
/// documents with the same content hash identically regardless of input order.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

/// UTC timestamp used in manifests, summaries and the journal.
pub fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// One scalar snapshot per run. `None` means "unknown", which is distinct from zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub grip_success: Option<f64>,
    pub delivery_success: Option<f64>,
    pub end_to_end_success: Option<f64>,
    pub grip_attempts: Option<f64>,
    pub delivery_attempts: Option<f64>,
    pub hover_efficiency: Option<f64>,
    pub mean_reward: Option<f64>,
    pub episode_length: Option<f64>,
    pub collision_rate: Option<f64>,
    pub grip_conv_rate: Option<f64>,
    pub delivery_conv_rate: Option<f64>,
    pub grip_to_delivery_rate: Option<f64>,
}

impl Metrics {
    pub const FIELDS: [&'static str; 12] = [
        "grip_success",
        "delivery_success",
        "end_to_end_success",
        "grip_attempts",
        "delivery_attempts",
        "hover_efficiency",
        "mean_reward",
        "episode_length",
        "collision_rate",
        "grip_conv_rate",
        "delivery_conv_rate",
        "grip_to_delivery_rate",
    ];

    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "grip_success" => self.grip_success,
            "delivery_success" => self.delivery_success,
            "end_to_end_success" => self.end_to_end_success,
            "grip_attempts" => self.grip_attempts,
            "delivery_attempts" => self.delivery_attempts,
            "hover_efficiency" => self.hover_efficiency,
            "mean_reward" => self.mean_reward,
            "episode_length" => self.episode_length,
            "collision_rate" => self.collision_rate,
            "grip_conv_rate" => self.grip_conv_rate,
            "delivery_conv_rate" => self.delivery_conv_rate,
            "grip_to_delivery_rate" => self.grip_to_delivery_rate,
            _ => None,
        }
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Option<f64>> {
        let slot = match name {
            "grip_success" => &mut self.grip_success,
            "delivery_success" => &mut self.delivery_success,
            "end_to_end_success" => &mut self.end_to_end_success,
            "grip_attempts" => &mut self.grip_attempts,
            "delivery_attempts" => &mut self.delivery_attempts,
            "hover_efficiency" => &mut self.hover_efficiency,
            "mean_reward" => &mut self.mean_reward,
            "episode_length" => &mut self.episode_length,
            "collision_rate" => &mut self.collision_rate,
            "grip_conv_rate" => &mut self.grip_conv_rate,
            "delivery_conv_rate" => &mut self.delivery_conv_rate,
            "grip_to_delivery_rate" => &mut self.grip_to_delivery_rate,
            _ => return None,
        };
        Some(slot)
    }

    /// Sets a named field. Returns false for names this snapshot does not track.
    pub fn set(&mut self, name: &str, value: Option<f64>) -> bool {
        match self.slot_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Fills a named field only while it is still unknown.
    pub fn fill(&mut self, name: &str, value: f64) -> bool {
        match self.slot_mut(name) {
            Some(slot) if slot.is_none() => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Field-by-field overlay: every known value in `other` replaces ours.
    pub fn overlay(&mut self, other: &Metrics) {
        for name in Self::FIELDS {
            if let Some(v) = other.get(name) {
                self.set(name, Some(v));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        Self::FIELDS.iter().all(|name| self.get(name).is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).expect("a");
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert!(canonical_json_digest(&a).starts_with("sha256:"));
    }

    #[test]
    fn atomic_write_creates_parent_dirs() {
        let root = std::env::temp_dir().join(format!(
            "autopilot_core_write_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("nested").join("doc.json");
        atomic_write_json_pretty(&path, &json!({"k": 1})).expect("write");
        let back: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        assert_eq!(back, json!({"k": 1}));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fill_never_overwrites_known_value() {
        let mut m = Metrics::default();
        assert!(m.fill("mean_reward", 1.5));
        assert!(!m.fill("mean_reward", 9.0));
        assert_eq!(m.mean_reward, Some(1.5));
        assert!(!m.fill("not_a_metric", 1.0));
    }

    #[test]
    fn overlay_keeps_fields_missing_from_other() {
        let mut base = Metrics {
            grip_success: Some(0.2),
            mean_reward: Some(1.0),
            ..Metrics::default()
        };
        let top = Metrics {
            mean_reward: Some(2.0),
            ..Metrics::default()
        };
        base.overlay(&top);
        assert_eq!(base.grip_success, Some(0.2));
        assert_eq!(base.mean_reward, Some(2.0));
        assert!(!base.is_empty());
        assert!(Metrics::default().is_empty());
    }
}
