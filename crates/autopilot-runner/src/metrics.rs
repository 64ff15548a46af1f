//! Recovers scalar metrics from the trainer's free-form log and optional
//! structured summary.

use autopilot_core::Metrics;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// External metric name -> snapshot field.
const LOG_FIELDS: [(&str, &str); 9] = [
    ("environment/perfect_grip", "grip_success"),
    ("environment/perfect_deliv", "delivery_success"),
    ("environment/perfect_now", "end_to_end_success"),
    ("environment/to_pickup", "grip_attempts"),
    ("environment/to_drop", "delivery_attempts"),
    ("environment/ho_pickup", "hover_efficiency"),
    ("environment/score", "mean_reward"),
    ("environment/episode_length", "episode_length"),
    ("environment/collision_rate", "collision_rate"),
];

/// Once these are known the scan stops; older lines cannot improve on them.
const ESSENTIAL: [&str; 4] = [
    "grip_success",
    "delivery_success",
    "mean_reward",
    "episode_length",
];

/// Short names the trainer may use in its own summary file.
const SUMMARY_ALIASES: [(&str, &str); 3] = [
    ("perfect_grip", "grip_success"),
    ("perfect_deliv", "delivery_success"),
    ("perfect_now", "end_to_end_success"),
];

/// Never fails: a missing or unreadable log yields an all-unknown snapshot.
pub fn extract(log_path: &Path) -> Metrics {
    let mut metrics = Metrics::default();
    let bytes = match fs::read(log_path) {
        Ok(bytes) => bytes,
        Err(_) => return metrics,
    };
    let text = String::from_utf8_lossy(&bytes);
    for line in text.lines().rev() {
        let line = line.trim();
        if !(line.starts_with('{') && line.ends_with('}')) {
            continue;
        }
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        for (external, field) in LOG_FIELDS {
            if let Some(v) = data.get(external).and_then(|v| v.as_f64()) {
                metrics.fill(field, v);
            }
        }
        if ESSENTIAL.iter().all(|name| metrics.get(name).is_some()) {
            break;
        }
    }
    derive_ratios(&mut metrics);
    metrics
}

/// `None` unless the numerator is known, the denominator is strictly positive
/// and the quotient is finite.
pub fn safe_ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d > 0.0 => Some(n / d).filter(|r| r.is_finite()),
        _ => None,
    }
}

/// Recomputes the derived ratios. A ratio that cannot be computed keeps
/// whatever value was already present.
pub fn derive_ratios(m: &mut Metrics) {
    if let Some(r) = safe_ratio(m.grip_success, m.grip_attempts) {
        m.grip_conv_rate = Some(r);
    }
    if let Some(r) = safe_ratio(m.delivery_success, m.delivery_attempts) {
        m.delivery_conv_rate = Some(r);
    }
    if let Some(r) = safe_ratio(m.delivery_success, m.grip_success) {
        m.grip_to_delivery_rate = Some(r);
    }
}

/// Reads the trainer-written summary. Missing or malformed files count as absent.
pub fn load_trainer_summary(path: &Path) -> Option<Value> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Known numeric fields of `summary.metrics`; nulls and non-numbers are skipped.
pub fn summary_metrics(summary: &Value) -> Metrics {
    let mut metrics = Metrics::default();
    let Some(section) = summary.get("metrics").and_then(|m| m.as_object()) else {
        return metrics;
    };
    for name in Metrics::FIELDS {
        if let Some(v) = section.get(name).and_then(|v| v.as_f64()) {
            metrics.set(name, Some(v));
        }
    }
    for (alias, name) in SUMMARY_ALIASES {
        if let Some(v) = section.get(alias).and_then(|v| v.as_f64()) {
            metrics.fill(name, v);
        }
    }
    metrics
}

/// Log scan overlaid by the structured summary, field by field.
pub fn merge(log: &Metrics, summary: Option<&Value>) -> Metrics {
    let mut merged = log.clone();
    if let Some(summary) = summary {
        merged.overlay(&summary_metrics(summary));
        derive_ratios(&mut merged);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_core::ensure_dir;
    use chrono::Utc;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_log(tag: &str, contents: &[u8]) -> (PathBuf, PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "autopilot_metrics_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("root");
        let path = root.join("train.log");
        fs::write(&path, contents).expect("write log");
        (root, path)
    }

    #[test]
    fn missing_log_is_all_unknown() {
        let m = extract(Path::new("/definitely/not/here/train.log"));
        assert!(m.is_empty());
    }

    #[test]
    fn empty_log_is_all_unknown() {
        let (root, path) = temp_log("empty", b"");
        assert_eq!(extract(&path), Metrics::default());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn last_line_fills_only_its_fields() {
        let (root, path) = temp_log(
            "last",
            b"starting\n{\"environment/perfect_grip\": 0.42, \"environment/score\": 1.5}\n",
        );
        let m = extract(&path);
        assert_eq!(m.grip_success, Some(0.42));
        assert_eq!(m.mean_reward, Some(1.5));
        let expected = Metrics {
            grip_success: Some(0.42),
            mean_reward: Some(1.5),
            ..Metrics::default()
        };
        assert_eq!(m, expected);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn newest_value_wins_and_older_lines_fill_gaps() {
        let log = concat!(
            "{\"environment/perfect_grip\": 0.1, \"environment/collision_rate\": 0.3}\n",
            "not json {\n",
            "{\"environment/perfect_grip\": 0.2, \"environment/to_pickup\": 0.5}\n",
            "{broken json}\n",
            "{\"environment/perfect_grip\": 0.4}\n",
        );
        let (root, path) = temp_log("order", log.as_bytes());
        let m = extract(&path);
        assert_eq!(m.grip_success, Some(0.4));
        assert_eq!(m.grip_attempts, Some(0.5));
        assert_eq!(m.collision_rate, Some(0.3));
        assert_eq!(m.grip_conv_rate, Some(0.8));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scan_stops_once_essentials_are_known() {
        let log = concat!(
            "{\"environment/collision_rate\": 0.9}\n",
            "{\"environment/perfect_grip\": 0.5, \"environment/perfect_deliv\": 0.2, ",
            "\"environment/score\": 2.0, \"environment/episode_length\": 300}\n",
        );
        let (root, path) = temp_log("early", log.as_bytes());
        let m = extract(&path);
        assert_eq!(m.episode_length, Some(300.0));
        assert_eq!(m.collision_rate, None);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn invalid_utf8_is_tolerated() {
        let mut bytes = b"{\"environment/score\": 3.0}\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b'\n']);
        let (root, path) = temp_log("utf8", &bytes);
        let m = extract(&path);
        assert_eq!(m.mean_reward, Some(3.0));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn ratio_with_zero_denominator_is_unknown() {
        let mut m = Metrics {
            grip_success: Some(0.3),
            grip_attempts: Some(0.0),
            ..Metrics::default()
        };
        derive_ratios(&mut m);
        assert_eq!(m.grip_conv_rate, None);
        assert_eq!(safe_ratio(None, Some(2.0)), None);
        assert_eq!(safe_ratio(Some(1.0), None), None);
        assert_eq!(safe_ratio(Some(1.0), Some(-1.0)), None);
        assert_eq!(safe_ratio(Some(1.0), Some(4.0)), Some(0.25));
        assert_eq!(safe_ratio(Some(1e308), Some(1e-10)), None);
        assert_eq!(safe_ratio(Some(f64::NAN), Some(1.0)), None);

        let mut overflowing = Metrics {
            delivery_success: Some(1e308),
            delivery_attempts: Some(1e-10),
            ..Metrics::default()
        };
        derive_ratios(&mut overflowing);
        assert_eq!(overflowing.delivery_conv_rate, None);
    }

    #[test]
    fn summary_overrides_non_null_fields_only() {
        let log = Metrics {
            grip_success: Some(0.1),
            mean_reward: Some(1.0),
            episode_length: Some(100.0),
            ..Metrics::default()
        };
        let summary = json!({
            "metrics": {
                "grip_success": 0.3,
                "mean_reward": null,
                "perfect_now": 0.05,
                "note": "ignored"
            }
        });
        let merged = merge(&log, Some(&summary));
        assert_eq!(merged.grip_success, Some(0.3));
        assert_eq!(merged.mean_reward, Some(1.0));
        assert_eq!(merged.end_to_end_success, Some(0.05));
        assert_eq!(merged.episode_length, Some(100.0));
        assert_eq!(merge(&log, None), log);
    }

    #[test]
    fn trainer_summary_must_be_an_object() {
        let (root, path) = temp_log("summary", b"[1,2,3]");
        assert!(load_trainer_summary(&path).is_none());
        fs::write(&path, b"{\"metrics\": {}}").expect("write");
        assert!(load_trainer_summary(&path).is_some());
        assert!(load_trainer_summary(&root.join("absent.json")).is_none());
        let _ = fs::remove_dir_all(root);
    }
}
