//! Snapshot of the editable source tree at run start, so a score change can
//! be attributed to a code change (or ruled out).

use anyhow::Result;
use autopilot_core::atomic_write_bytes;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::debug;

pub const DIFF_FILE: &str = "env_diff.patch";
pub const BASE_REV_FILE: &str = "env_base_rev.txt";
pub const FILES_FILE: &str = "env_files.txt";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    pub diff: String,
    pub base_rev: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnvVerdict {
    NoPreviousRun,
    NoChange,
    Changed { files: Vec<String> },
}

impl EnvVerdict {
    pub fn describe(&self) -> String {
        match self {
            EnvVerdict::NoPreviousRun => "no previous run to compare".to_string(),
            EnvVerdict::NoChange => "environment unchanged since previous run".to_string(),
            EnvVerdict::Changed { files } => format!("environment changed: {}", files.join(", ")),
        }
    }
}

/// Runs git and returns trimmed-right stdout; any failure reads as empty.
fn git_output(repo_root: &Path, args: &[&str]) -> String {
    Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default()
}

/// Uncommitted plus staged changes under `subtree`, relative to HEAD.
pub fn capture(repo_root: &Path, subtree: &str) -> EnvSnapshot {
    let diff = git_output(repo_root, &["diff", "HEAD", "--", subtree]);
    let base_rev = git_output(repo_root, &["rev-parse", "HEAD"]);
    let files = git_output(repo_root, &["diff", "--name-only", "HEAD", "--", subtree])
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    debug!(repo = %repo_root.display(), subtree, base_rev = %base_rev, "captured environment state");
    EnvSnapshot {
        diff,
        base_rev,
        files,
    }
}

impl EnvSnapshot {
    pub fn save(&self, run_dir: &Path) -> Result<()> {
        atomic_write_bytes(&run_dir.join(DIFF_FILE), self.diff.as_bytes())?;
        atomic_write_bytes(&run_dir.join(BASE_REV_FILE), self.base_rev.as_bytes())?;
        let mut listing = self.files.join("\n");
        if !listing.is_empty() {
            listing.push('\n');
        }
        atomic_write_bytes(&run_dir.join(FILES_FILE), listing.as_bytes())?;
        Ok(())
    }
}

/// The diff captured for a run, if that run captured one.
pub fn load_diff(run_dir: &Path) -> Option<String> {
    fs::read_to_string(run_dir.join(DIFF_FILE)).ok()
}

/// Splits a unified diff into per-file sections keyed by the `b/` path.
pub fn split_by_file(diff: &str) -> BTreeMap<String, String> {
    let mut sections: BTreeMap<String, String> = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in diff.lines() {
        if let Some(header) = line.strip_prefix("diff --git ") {
            let path = header
                .rsplit_once(" b/")
                .map(|(_, b)| b.to_string())
                .unwrap_or_else(|| header.to_string());
            current = Some(path.clone());
            sections.entry(path).or_default();
        }
        if let Some(path) = &current {
            let section = sections.entry(path.clone()).or_default();
            section.push_str(line);
            section.push('\n');
        }
    }
    sections
}

pub fn compare(previous: Option<&str>, current: &str) -> EnvVerdict {
    let Some(previous) = previous else {
        return EnvVerdict::NoPreviousRun;
    };
    if previous == current {
        return EnvVerdict::NoChange;
    }
    let before = split_by_file(previous);
    let after = split_by_file(current);
    let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    let files: Vec<String> = paths
        .into_iter()
        .filter(|p| before.get(*p) != after.get(*p))
        .cloned()
        .collect();
    if files.is_empty() {
        // Only header-less noise differs (e.g. trailing whitespace).
        EnvVerdict::NoChange
    } else {
        EnvVerdict::Changed { files }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_core::ensure_dir;
    use chrono::Utc;

    const DIFF_A: &str = "diff --git a/env/reward.c b/env/reward.c\n\
index 1..2 100644\n\
--- a/env/reward.c\n\
+++ b/env/reward.c\n\
@@ -1 +1 @@\n\
-float bonus = 1.0;\n\
+float bonus = 2.0;\n";

    const DIFF_B: &str = "diff --git a/env/obs.h b/env/obs.h\n\
--- a/env/obs.h\n\
+++ b/env/obs.h\n\
@@ -3 +3 @@\n\
-int n = 3;\n\
+int n = 4;\n";

    #[test]
    fn first_run_has_nothing_to_compare() {
        assert_eq!(compare(None, DIFF_A), EnvVerdict::NoPreviousRun);
    }

    #[test]
    fn identical_diffs_mean_no_change() {
        assert_eq!(compare(Some(DIFF_A), DIFF_A), EnvVerdict::NoChange);
        assert_eq!(compare(Some(""), ""), EnvVerdict::NoChange);
    }

    #[test]
    fn changed_files_come_from_per_file_headers() {
        let both = format!("{}{}", DIFF_A, DIFF_B);
        assert_eq!(
            compare(Some(DIFF_A), &both),
            EnvVerdict::Changed {
                files: vec!["env/obs.h".to_string()]
            }
        );
        let edited = DIFF_A.replace("2.0", "3.0");
        assert_eq!(
            compare(Some(&both), &edited),
            EnvVerdict::Changed {
                files: vec!["env/obs.h".to_string(), "env/reward.c".to_string()]
            }
        );
        assert_eq!(
            compare(Some(DIFF_A), ""),
            EnvVerdict::Changed {
                files: vec!["env/reward.c".to_string()]
            }
        );
    }

    #[test]
    fn verdict_serializes_with_status_tag() {
        let v = serde_json::to_value(EnvVerdict::Changed {
            files: vec!["a.c".to_string()],
        })
        .expect("ser");
        assert_eq!(v, serde_json::json!({"status": "changed", "files": ["a.c"]}));
        let v = serde_json::to_value(EnvVerdict::NoPreviousRun).expect("ser");
        assert_eq!(v, serde_json::json!({"status": "no_previous_run"}));
    }

    #[test]
    fn capture_outside_a_repository_is_empty_and_saves() {
        let root = std::env::temp_dir().join(format!(
            "autopilot_env_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("root");
        let snapshot = capture(&root, "src");
        assert_eq!(snapshot.diff, "");
        assert!(snapshot.files.is_empty());
        snapshot.save(&root).expect("save");
        assert_eq!(load_diff(&root).as_deref(), Some(""));
        assert!(root.join(BASE_REV_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {:?} failed", args);
    }

    #[test]
    fn capture_inside_a_repository_is_limited_to_the_subtree() {
        if Command::new("git").arg("--version").output().is_err() {
            return;
        }
        let root = std::env::temp_dir().join(format!(
            "autopilot_env_git_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root.join("env")).expect("env dir");
        fs::write(root.join("env/reward.c"), "float bonus = 1.0;\n").expect("write");
        fs::write(root.join("README.md"), "drone\n").expect("write");
        git(&root, &["init", "-q"]);
        git(&root, &["add", "."]);
        git(
            &root,
            &[
                "-c",
                "user.name=autopilot",
                "-c",
                "user.email=autopilot@example.com",
                "-c",
                "commit.gpgsign=false",
                "commit",
                "-q",
                "-m",
                "baseline",
            ],
        );

        let clean = capture(&root, "env");
        assert_eq!(clean.diff, "");
        assert!(clean.files.is_empty());
        assert_eq!(clean.base_rev.len(), 40);

        fs::write(root.join("env/reward.c"), "float bonus = 2.0;\n").expect("edit inside");
        fs::write(root.join("README.md"), "drone pick and place\n").expect("edit outside");
        let edited = capture(&root, "env");
        assert_eq!(edited.base_rev, clean.base_rev);
        assert_eq!(edited.files, vec!["env/reward.c".to_string()]);
        assert!(edited.diff.contains("diff --git a/env/reward.c b/env/reward.c"));
        assert!(edited.diff.contains("+float bonus = 2.0;"));
        assert!(!edited.diff.contains("README.md"));

        assert_eq!(
            compare(Some(&clean.diff), &edited.diff),
            EnvVerdict::Changed {
                files: vec!["env/reward.c".to_string()]
            }
        );
        assert_eq!(compare(Some(&edited.diff), &edited.diff), EnvVerdict::NoChange);
        let _ = fs::remove_dir_all(root);
    }
}
