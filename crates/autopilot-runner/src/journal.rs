use anyhow::Result;
use autopilot_core::{ensure_dir, timestamp};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only lab book. Written for humans, never parsed back.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        action: &str,
        observation: &str,
        outcome: &str,
        next_step: &str,
    ) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let entry = format!(
            "- {} | {} | {} | {} | {}\n",
            timestamp(),
            one_line(action),
            one_line(observation),
            one_line(outcome),
            one_line(next_step)
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }
}

fn one_line(field: &str) -> String {
    field.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    #[test]
    fn entries_append_one_line_each() {
        let root = std::env::temp_dir().join(format!(
            "autopilot_journal_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let journal = Journal::new(root.join("journal").join("labbook.md"));
        journal
            .append("run complete", "Run r1 (iteration 1)", "metrics captured", "")
            .expect("first");
        journal
            .append("run failed", "r2: exit\nstatus 1", "halt", "inspect log")
            .expect("second");
        let text = fs::read_to_string(journal.path()).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("- "));
        assert!(lines[0].ends_with("| run complete | Run r1 (iteration 1) | metrics captured | "));
        assert!(lines[1].contains("| r2: exit status 1 | halt | inspect log"));
        let _ = fs::remove_dir_all(root);
    }
}
