//! fresh / continue resolution of the checkpoint a run starts from.

use crate::checkpoint::ProjectState;
use crate::config::{ResumeMode, RunPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeSource {
    Latest,
    Best,
    Explicit(String),
}

impl ResumeSource {
    /// `None` and `"latest"` both mean latest; any other string is a path.
    pub fn parse(resume_from: Option<&str>) -> Self {
        match resume_from {
            None | Some("latest") => ResumeSource::Latest,
            Some("best") => ResumeSource::Best,
            Some(path) => ResumeSource::Explicit(path.to_string()),
        }
    }
}

/// What to resume from, or `None` for a fresh start.
pub fn resume_source(policy: &RunPolicy) -> Option<ResumeSource> {
    match policy.resume_mode {
        ResumeMode::Fresh => None,
        ResumeMode::Continue => Some(ResumeSource::parse(policy.resume_from.as_deref())),
    }
}

/// Checkpoint path to inject into the config. Continuing with nothing to
/// continue from degrades to a fresh start; explicit paths are not checked.
pub fn resolve_resume_path(policy: &RunPolicy, state: &ProjectState) -> Option<String> {
    match resume_source(policy)? {
        ResumeSource::Latest => state
            .latest_checkpoint()
            .map(|p| p.to_string_lossy().to_string()),
        ResumeSource::Best => state.read_best().path,
        ResumeSource::Explicit(path) => Some(path),
    }
}
