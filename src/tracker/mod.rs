//! Issue-tracker adapter seam.
//!
//! The bot needs very little from the tracker: look an issue up by key and
//! read its type, parent relationship and fix versions. A missing tracker
//! configuration disables every tracker check.

use std::collections::HashMap;
use thiserror::Error;

/// Errors surfaced by a tracker adapter.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("issue {0} not found")]
    NotFound(String),

    /// Rate limiting or server-side failure; the job will be retried.
    #[error("transient tracker error (status {status})")]
    Transient { status: u16 },

    #[error("tracker API error: {0}")]
    Api(String),
}

impl TrackerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TrackerError::Transient { .. })
    }
}

/// An issue as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub key: String,
    pub project: String,
    pub issue_type: String,
    pub is_subtask: bool,
    pub fix_versions: Vec<String>,
}

/// Capability set the core consumes from the issue tracker.
pub trait IssueTracker {
    fn get_issue(&self, key: &str) -> Result<Issue, TrackerError>;
}

/// An in-memory tracker, primarily for tests.
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    issues: HashMap<String, Issue>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        InMemoryTracker::default()
    }

    pub fn insert(&mut self, issue: Issue) {
        self.issues.insert(issue.key.clone(), issue);
    }

    /// Convenience constructor for a plain issue.
    pub fn with_issue(
        mut self,
        key: &str,
        issue_type: &str,
        fix_versions: &[&str],
    ) -> Self {
        let project = key.split('-').next().unwrap_or_default().to_string();
        self.insert(Issue {
            key: key.to_string(),
            project,
            issue_type: issue_type.to_string(),
            is_subtask: false,
            fix_versions: fix_versions.iter().map(|s| s.to_string()).collect(),
        });
        self
    }
}

impl IssueTracker for InMemoryTracker {
    fn get_issue(&self, key: &str) -> Result<Issue, TrackerError> {
        self.issues
            .get(key)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(key.to_string()))
    }
}
