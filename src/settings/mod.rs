//! Per-repository configuration.
//!
//! Settings are loaded from a JSON file named by `WATERFLOW_SETTINGS`
//! (see `main.rs`); every field has a default so a minimal file only needs
//! the repository coordinates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::types::RepoId;

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Repository configuration recognized by the bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Git-host flavour, e.g. `bitbucket` or `github`.
    pub repository_host: String,
    pub repository_owner: String,
    pub repository_slug: String,

    /// The bot's username on the git host; comments addressed
    /// `@<robot>` are interpreted as options or commands.
    pub robot: String,
    pub robot_email: String,

    /// Key under which CI reports build statuses on commits.
    pub build_key: String,

    pub required_peer_approvals: usize,
    /// Must not exceed `required_peer_approvals`; leader approvals count
    /// towards the peer total.
    pub required_leader_approvals: usize,
    pub need_author_approval: bool,

    /// Users allowed to set privileged options on other people's PRs.
    pub admins: Vec<String>,
    pub project_leaders: Vec<String>,
    /// Per-author grants: options a PR author may set on their own PR.
    pub pr_author_options: HashMap<String, Vec<String>>,

    pub jira_account_url: String,
    pub jira_email: String,
    /// Issue projects handled by this instance; empty disables tracker checks.
    pub jira_keys: Vec<String>,
    /// Issue type → expected branch prefix.
    pub prefixes: HashMap<String, String>,
    /// Extra source prefixes admitted without further checks.
    pub bypass_prefixes: Vec<String>,
    pub disable_version_checks: bool,

    /// Maximum commits the source may lag behind its destination;
    /// 0 disables the check.
    pub max_commit_diff: usize,

    pub always_create_integration_pull_requests: bool,
    pub always_create_integration_branches: bool,

    /// When false, approved PRs merge directly instead of queueing.
    pub use_queue: bool,

    /// Shared secret for the REST API (`GET /api/auth?access_token=`).
    pub api_token: String,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        RepositorySettings {
            repository_host: "bitbucket".to_string(),
            repository_owner: String::new(),
            repository_slug: String::new(),
            robot: "waterflow".to_string(),
            robot_email: "waterflow@localhost".to_string(),
            build_key: "pre-merge".to_string(),
            required_peer_approvals: 2,
            required_leader_approvals: 0,
            need_author_approval: true,
            admins: Vec::new(),
            project_leaders: Vec::new(),
            pr_author_options: HashMap::new(),
            jira_account_url: String::new(),
            jira_email: String::new(),
            jira_keys: Vec::new(),
            prefixes: HashMap::new(),
            bypass_prefixes: Vec::new(),
            disable_version_checks: false,
            max_commit_diff: 0,
            always_create_integration_pull_requests: false,
            always_create_integration_branches: true,
            use_queue: true,
            api_token: String::new(),
        }
    }
}

impl RepositorySettings {
    /// Loads and validates settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        let settings: RepositorySettings = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.repository_owner.is_empty() || self.repository_slug.is_empty() {
            return Err(SettingsError::Invalid(
                "repository_owner and repository_slug are mandatory".to_string(),
            ));
        }
        if self.required_leader_approvals > self.required_peer_approvals {
            return Err(SettingsError::Invalid(format!(
                "required_leader_approvals ({}) exceeds required_peer_approvals ({})",
                self.required_leader_approvals, self.required_peer_approvals
            )));
        }
        Ok(())
    }

    pub fn repo_id(&self) -> RepoId {
        RepoId::new(&self.repository_owner, &self.repository_slug)
    }

    /// Whether issue-tracker checks are enabled at all.
    pub fn tracker_enabled(&self) -> bool {
        !self.jira_keys.is_empty() && !self.jira_account_url.is_empty()
    }

    /// Whether `user` may set privileged options on a PR authored by
    /// `pr_author`. Admins qualify on any PR but their own; a PR author
    /// qualifies on their own PR only for options granted through
    /// `pr_author_options`.
    pub fn is_privileged(&self, user: &str, pr_author: &str, option: &str) -> bool {
        if user != pr_author {
            return self.admins.iter().any(|a| a == user);
        }
        self.pr_author_options
            .get(user)
            .is_some_and(|granted| granted.iter().any(|o| o == option))
    }
}
