//! Per-PR facts.
//!
//! `PrFacts` is rebuilt from ground truth (branches, comments, reviews,
//! build statuses, tracker state) on every evaluation and never persisted.
//! The evaluator consumes it as a pure function; everything that talks to
//! the outside world happens during collection, in `gating::Bot`.

use crate::branches::SourceBranch;
use crate::cascade::Cascade;
use crate::commands::{CommandCall, EffectiveOptions};
use crate::hosting::{BuildStatus, PullRequest};
use crate::tracker::Issue;
use crate::types::{PrId, Sha};

/// Approvals split by reviewer role.
#[derive(Debug, Clone, Default)]
pub struct ApprovalFacts {
    /// The author approved through a review or the `approve` option.
    pub author_approved: bool,
    /// False when the host cannot record author approvals; the author
    /// check is then skipped.
    pub author_approval_supported: bool,
    /// Reviewers (not the author, not the robot) with a standing approval.
    pub peer_approvers: Vec<String>,
    /// Reviewers with an outstanding change request.
    pub change_requesters: Vec<String>,
}

/// What the tracker said about the issue referenced by the source branch.
/// Absent entirely when tracker checks do not apply to this PR.
#[derive(Debug, Clone)]
pub enum IssueFacts {
    /// The source branch references no issue and the destination requires
    /// one.
    MissingKey,
    /// The key exists but the tracker has no such issue.
    NotFound { key: String },
    /// The issue as reported by the tracker.
    Found(Issue),
}

/// State of the integration branches after this evaluation's update.
#[derive(Debug, Clone)]
pub enum IntegrationState {
    /// Lazy creation is configured and nobody asked for branches yet.
    NotMaterialized,

    /// Branches exist and merged cleanly.
    Clean {
        branches: Vec<String>,
        created_any: bool,
    },

    /// The first integration branch carries foreign history.
    HistoryMismatch { commit: Sha, branch: String },

    /// The cascade stopped on a merge conflict.
    Conflict {
        source: String,
        branch: String,
        on_first: bool,
    },
}

/// A build result on one branch tip relevant to the PR.
#[derive(Debug, Clone)]
pub struct BuildFacts {
    pub branch: String,
    pub commit: Sha,
    pub status: BuildStatus,
}

/// Status of declared `after_pull_request` dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyFacts {
    pub opened: Vec<PrId>,
    pub declined: Vec<PrId>,
}

impl DependencyFacts {
    pub fn all_merged(&self) -> bool {
        self.opened.is_empty() && self.declined.is_empty()
    }
}

/// Everything the evaluator needs to know about one pull request.
#[derive(Debug, Clone)]
pub struct PrFacts {
    pub pr: PullRequest,
    pub source: SourceBranch,
    pub cascade: Cascade,
    pub options: EffectiveOptions,
    pub commands: Vec<CommandCall>,
    pub approvals: ApprovalFacts,
    /// How many commits the source lags behind its destination.
    pub commits_behind: usize,
    /// `None` when tracker checks are disabled or not applicable.
    pub issue: Option<IssueFacts>,
    pub integration: IntegrationState,
    /// Build statuses on every integration tip (or on the source tip when
    /// the cascade has a single destination).
    pub builds: Vec<BuildFacts>,
    pub dependencies: DependencyFacts,
}
