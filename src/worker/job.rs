//! The job model.
//!
//! Every external event (webhook, API call, periodic scan) becomes a job.
//! Jobs are processed one at a time per repository; completed jobs are
//! retained in a bounded history for the REST API.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{JobId, PrId, Sha};

/// What a job does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Re-evaluate one pull request.
    PullRequest { pr: PrId },

    /// A commit changed (push event); route to the owning PR or queue.
    Commit { commit: Sha },

    /// A build status landed on a commit.
    BuildStatus { commit: Sha },

    /// Wipe the queues and re-admit every queued PR.
    QueueRebuild,

    /// Promote everything queued regardless of build status.
    ForceMerge,

    /// Wipe the queues without re-admitting anything.
    DeleteQueues,

    /// Create a destination branch.
    CreateBranch { branch: String, from: String },

    /// Delete a destination branch, leaving a tag.
    DeleteBranch { branch: String },
}

impl JobKind {
    /// Jobs with the same key are deduplicated while one is pending:
    /// enqueuing a second evaluation of the same PR is a no-op.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            JobKind::PullRequest { pr } => Some(format!("pr:{}", pr.0)),
            JobKind::Commit { commit } | JobKind::BuildStatus { commit } => {
                Some(format!("commit:{}", commit))
            }
            JobKind::QueueRebuild => Some("queue-rebuild".to_string()),
            JobKind::ForceMerge => Some("force-merge".to_string()),
            JobKind::DeleteQueues => Some("delete-queues".to_string()),
            JobKind::CreateBranch { .. } | JobKind::DeleteBranch { .. } => None,
        }
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A unit of work on one repository.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub kind: JobKind,
    /// Who asked for it, for API-triggered jobs.
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Outcome description: a status code, a silent-exit reason, or an
    /// error.
    pub details: Option<String>,
    /// Retry counter for transient failures.
    #[serde(skip)]
    pub attempt: u32,
}

impl Job {
    pub fn new(id: JobId, kind: JobKind, user: Option<String>) -> Self {
        Job {
            id,
            kind,
            user,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: JobStatus::Pending,
            details: None,
            attempt: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_request_jobs_share_a_dedup_key() {
        let a = JobKind::PullRequest { pr: PrId(1) };
        let b = JobKind::PullRequest { pr: PrId(1) };
        let c = JobKind::PullRequest { pr: PrId(2) };
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn branch_jobs_are_never_deduplicated() {
        let kind = JobKind::CreateBranch {
            branch: "development/3.0".to_string(),
            from: "development/2.0".to_string(),
        };
        assert_eq!(kind.dedup_key(), None);
    }

    #[test]
    fn job_serializes_with_flattened_kind() {
        let job = Job::new(JobId(7), JobKind::QueueRebuild, Some("alice".to_string()));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["kind"], "queue_rebuild");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["user"], "alice");
    }
}
