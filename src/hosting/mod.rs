//! Git-host adapter seam.
//!
//! The bot consumes a small capability set from the git host: pull requests,
//! comments, reviews and per-commit build statuses. Concrete REST clients
//! (Bitbucket, GitHub) implement [`GitHost`] behind this trait and hide their
//! differences; the core never talks HTTP itself.
//!
//! [`InMemoryHost`] is the reference implementation used by tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::types::{CommentId, PrId, Sha};

/// Errors surfaced by a git-host adapter.
#[derive(Debug, Error)]
pub enum HostError {
    /// Rate limiting or server-side failure; the job will be retried.
    #[error("transient git-host error (status {status})")]
    Transient { status: u16 },

    #[error("pull request {0} not found")]
    PrNotFound(PrId),

    #[error("git-host API error: {0}")]
    Api(String),
}

impl HostError {
    /// True for errors worth retrying with backoff (429 and 5xx).
    pub fn is_transient(&self) -> bool {
        matches!(self, HostError::Transient { .. })
    }
}

/// State of a pull request on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Merged,
    Declined,
}

/// A pull request as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: PrId,
    pub title: String,
    pub author: String,
    pub src_branch: String,
    pub dst_branch: String,
    pub src_commit: Sha,
    pub state: PrState,
    pub description: String,
}

/// A comment on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A review verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
}

/// A review left on a pull request. Later reviews by the same author
/// supersede earlier ones; adapters report only the latest per author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub author: String,
    pub verdict: ReviewVerdict,
}

/// Build status reported on a commit under the configured build key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Successful,
    InProgress,
    NotStarted,
    Stopped,
    Failed,
}

impl BuildStatus {
    /// Severity ordering used to pick the worst status across a set of
    /// integration branches.
    pub fn severity(&self) -> u8 {
        match self {
            BuildStatus::Successful => 0,
            BuildStatus::InProgress => 1,
            BuildStatus::NotStarted => 2,
            BuildStatus::Stopped => 3,
            BuildStatus::Failed => 4,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BuildStatus::Failed | BuildStatus::Stopped)
    }
}

/// Capability set the core consumes from the git host.
pub trait GitHost {
    fn get_pull_request(&self, id: PrId) -> Result<PullRequest, HostError>;

    fn list_open_pull_requests(&self) -> Result<Vec<PullRequest>, HostError>;

    fn create_pull_request(
        &mut self,
        title: &str,
        src_branch: &str,
        dst_branch: &str,
        description: &str,
    ) -> Result<PullRequest, HostError>;

    fn decline_pull_request(&mut self, id: PrId) -> Result<(), HostError>;

    /// Comments in `created_at` order, ties broken by id.
    fn list_comments(&self, pr: PrId) -> Result<Vec<Comment>, HostError>;

    fn post_comment(&mut self, pr: PrId, body: &str) -> Result<CommentId, HostError>;

    fn delete_comment(&mut self, pr: PrId, comment: CommentId) -> Result<(), HostError>;

    /// Latest review per author.
    fn list_reviews(&self, pr: PrId) -> Result<Vec<Review>, HostError>;

    fn get_build_status(&self, commit: &Sha, build_key: &str) -> Result<BuildStatus, HostError>;

    /// Whether the host can record an approval by the PR author
    /// (Bitbucket can, GitHub cannot). When unsupported, the author
    /// approval check is skipped.
    fn supports_author_approval(&self) -> bool {
        true
    }
}

/// An in-memory host, primarily for tests.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    prs: HashMap<PrId, PullRequest>,
    comments: HashMap<PrId, Vec<Comment>>,
    reviews: HashMap<PrId, Vec<Review>>,
    builds: HashMap<(String, String), BuildStatus>,
    next_pr: u64,
    next_comment: u64,
    author_approval: bool,
}

impl InMemoryHost {
    pub fn new() -> Self {
        InMemoryHost {
            next_pr: 1,
            next_comment: 1,
            author_approval: true,
            ..Default::default()
        }
    }

    pub fn without_author_approval(mut self) -> Self {
        self.author_approval = false;
        self
    }

    /// Registers a pull request opened by `author`.
    pub fn open_pull_request(
        &mut self,
        author: &str,
        src_branch: &str,
        dst_branch: &str,
        src_commit: Sha,
    ) -> PrId {
        let id = PrId(self.next_pr);
        self.next_pr += 1;
        self.prs.insert(
            id,
            PullRequest {
                id,
                title: format!("{}: change", src_branch),
                author: author.to_string(),
                src_branch: src_branch.to_string(),
                dst_branch: dst_branch.to_string(),
                src_commit,
                state: PrState::Open,
                description: String::new(),
            },
        );
        id
    }

    pub fn set_src_commit(&mut self, id: PrId, sha: Sha) {
        if let Some(pr) = self.prs.get_mut(&id) {
            pr.src_commit = sha;
        }
    }

    pub fn set_state(&mut self, id: PrId, state: PrState) {
        if let Some(pr) = self.prs.get_mut(&id) {
            pr.state = state;
        }
    }

    pub fn add_review(&mut self, id: PrId, author: &str, verdict: ReviewVerdict) {
        let reviews = self.reviews.entry(id).or_default();
        reviews.retain(|r| r.author != author);
        reviews.push(Review {
            author: author.to_string(),
            verdict,
        });
    }

    pub fn add_comment(&mut self, id: PrId, author: &str, text: &str) -> CommentId {
        let comment_id = CommentId(self.next_comment);
        self.next_comment += 1;
        self.comments.entry(id).or_default().push(Comment {
            id: comment_id,
            author: author.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        });
        comment_id
    }

    pub fn set_build_status(&mut self, commit: &Sha, build_key: &str, status: BuildStatus) {
        self.builds.insert(
            (commit.as_str().to_string(), build_key.to_string()),
            status,
        );
    }

    /// The open PR whose source is `src_branch`, if any.
    pub fn find_by_source(&self, src_branch: &str) -> Option<&PullRequest> {
        self.prs
            .values()
            .find(|pr| pr.state == PrState::Open && pr.src_branch == src_branch)
    }

    pub fn comments_of(&self, id: PrId) -> &[Comment] {
        self.comments.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl GitHost for InMemoryHost {
    fn get_pull_request(&self, id: PrId) -> Result<PullRequest, HostError> {
        self.prs.get(&id).cloned().ok_or(HostError::PrNotFound(id))
    }

    fn list_open_pull_requests(&self) -> Result<Vec<PullRequest>, HostError> {
        let mut prs: Vec<PullRequest> = self
            .prs
            .values()
            .filter(|pr| pr.state == PrState::Open)
            .cloned()
            .collect();
        prs.sort_by_key(|pr| pr.id);
        Ok(prs)
    }

    fn create_pull_request(
        &mut self,
        title: &str,
        src_branch: &str,
        dst_branch: &str,
        description: &str,
    ) -> Result<PullRequest, HostError> {
        let id = PrId(self.next_pr);
        self.next_pr += 1;
        let pr = PullRequest {
            id,
            title: title.to_string(),
            author: "robot".to_string(),
            src_branch: src_branch.to_string(),
            dst_branch: dst_branch.to_string(),
            // the host fills the tip in; a zero sha stands in until then
            src_commit: Sha::parse("0".repeat(40)).map_err(|e| HostError::Api(e.to_string()))?,
            state: PrState::Open,
            description: description.to_string(),
        };
        self.prs.insert(id, pr.clone());
        Ok(pr)
    }

    fn decline_pull_request(&mut self, id: PrId) -> Result<(), HostError> {
        let pr = self.prs.get_mut(&id).ok_or(HostError::PrNotFound(id))?;
        pr.state = PrState::Declined;
        Ok(())
    }

    fn list_comments(&self, pr: PrId) -> Result<Vec<Comment>, HostError> {
        let mut comments = self.comments.get(&pr).cloned().unwrap_or_default();
        comments.sort_by(|a, b| (a.created_at, a.id.0).cmp(&(b.created_at, b.id.0)));
        Ok(comments)
    }

    fn post_comment(&mut self, pr: PrId, body: &str) -> Result<CommentId, HostError> {
        if !self.prs.contains_key(&pr) {
            return Err(HostError::PrNotFound(pr));
        }
        Ok(self.add_comment(pr, "robot", body))
    }

    fn delete_comment(&mut self, pr: PrId, comment: CommentId) -> Result<(), HostError> {
        if let Some(comments) = self.comments.get_mut(&pr) {
            comments.retain(|c| c.id != comment);
        }
        Ok(())
    }

    fn list_reviews(&self, pr: PrId) -> Result<Vec<Review>, HostError> {
        Ok(self.reviews.get(&pr).cloned().unwrap_or_default())
    }

    fn get_build_status(&self, commit: &Sha, build_key: &str) -> Result<BuildStatus, HostError> {
        Ok(self
            .builds
            .get(&(commit.as_str().to_string(), build_key.to_string()))
            .copied()
            .unwrap_or(BuildStatus::NotStarted))
    }

    fn supports_author_approval(&self) -> bool {
        self.author_approval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(n: u64) -> Sha {
        Sha::parse(format!("{:0>40x}", n)).unwrap()
    }

    #[test]
    fn comments_are_ordered_by_creation() {
        let mut host = InMemoryHost::new();
        let pr = host.open_pull_request("bob", "feature/x", "development/1.0", sha(1));
        let first = host.add_comment(pr, "bob", "first");
        let second = host.add_comment(pr, "alice", "second");
        let comments = host.list_comments(pr).unwrap();
        assert_eq!(
            comments.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![first, second]
        );
    }

    #[test]
    fn reviews_keep_latest_verdict_per_author() {
        let mut host = InMemoryHost::new();
        let pr = host.open_pull_request("bob", "feature/x", "development/1.0", sha(1));
        host.add_review(pr, "alice", ReviewVerdict::ChangesRequested);
        host.add_review(pr, "alice", ReviewVerdict::Approved);
        let reviews = host.list_reviews(pr).unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].verdict, ReviewVerdict::Approved);
    }

    #[test]
    fn unreported_build_status_is_not_started() {
        let host = InMemoryHost::new();
        assert_eq!(
            host.get_build_status(&sha(9), "pre-merge").unwrap(),
            BuildStatus::NotStarted
        );
    }

    #[test]
    fn build_severity_orders_failures_last() {
        assert!(BuildStatus::Failed.severity() > BuildStatus::InProgress.severity());
        assert!(BuildStatus::Successful.severity() < BuildStatus::NotStarted.severity());
        assert!(BuildStatus::Failed.is_failed());
        assert!(BuildStatus::Stopped.is_failed());
        assert!(!BuildStatus::InProgress.is_failed());
    }
}
