//! The dispatcher: one job at a time per repository.
//!
//! External layers (webhooks, REST API, periodic scan) enqueue jobs on a
//! shared [`JobBoard`]; a single [`RepoWorker`] drains it, holding the git
//! workspace for the duration of each job. Transient git-host errors are
//! retried by re-enqueueing the job with exponential backoff; fatal errors
//! are recorded on the job. Shutdown is cooperative: the cancellation
//! token is observed between jobs, never mid-job.

pub mod job;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::gating::{Bot, EvalError};
use crate::git::Workspace;
use crate::hosting::GitHost;
use crate::settings::RepositorySettings;
use crate::tracker::IssueTracker;
use crate::types::JobId;

pub use job::{Job, JobKind, JobStatus};

/// Completed and failed jobs retained for the API.
const HISTORY_LIMIT: usize = 1000;

/// Transient errors are retried this many times.
const MAX_ATTEMPTS: u32 = 5;

/// Fallback scan interval for events the webhooks missed.
const SCAN_INTERVAL: Duration = Duration::from_secs(600);

struct BoardInner {
    pending: VecDeque<Job>,
    history: VecDeque<Job>,
    next_id: u64,
}

/// The shared job queue of one repository.
///
/// FIFO with deduplication: enqueueing a job whose dedup key matches a
/// pending job is a no-op. The history is an append-only ring of the last
/// 1000 finished jobs.
#[derive(Clone)]
pub struct JobBoard {
    inner: Arc<Mutex<BoardInner>>,
    notify: Arc<Notify>,
}

impl JobBoard {
    pub fn new() -> Self {
        JobBoard {
            inner: Arc::new(Mutex::new(BoardInner {
                pending: VecDeque::new(),
                history: VecDeque::new(),
                next_id: 1,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueues a job, returning its id, or `None` when an identical job
    /// is already pending.
    pub fn enqueue(&self, kind: JobKind, user: Option<String>) -> Option<JobId> {
        let id = {
            let mut inner = self.inner.lock().expect("job board poisoned");
            if let Some(key) = kind.dedup_key()
                && inner
                    .pending
                    .iter()
                    .any(|job| job.kind.dedup_key().as_deref() == Some(key.as_str()))
            {
                return None;
            }
            let id = JobId(inner.next_id);
            inner.next_id += 1;
            inner.pending.push_back(Job::new(id, kind, user));
            id
        };
        self.notify.notify_one();
        Some(id)
    }

    /// Re-enqueues a job after a delay (transient-failure retry).
    fn enqueue_retry(&self, mut job: Job, delay: Duration) {
        job.attempt += 1;
        job.status = JobStatus::Pending;
        job.started_at = None;
        let board = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = board.inner.lock().expect("job board poisoned");
                inner.pending.push_back(job);
            }
            board.notify.notify_one();
        });
    }

    /// Takes the next pending job, marking it running.
    fn take_next(&self) -> Option<Job> {
        let mut inner = self.inner.lock().expect("job board poisoned");
        let mut job = inner.pending.pop_front()?;
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        Some(job)
    }

    /// Records a finished job in the history ring.
    fn finish(&self, mut job: Job, status: JobStatus, details: Option<String>) {
        job.status = status;
        job.finished_at = Some(Utc::now());
        job.details = details;
        let mut inner = self.inner.lock().expect("job board poisoned");
        if inner.history.len() >= HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back(job);
    }

    /// Snapshot of pending jobs and history, most recent first.
    pub fn jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().expect("job board poisoned");
        inner
            .pending
            .iter()
            .rev()
            .chain(inner.history.iter().rev())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        let inner = self.inner.lock().expect("job board poisoned");
        inner
            .pending
            .iter()
            .chain(inner.history.iter())
            .find(|job| job.id == id)
            .cloned()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

impl Default for JobBoard {
    fn default() -> Self {
        JobBoard::new()
    }
}

/// Exponential backoff for transient failures: 2, 4, 8, ... seconds.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt + 1).min(300))
}

/// The single worker of one repository.
pub struct RepoWorker<H, T> {
    settings: RepositorySettings,
    board: JobBoard,
    host: H,
    tracker: Option<T>,
    workspace: Workspace,
    shutdown: CancellationToken,
}

impl<H: GitHost, T: IssueTracker> RepoWorker<H, T> {
    pub fn new(
        settings: RepositorySettings,
        board: JobBoard,
        host: H,
        tracker: Option<T>,
        workspace: Workspace,
        shutdown: CancellationToken,
    ) -> Self {
        RepoWorker {
            settings,
            board,
            host,
            tracker,
            workspace,
            shutdown,
        }
    }

    /// Runs until the shutdown token fires. The current job always
    /// finishes before teardown.
    pub async fn run(mut self) {
        info!(repo = %self.settings.repo_id(), "worker started");
        loop {
            while let Some(job) = self.board.take_next() {
                self.process(job);
                if self.shutdown.is_cancelled() {
                    info!("worker shutting down");
                    return;
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("worker shutting down");
                    return;
                }
                _ = self.board.wait() => {}
                _ = tokio::time::sleep(SCAN_INTERVAL) => self.scan(),
            }
        }
    }

    /// Periodic fallback for missed webhooks: re-enqueue every open PR.
    /// Deduplication keeps this cheap when evaluations are already pending.
    fn scan(&mut self) {
        match self.host.list_open_pull_requests() {
            Ok(prs) => {
                for pr in prs {
                    self.board.enqueue(JobKind::PullRequest { pr: pr.id }, None);
                }
            }
            Err(err) => warn!(%err, "periodic scan failed"),
        }
    }

    #[instrument(skip(self, job), fields(job = %job.id, kind = ?job.kind))]
    fn process(&mut self, job: Job) {
        match self.dispatch(&job.kind) {
            Ok(details) => {
                info!(?details, "job completed");
                self.board.finish(job, JobStatus::Completed, details);
            }
            Err(err) if err.is_silent() => {
                self.board
                    .finish(job, JobStatus::Completed, Some(err.to_string()));
            }
            Err(err) if err.is_transient() && job.attempt + 1 < MAX_ATTEMPTS => {
                let delay = backoff_delay(job.attempt);
                warn!(%err, ?delay, attempt = job.attempt, "transient failure, retrying");
                self.board.enqueue_retry(job, delay);
            }
            Err(err) => {
                error!(%err, "job failed");
                self.board.finish(job, JobStatus::Failed, Some(err.to_string()));
            }
        }
    }

    fn dispatch(&mut self, kind: &JobKind) -> Result<Option<String>, EvalError> {
        let tracker = self.tracker.as_ref().map(|t| t as &dyn IssueTracker);
        let mut bot = Bot::new(&self.settings, &mut self.host, tracker, &mut self.workspace);
        match kind {
            JobKind::PullRequest { pr } => {
                let code = bot.handle_pull_request(*pr)?;
                Ok(code.map(|code| format!("status {}", code)))
            }
            JobKind::Commit { commit } | JobKind::BuildStatus { commit } => {
                bot.handle_commit(commit)?;
                Ok(None)
            }
            JobKind::QueueRebuild => {
                let to_requeue = bot.rebuild_queues()?;
                let count = to_requeue.len();
                for pr in to_requeue {
                    self.board.enqueue(JobKind::PullRequest { pr }, None);
                }
                Ok(Some(format!("re-evaluating {} pull requests", count)))
            }
            JobKind::ForceMerge => {
                let merged = bot.handle_queues(true)?;
                Ok(Some(format!("merged {} pull requests", merged.len())))
            }
            JobKind::DeleteQueues => {
                bot.delete_queues()?;
                Ok(None)
            }
            JobKind::CreateBranch { branch, from } => {
                bot.create_destination(branch, from)?;
                Ok(None)
            }
            JobKind::DeleteBranch { branch } => {
                bot.delete_destination(branch)?;
                Ok(None)
            }
        }
    }
}
