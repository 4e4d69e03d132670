//! The per-PR gating driver.
//!
//! `Bot` wires the collaborators together: on every wake-up it re-derives
//! the pull request's state from repository facts, runs the check chain,
//! and performs exactly one observable action (post a status message,
//! create integration branches, enqueue, merge, or nothing). Nothing is
//! remembered between evaluations; ground truth is branches, comments and
//! build statuses.

pub mod checks;
pub mod facts;

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::branches::{DestinationBranch, IntegrationRef, SourceBranch, SourcePrefix};
use crate::cascade::{Cascade, CascadeError, CascadeSet};
use crate::commands::{
    CommandCall, CommandToken, CommentScan, EffectiveOptions, scan_comments,
};
use crate::git::{GitError, Workspace};
use crate::hosting::{GitHost, HostError, PrState, PullRequest, ReviewVerdict};
use crate::integration::{
    IntegrationEngine, IntegrationError, ResetResult, UpdateResult, branch_names,
};
use crate::messages::Message;
use crate::messenger::Messenger;
use crate::queue::{self, AdmitOutcome, QueueCollection, QueueError};
use crate::settings::RepositorySettings;
use crate::tracker::{IssueTracker, TrackerError};
use crate::types::{PrId, Sha};

pub use checks::{Verdict, WaitReason, evaluate};
pub use facts::{
    ApprovalFacts, BuildFacts, DependencyFacts, IntegrationState, IssueFacts, PrFacts,
};

/// Errors raised while driving an evaluation.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Everything is already in the desired state; exit silently.
    #[error("nothing to do")]
    NothingToDo,

    /// The pull request is not under this robot's control; exit silently.
    #[error("not my job")]
    NotMyJob,

    /// The repository violates forward propagation; operator action needed.
    #[error("development branches not self-contained: {older} is not in {newer}")]
    IncoherentCascade { older: String, newer: String },

    /// The queues failed validation during a queue job.
    #[error("the queues are incoherent: {0}")]
    IncoherentQueues(String),

    /// A request parameter was invalid (API-driven jobs).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cascade(#[from] CascadeError),
}

impl EvalError {
    /// Silent outcomes are not failures; the job completes quietly.
    pub fn is_silent(&self) -> bool {
        matches!(self, EvalError::NothingToDo | EvalError::NotMyJob)
    }

    /// Transient errors are retried with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            EvalError::Host(err) => err.is_transient(),
            EvalError::Tracker(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// The gating driver for one repository.
pub struct Bot<'a> {
    pub settings: &'a RepositorySettings,
    pub host: &'a mut dyn GitHost,
    pub tracker: Option<&'a dyn IssueTracker>,
    pub workspace: &'a mut Workspace,
    messenger: Messenger,
}

impl<'a> Bot<'a> {
    pub fn new(
        settings: &'a RepositorySettings,
        host: &'a mut dyn GitHost,
        tracker: Option<&'a dyn IssueTracker>,
        workspace: &'a mut Workspace,
    ) -> Self {
        let messenger = Messenger::new(settings);
        Bot {
            settings,
            host,
            tracker,
            workspace,
            messenger,
        }
    }

    fn post(
        &mut self,
        pr: PrId,
        message: &Message,
        options: &EffectiveOptions,
    ) -> Result<(), EvalError> {
        self.messenger
            .post(self.host, pr, message, &options.active_labels())?;
        Ok(())
    }

    fn cascade_set(&mut self) -> Result<CascadeSet, EvalError> {
        let branch_names = self.workspace.remote_branch_names()?;
        let tags = self.workspace.tags()?;
        Ok(CascadeSet::from_refs(
            branch_names.iter().map(String::as_str),
            tags.iter().map(String::as_str),
        ))
    }

    /// Evaluates one pull request end to end. Returns the status code of
    /// the message posted, if any.
    #[instrument(skip(self, id), fields(pr = %id))]
    pub fn handle_pull_request(&mut self, id: PrId) -> Result<Option<u16>, EvalError> {
        let pr = self.host.get_pull_request(id)?;
        match pr.state {
            PrState::Merged => return Err(EvalError::NothingToDo),
            PrState::Declined => return self.handle_declined(&pr),
            PrState::Open => {}
        }

        // Integration and queue branches are the robot's own; their PRs
        // are review surfaces, not inputs.
        if pr.src_branch.starts_with("w/") || pr.src_branch.starts_with("q/") {
            return Err(EvalError::NotMyJob);
        }

        self.workspace.sync()?;
        let refs = self.cascade_set()?;
        if refs.find(&pr.dst_branch).is_none() {
            return Err(EvalError::NotMyJob);
        }

        let source = match SourceBranch::parse(&pr.src_branch, &self.settings.bypass_prefixes) {
            Ok(source) => source,
            Err(_) => {
                let message = Message::IncorrectPrefix {
                    prefix: pr
                        .src_branch
                        .split('/')
                        .next()
                        .unwrap_or(&pr.src_branch)
                        .to_string(),
                    allowed: permitted_prefixes(self.settings),
                };
                self.post(pr.id, &message, &EffectiveOptions::default())?;
                return Ok(Some(message.code()));
            }
        };

        // The source may have been deleted by its author.
        if !self.workspace.remote_branch_exists(&source.name)? {
            return Err(EvalError::NothingToDo);
        }

        self.post(
            pr.id,
            &Message::Greeting {
                author: pr.author.clone(),
            },
            &EffectiveOptions::default(),
        )?;

        let comments = self.host.list_comments(pr.id)?;
        let scan = match scan_comments(&comments, self.settings, &pr.author) {
            Ok(scan) => scan,
            Err(err) => {
                let message = err.into_message();
                self.post(pr.id, &message, &EffectiveOptions::default())?;
                return Ok(Some(message.code()));
            }
        };
        debug!(options = ?scan.options.active_labels(), "active options");

        for call in scan.commands.clone() {
            if let Some(code) = self.run_command(&pr, &source, &refs, &call, &scan.options)? {
                return Ok(Some(code));
            }
        }

        // The host may lag behind an already-performed merge.
        if self
            .workspace
            .includes_commit(&pr.dst_branch, &source.name)?
        {
            return Err(EvalError::NothingToDo);
        }

        let cascade = match refs.finalize(&pr.dst_branch, &source.prefix) {
            Ok(cascade) => cascade,
            Err(_) => return Err(EvalError::NotMyJob),
        };
        self.check_forward_propagation(&refs)?;

        // A queued PR is owned by the queue: drive the queues instead.
        if self.settings.use_queue {
            let queues = QueueCollection::build(self.workspace, &refs)?;
            if queues.is_queued(pr.id) {
                debug!("pull request is queued, driving the queues");
                match self.merge_queues(&refs, queues, false) {
                    Err(EvalError::IncoherentQueues(_)) => {
                        let message = Message::QueueOutOfOrder;
                        self.post(pr.id, &message, &scan.options)?;
                        return Ok(Some(message.code()));
                    }
                    other => {
                        other?;
                    }
                }
                return Ok(None);
            }
        }

        let facts = self.collect_facts(pr, source, cascade, scan)?;

        if let IntegrationState::Clean {
            branches,
            created_any: true,
        } = &facts.integration
        {
            let children = self.ensure_integration_prs(&facts, branches)?;
            let message = Message::IntegrationCreated {
                children,
                ignored: facts.cascade.ignored.clone(),
            };
            self.post(facts.pr.id, &message, &facts.options)?;
        }

        match evaluate(&facts, self.settings) {
            Verdict::Blocked(message) => {
                self.post(facts.pr.id, &message, &facts.options)?;
                Ok(Some(message.code()))
            }
            Verdict::Waiting(reason) => {
                debug!(?reason, "waiting");
                Ok(None)
            }
            Verdict::Ready => self.land(&facts, &refs),
        }
    }

    /// All gates passed: enqueue the PR, or merge it directly when queues
    /// are disabled.
    fn land(&mut self, facts: &PrFacts, refs: &CascadeSet) -> Result<Option<u16>, EvalError> {
        if self.settings.use_queue {
            let queues = QueueCollection::build(self.workspace, refs)?;
            if !queues.validate(self.workspace)?.is_empty() {
                let message = Message::QueueOutOfOrder;
                self.post(facts.pr.id, &message, &facts.options)?;
                return Ok(Some(message.code()));
            }
            match queue::admit(self.workspace, &facts.cascade, &facts.source, facts.pr.id)? {
                AdmitOutcome::Conflict => {
                    let message = Message::QueueConflict;
                    self.post(facts.pr.id, &message, &facts.options)?;
                    Ok(Some(message.code()))
                }
                AdmitOutcome::Queued { .. } => {
                    let message = Message::Queued {
                        branches: facts.cascade.branch_names(),
                        ignored: facts.cascade.ignored.clone(),
                        issue: facts.source.issue_key.as_ref().map(|k| k.key.clone()),
                    };
                    self.post(facts.pr.id, &message, &facts.options)?;
                    Ok(Some(message.code()))
                }
            }
        } else {
            let mut engine = IntegrationEngine::new(self.workspace);
            engine.merge_cascade(&facts.cascade, &facts.source)?;
            let message = Message::SuccessfulMerge {
                branches: facts.cascade.branch_names(),
                ignored: facts.cascade.ignored.clone(),
                issue: facts.source.issue_key.as_ref().map(|k| k.key.clone()),
            };
            self.post(facts.pr.id, &message, &facts.options)?;
            Ok(Some(message.code()))
        }
    }

    /// Builds the facts record for the evaluator, performing the
    /// integration-branch work along the way.
    fn collect_facts(
        &mut self,
        pr: PullRequest,
        source: SourceBranch,
        cascade: Cascade,
        scan: CommentScan,
    ) -> Result<PrFacts, EvalError> {
        let approvals = self.collect_approvals(&pr)?;
        let commits_behind = self.commits_behind(&pr, &source)?;
        let issue = self.collect_issue(&source)?;
        let dependencies = self.collect_dependencies(&scan.options)?;

        let mut builds = Vec::new();
        let integration = if cascade.forward().is_empty() {
            // single-destination cascade: the build gate applies to the
            // source tip itself
            let tip = self.workspace.branch_tip(&source.name)?;
            self.push_build_fact(&mut builds, source.name.clone(), tip)?;
            IntegrationState::Clean {
                branches: Vec::new(),
                created_any: false,
            }
        } else if !self.should_materialize(&cascade, &source, &scan.options)? {
            IntegrationState::NotMaterialized
        } else {
            let mut engine = IntegrationEngine::new(self.workspace);
            let update = engine.update(
                &cascade,
                &source,
                scan.options.no_octopus,
                self.settings.use_queue,
            )?;
            match update {
                UpdateResult::Updated {
                    branches: states,
                    created_any,
                    ..
                } => {
                    let mut names = Vec::new();
                    for state in states {
                        self.push_build_fact(&mut builds, state.name.clone(), state.tip)?;
                        names.push(state.name);
                    }
                    IntegrationState::Clean {
                        branches: names,
                        created_any,
                    }
                }
                UpdateResult::HistoryMismatch { commit, branch } => {
                    IntegrationState::HistoryMismatch { commit, branch }
                }
                UpdateResult::Conflict {
                    source,
                    branch,
                    on_first,
                } => IntegrationState::Conflict {
                    source,
                    branch,
                    on_first,
                },
            }
        };

        Ok(PrFacts {
            pr,
            source,
            cascade,
            options: scan.options,
            commands: scan.commands,
            approvals,
            commits_behind,
            issue,
            integration,
            builds,
            dependencies,
        })
    }

    /// How far the source lags behind its destination.
    ///
    /// The host's recorded source tip is the previous observation of the
    /// branch: commits it carried that the live branch no longer has were
    /// rebased away, and the host may still count them against the
    /// destination, so they deduct from the distance. A rebase onto a
    /// fresher destination can drive the signed result below zero; that
    /// transient state is an anomaly, logged and clamped to 0.
    fn commits_behind(&mut self, pr: &PullRequest, source: &SourceBranch) -> Result<usize, EvalError> {
        let behind = self
            .workspace
            .commit_diff(&pr.dst_branch, &source.name)?
            .len() as i64;
        let rebased_away = match self.workspace.rev_parse(pr.src_commit.as_str()) {
            Ok(_) => self
                .workspace
                .commit_diff(pr.src_commit.as_str(), &source.name)?
                .len() as i64,
            // the recorded tip is gone entirely; nothing to deduct
            Err(_) => 0,
        };
        let distance = behind - rebased_away;
        if distance < 0 {
            warn!(
                pr = %pr.id,
                behind,
                rebased_away,
                "commit distance went negative after a rebase; clamping to 0"
            );
            return Ok(0);
        }
        Ok(distance as usize)
    }

    fn push_build_fact(
        &mut self,
        builds: &mut Vec<BuildFacts>,
        branch: String,
        commit: Sha,
    ) -> Result<(), EvalError> {
        if self.settings.build_key.is_empty() {
            return Ok(());
        }
        let status = self
            .host
            .get_build_status(&commit, &self.settings.build_key)?;
        builds.push(BuildFacts {
            branch,
            commit,
            status,
        });
        Ok(())
    }

    fn collect_approvals(&mut self, pr: &PullRequest) -> Result<ApprovalFacts, EvalError> {
        let mut approvals = ApprovalFacts {
            author_approval_supported: self.host.supports_author_approval(),
            ..Default::default()
        };
        for review in self.host.list_reviews(pr.id)? {
            if review.author == self.settings.robot {
                continue;
            }
            if review.author == pr.author {
                if review.verdict == ReviewVerdict::Approved {
                    approvals.author_approved = true;
                }
                continue;
            }
            match review.verdict {
                ReviewVerdict::Approved => approvals.peer_approvers.push(review.author),
                ReviewVerdict::ChangesRequested => {
                    approvals.change_requesters.push(review.author)
                }
            }
        }
        Ok(approvals)
    }

    fn collect_issue(&mut self, source: &SourceBranch) -> Result<Option<IssueFacts>, EvalError> {
        if !self.settings.tracker_enabled() {
            return Ok(None);
        }
        // configured extra prefixes (automation branches) skip the tracker
        if matches!(source.prefix, SourcePrefix::Custom(_)) {
            return Ok(None);
        }
        let Some(tracker) = self.tracker else {
            return Ok(None);
        };
        let Some(key) = &source.issue_key else {
            return Ok(Some(IssueFacts::MissingKey));
        };
        match tracker.get_issue(&key.key) {
            Ok(issue) => Ok(Some(IssueFacts::Found(issue))),
            Err(TrackerError::NotFound(_)) => Ok(Some(IssueFacts::NotFound {
                key: key.key.clone(),
            })),
            Err(err) => Err(err.into()),
        }
    }

    fn collect_dependencies(
        &mut self,
        options: &EffectiveOptions,
    ) -> Result<DependencyFacts, EvalError> {
        let mut dependencies = DependencyFacts::default();
        for dep in &options.after_pull_request {
            match self.host.get_pull_request(*dep) {
                Ok(dep_pr) => match dep_pr.state {
                    PrState::Merged => {}
                    PrState::Open => dependencies.opened.push(*dep),
                    PrState::Declined => dependencies.declined.push(*dep),
                },
                // a dependency that does not exist can never be merged
                Err(HostError::PrNotFound(_)) => dependencies.declined.push(*dep),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(dependencies)
    }

    /// Integration branches are created eagerly unless lazy creation is
    /// configured, in which case an existing branch or an explicit option
    /// triggers them.
    fn should_materialize(
        &mut self,
        cascade: &Cascade,
        source: &SourceBranch,
        options: &EffectiveOptions,
    ) -> Result<bool, EvalError> {
        if self.settings.always_create_integration_branches
            || options.create_integration_branches
            || options.create_pull_requests
        {
            return Ok(true);
        }
        for name in branch_names(cascade, source) {
            if self.workspace.remote_branch_exists(&name)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Creates the integration pull requests when configured to, returning
    /// descriptors for the 121 message.
    fn ensure_integration_prs(
        &mut self,
        facts: &PrFacts,
        branches: &[String],
    ) -> Result<Vec<String>, EvalError> {
        let create = self.settings.always_create_integration_pull_requests
            || facts.options.create_pull_requests;
        if !create {
            return Ok(branches.to_vec());
        }

        let open_prs = self.host.list_open_pull_requests()?;
        let mut children = Vec::new();
        for (branch, destination) in branches.iter().zip(facts.cascade.forward()) {
            let existing = open_prs
                .iter()
                .find(|p| p.src_branch == *branch && p.dst_branch == destination.name);
            let child = match existing {
                Some(pr) => pr.clone(),
                None => {
                    let title = format!(
                        "INTEGRATION [PR{} > {}] {}",
                        facts.pr.id, destination.name, facts.pr.title
                    );
                    let description = format!(
                        "This pull request carries {} forward into `{}`.\n\n\
                         It belongs to the merge robot: do not edit or merge \
                         it yourself, except to resolve conflicts on `{}`.",
                        facts.pr.id, destination.name, branch
                    );
                    self.host
                        .create_pull_request(&title, branch, &destination.name, &description)?
                }
            };
            children.push(format!("{} ({})", child.id, branch));
        }
        Ok(children)
    }

    fn run_command(
        &mut self,
        pr: &PullRequest,
        source: &SourceBranch,
        refs: &CascadeSet,
        call: &CommandCall,
        options: &EffectiveOptions,
    ) -> Result<Option<u16>, EvalError> {
        info!(command = call.token.keyword(), author = %call.author, "running command");
        if call.token.not_implemented() {
            let message = Message::NotImplemented {
                command: call.token.keyword().to_string(),
            };
            self.post(pr.id, &message, options)?;
            return Ok(Some(message.code()));
        }
        match call.token {
            CommandToken::Help => {
                let message = Message::Help;
                self.post(pr.id, &message, options)?;
                Ok(Some(message.code()))
            }
            CommandToken::Status => {
                let message = Message::StatusReport {
                    state: format!("{} → {}", source.name, pr.dst_branch),
                };
                self.post(pr.id, &message, options)?;
                Ok(Some(message.code()))
            }
            CommandToken::Reset | CommandToken::ForceReset => {
                let force = call.token == CommandToken::ForceReset;
                self.reset(pr, source, refs, options, force)
            }
            CommandToken::Build | CommandToken::Retry | CommandToken::Clear => unreachable!(),
        }
    }

    fn reset(
        &mut self,
        pr: &PullRequest,
        source: &SourceBranch,
        refs: &CascadeSet,
        options: &EffectiveOptions,
        force: bool,
    ) -> Result<Option<u16>, EvalError> {
        let cascade = refs.finalize(&pr.dst_branch, &source.prefix)?;
        let names = branch_names(&cascade, source);

        let mut engine = IntegrationEngine::new(self.workspace);
        match engine.reset(&cascade, source, force)? {
            ResetResult::LossyRefused => {
                let message = Message::LossyResetWarning;
                self.post(pr.id, &message, options)?;
                Ok(Some(message.code()))
            }
            ResetResult::NothingToDo | ResetResult::Done { .. } => {
                let mut undeclined = Vec::new();
                let open_prs = self.host.list_open_pull_requests()?;
                for child in open_prs.iter().filter(|p| names.contains(&p.src_branch)) {
                    if self.host.decline_pull_request(child.id).is_err() {
                        undeclined.push(child.id);
                    }
                }
                let message = Message::ResetComplete { undeclined };
                self.post(pr.id, &message, options)?;
                Ok(Some(message.code()))
            }
        }
    }

    /// A declined PR takes its integration branches and child PRs with it.
    fn handle_declined(&mut self, pr: &PullRequest) -> Result<Option<u16>, EvalError> {
        self.workspace.sync()?;
        let refs = self.cascade_set()?;
        let Ok(source) = SourceBranch::parse(&pr.src_branch, &self.settings.bypass_prefixes)
        else {
            return Err(EvalError::NothingToDo);
        };
        let Ok(cascade) = refs.finalize(&pr.dst_branch, &source.prefix) else {
            return Err(EvalError::NothingToDo);
        };
        let names = branch_names(&cascade, &source);

        let open_prs = self.host.list_open_pull_requests()?;
        for child in open_prs.iter().filter(|p| names.contains(&p.src_branch)) {
            if let Err(err) = self.host.decline_pull_request(child.id) {
                warn!(child = %child.id, %err, "could not decline integration pull request");
            }
        }
        let mut engine = IntegrationEngine::new(self.workspace);
        engine.reset(&cascade, &source, true)?;
        Err(EvalError::NothingToDo)
    }

    fn check_forward_propagation(&mut self, refs: &CascadeSet) -> Result<(), EvalError> {
        let pairs: Vec<(String, String)> = refs
            .development_pairs()
            .iter()
            .map(|(older, newer)| (older.name.clone(), newer.name.clone()))
            .collect();
        for (older, newer) in pairs {
            if !self.workspace.includes_commit(&newer, &older)? {
                return Err(EvalError::IncoherentCascade { older, newer });
            }
        }
        Ok(())
    }

    /// Checks the queues and fast-forwards the destinations to the most
    /// recent green prefix. Returns the promoted PRs.
    #[instrument(skip(self))]
    pub fn handle_queues(&mut self, force: bool) -> Result<Vec<PrId>, EvalError> {
        self.workspace.sync()?;
        let refs = self.cascade_set()?;
        let queues = QueueCollection::build(self.workspace, &refs)?;
        self.merge_queues(&refs, queues, force)
    }

    fn merge_queues(
        &mut self,
        refs: &CascadeSet,
        queues: QueueCollection,
        force: bool,
    ) -> Result<Vec<PrId>, EvalError> {
        if queues.is_empty() {
            return Ok(Vec::new());
        }
        let issues = queues.validate(self.workspace)?;
        if !issues.is_empty() {
            return Err(EvalError::IncoherentQueues(format!("{:?}", issues)));
        }

        let mut statuses = HashMap::new();
        for item in queues.items() {
            let status = if self.settings.build_key.is_empty() {
                crate::hosting::BuildStatus::Successful
            } else {
                self.host
                    .get_build_status(&item.tip, &self.settings.build_key)?
            };
            statuses.insert(item.tip.clone(), status);
        }

        let failed: Vec<(PrId, String, Sha)> = queues
            .failed_items(&statuses)
            .into_iter()
            .map(|item| (item.pr, item.branch.clone(), item.tip.clone()))
            .collect();
        for (pr, branch, commit) in failed {
            let message = Message::BuildFailed { branch, commit };
            self.post(pr, &message, &EffectiveOptions::default())?;
        }

        let mergeable = if force {
            queues.queued_prs()
        } else {
            queues.mergeable_prs(&statuses)
        };
        if mergeable.is_empty() {
            return Ok(Vec::new());
        }

        let promotion = queue::promote(self.workspace, &queues, &mergeable)?;
        for pr in &promotion.merged_prs {
            self.notify_merged(*pr, refs)?;
        }
        Ok(promotion.merged_prs)
    }

    /// Tells a promoted PR whether everything it had was merged, and
    /// removes its integration branches.
    fn notify_merged(&mut self, id: PrId, refs: &CascadeSet) -> Result<(), EvalError> {
        let pr = match self.host.get_pull_request(id) {
            Ok(pr) => pr,
            Err(HostError::PrNotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let Ok(source) = SourceBranch::parse(&pr.src_branch, &self.settings.bypass_prefixes)
        else {
            return Ok(());
        };
        let Ok(cascade) = refs.finalize(&pr.dst_branch, &source.prefix) else {
            return Ok(());
        };

        let fully_merged = match self.workspace.branch_tip(&source.name) {
            Ok(tip) => self
                .workspace
                .includes_commit(&pr.dst_branch, tip.as_str())?,
            // source already deleted: nothing could have been left behind
            Err(_) => true,
        };

        if fully_merged {
            let message = Message::SuccessfulMerge {
                branches: cascade.branch_names(),
                ignored: cascade.ignored.clone(),
                issue: source.issue_key.as_ref().map(|k| k.key.clone()),
            };
            self.post(id, &message, &EffectiveOptions::default())?;
        } else {
            // posterior commits restart the process from the beginning
            let commits = self.workspace.commit_diff(&source.name, &pr.dst_branch)?;
            let message = Message::PartialMerge {
                commits,
                branches: cascade.branch_names(),
            };
            self.post(id, &message, &EffectiveOptions::default())?;
        }

        let names = branch_names(&cascade, &source);
        let refs_to_delete: Vec<&str> = names.iter().map(String::as_str).collect();
        self.workspace.delete_remote_branches(&refs_to_delete)?;
        for name in &names {
            self.workspace.delete_local_branch(name)?;
        }
        Ok(())
    }

    /// Deletes every queue branch and returns the PRs to re-evaluate
    /// (those carrying the `wait` option are skipped).
    #[instrument(skip(self))]
    pub fn rebuild_queues(&mut self) -> Result<Vec<PrId>, EvalError> {
        self.workspace.sync()?;
        let refs = self.cascade_set()?;
        let queues = QueueCollection::build(self.workspace, &refs)?;
        let queued = queues.queued_prs();
        queue::delete_all(self.workspace, &queues)?;

        let mut to_requeue = Vec::new();
        for id in queued {
            let waiting = match self.host.get_pull_request(id) {
                Ok(pr) => {
                    let comments = self.host.list_comments(id)?;
                    scan_comments(&comments, self.settings, &pr.author)
                        .map(|scan| scan.options.wait)
                        .unwrap_or(false)
                }
                Err(HostError::PrNotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            if waiting {
                info!(pr = %id, "skipping waiting pull request during rebuild");
            } else {
                to_requeue.push(id);
            }
        }
        Ok(to_requeue)
    }

    /// Wipes the queues without re-evaluating anything.
    pub fn delete_queues(&mut self) -> Result<(), EvalError> {
        self.workspace.sync()?;
        let refs = self.cascade_set()?;
        let queues = QueueCollection::build(self.workspace, &refs)?;
        queue::delete_all(self.workspace, &queues)?;
        Ok(())
    }

    /// Routes a build-status event: a queue tip drives the queues, an
    /// integration or source tip drives its pull request.
    #[instrument(skip(self, commit), fields(commit = %commit))]
    pub fn handle_commit(&mut self, commit: &Sha) -> Result<(), EvalError> {
        self.workspace.sync()?;
        let heads: Vec<(String, Sha)> = self
            .workspace
            .remote_heads()?
            .iter()
            .map(|(name, sha)| (name.clone(), sha.clone()))
            .collect();

        if heads
            .iter()
            .any(|(name, tip)| tip == commit && name.starts_with("q/"))
        {
            self.handle_queues(false)?;
            return Ok(());
        }

        for (name, tip) in &heads {
            if tip != commit {
                continue;
            }
            let source_name = IntegrationRef::parse(name)
                .map(|w| w.source)
                .unwrap_or_else(|| name.clone());
            let target = self
                .host
                .list_open_pull_requests()?
                .into_iter()
                .find(|pr| pr.src_branch == source_name);
            if let Some(pr) = target {
                self.handle_pull_request(pr.id)?;
                return Ok(());
            }
        }
        Err(EvalError::NothingToDo)
    }

    /// Creates a destination branch (API-driven).
    pub fn create_destination(&mut self, branch: &str, from: &str) -> Result<(), EvalError> {
        if DestinationBranch::parse(branch).is_none() {
            return Err(EvalError::InvalidRequest(format!(
                "{} is not a destination branch name",
                branch
            )));
        }
        self.workspace.sync()?;
        if self.workspace.remote_branch_exists(branch)? {
            return Err(EvalError::InvalidRequest(format!(
                "{} already exists",
                branch
            )));
        }
        self.workspace.create_branch(branch, from)?;
        self.workspace.push(&[branch], false)?;
        info!(branch, from, "created destination branch");
        Ok(())
    }

    /// Deletes a destination branch, leaving an immutable tag in its
    /// place. Refused while the destination has queued content.
    pub fn delete_destination(&mut self, branch: &str) -> Result<(), EvalError> {
        let Some(destination) = DestinationBranch::parse(branch) else {
            return Err(EvalError::InvalidRequest(format!(
                "{} is not a destination branch name",
                branch
            )));
        };
        self.workspace.sync()?;
        if !self.workspace.remote_branch_exists(branch)? {
            return Err(EvalError::InvalidRequest(format!("{} does not exist", branch)));
        }
        let refs = self.cascade_set()?;
        let queues = QueueCollection::build(self.workspace, &refs)?;
        if queues
            .items()
            .any(|item| item.version == destination.version)
        {
            return Err(EvalError::InvalidRequest(format!(
                "{} has queued pull requests",
                branch
            )));
        }
        self.workspace
            .tag(&destination.version.to_string(), branch)?;
        self.workspace.delete_remote_branches(&[branch])?;
        info!(branch, "deleted destination branch");
        Ok(())
    }
}

fn permitted_prefixes(settings: &RepositorySettings) -> Vec<String> {
    let mut allowed: Vec<String> = [
        "feature",
        "bugfix",
        "improvement",
        "project",
        "documentation",
        "design",
        "epic",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    allowed.extend(settings.bypass_prefixes.iter().cloned());
    allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosting::{BuildStatus, InMemoryHost, ReviewVerdict};
    use crate::messenger::parse_marker;
    use crate::queue::QueueCollection;
    use crate::test_utils::GitFixture;
    use crate::tracker::InMemoryTracker;
    use crate::types::Sha;

    /// End-to-end harness: a real git origin, the in-memory host, and the
    /// bot evaluating against both.
    struct Scenario {
        fixture: GitFixture,
        host: InMemoryHost,
        tracker: Option<InMemoryTracker>,
        settings: RepositorySettings,
    }

    impl Scenario {
        fn new() -> Self {
            Scenario {
                fixture: GitFixture::new(),
                host: InMemoryHost::new(),
                tracker: None,
                settings: RepositorySettings {
                    repository_owner: "acme".to_string(),
                    repository_slug: "widget".to_string(),
                    robot: "robot".to_string(),
                    robot_email: "waterflow@localhost".to_string(),
                    admins: vec!["admin".to_string()],
                    required_peer_approvals: 2,
                    ..Default::default()
                },
            }
        }

        /// Opens a PR whose source branch carries one commit.
        fn open_pr(&mut self, author: &str, source: &str, destination: &str) -> PrId {
            let tip = self
                .fixture
                .commit_on(source, &format!("{}.txt", source.replace('/', "-")), "change");
            self.host.open_pull_request(author, source, destination, tip)
        }

        /// Author plus two peers approve.
        fn approve(&mut self, pr: PrId, author: &str) {
            self.host.add_review(pr, author, ReviewVerdict::Approved);
            self.host.add_review(pr, "carol", ReviewVerdict::Approved);
            self.host.add_review(pr, "dave", ReviewVerdict::Approved);
        }

        fn run_pr(&mut self, pr: PrId) -> Result<Option<u16>, EvalError> {
            let mut workspace = self.fixture.workspace();
            let tracker = self.tracker.as_ref().map(|t| t as &dyn IssueTracker);
            let mut bot = Bot::new(&self.settings, &mut self.host, tracker, &mut workspace);
            bot.handle_pull_request(pr)
        }

        fn run_queues(&mut self) -> Result<Vec<PrId>, EvalError> {
            let mut workspace = self.fixture.workspace();
            let tracker = self.tracker.as_ref().map(|t| t as &dyn IssueTracker);
            let mut bot = Bot::new(&self.settings, &mut self.host, tracker, &mut workspace);
            bot.handle_queues(false)
        }

        fn rebuild(&mut self) -> Result<Vec<PrId>, EvalError> {
            let mut workspace = self.fixture.workspace();
            let tracker = self.tracker.as_ref().map(|t| t as &dyn IssueTracker);
            let mut bot = Bot::new(&self.settings, &mut self.host, tracker, &mut workspace);
            bot.rebuild_queues()
        }

        fn set_green(&mut self, branch: &str) {
            let tip = self.fixture.tip(branch);
            self.host
                .set_build_status(&tip, &self.settings.build_key.clone(), BuildStatus::Successful);
        }

        /// Marks every queue-item tip of `pr` with `status`.
        fn set_queue_status(&mut self, pr: PrId, status: BuildStatus) {
            let mut workspace = self.fixture.workspace();
            let names = workspace.remote_branch_names().unwrap();
            let refs = CascadeSet::from_refs(names.iter().map(String::as_str), []);
            let queues = QueueCollection::build(&mut workspace, &refs).unwrap();
            let tips: Vec<Sha> = queues
                .items()
                .filter(|item| item.pr == pr)
                .map(|item| item.tip.clone())
                .collect();
            let key = self.settings.build_key.clone();
            for tip in tips {
                self.host.set_build_status(&tip, &key, status);
            }
        }

        /// Status codes posted on the PR, oldest first.
        fn codes(&self, pr: PrId) -> Vec<u16> {
            self.host
                .comments_of(pr)
                .iter()
                .filter_map(|c| parse_marker(&c.text))
                .map(|m| m.code)
                .collect()
        }
    }

    #[test]
    fn green_path_queues_and_merges_forward() {
        let mut scenario = Scenario::new();
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-x", "development/1.0");
        scenario.approve(pr, "bob");

        // first evaluation: integration branches created, builds pending
        assert!(matches!(scenario.run_pr(pr), Ok(None)));
        assert_eq!(scenario.codes(pr), vec![100, 121]);
        assert!(scenario.fixture.branch_exists("w/2.0/bugfix/PROJ-1-x"));

        // the integration branch builds green: the PR enters the queue
        scenario.set_green("w/2.0/bugfix/PROJ-1-x");
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(125));

        // queue builds green: promotion closes the PR
        scenario.set_queue_status(pr, BuildStatus::Successful);
        assert_eq!(scenario.run_queues().unwrap(), vec![pr]);

        let codes = scenario.codes(pr);
        assert!(codes.contains(&121));
        assert!(codes.contains(&102));
        assert!(scenario.fixture.origin_includes("development/1.0", "bugfix/PROJ-1-x"));
        assert!(scenario.fixture.origin_includes("development/2.0", "bugfix/PROJ-1-x"));
        // forward propagation: no divergence between the lines
        assert!(scenario.fixture.origin_includes("development/2.0", "development/1.0"));
        // integration branches were cleaned up
        assert!(!scenario.fixture.branch_exists("w/2.0/bugfix/PROJ-1-x"));
    }

    #[test]
    fn forward_conflict_is_fixed_on_the_feature_branch() {
        let mut scenario = Scenario::new();
        scenario
            .fixture
            .commit_on("development/2.0", "shared.txt", "newer line content");
        let pr = scenario.open_pr("bob", "bugfix/PROJ-2-y", "development/1.0");
        scenario
            .fixture
            .commit_on("bugfix/PROJ-2-y", "shared.txt", "conflicting content");
        scenario.approve(pr, "bob");

        assert_eq!(scenario.run_pr(pr).unwrap(), Some(114));
        let conflict_comment = scenario
            .host
            .comments_of(pr)
            .iter()
            .find(|c| parse_marker(&c.text).is_some_and(|m| m.code == 114))
            .unwrap()
            .text
            .clone();
        assert!(conflict_comment.contains("feature branch"));

        // the user resolves the conflict on the feature branch
        scenario.fixture.merge_resolving(
            "bugfix/PROJ-2-y",
            "development/2.0",
            "shared.txt",
            "resolved content",
        );
        let tip = scenario.fixture.tip("bugfix/PROJ-2-y");
        scenario.host.set_src_commit(pr, tip);

        assert!(matches!(scenario.run_pr(pr), Ok(None)));
        assert!(scenario.codes(pr).contains(&121));

        scenario.set_green("w/2.0/bugfix/PROJ-2-y");
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(125));
        scenario.set_queue_status(pr, BuildStatus::Successful);
        assert_eq!(scenario.run_queues().unwrap(), vec![pr]);
        assert!(scenario.codes(pr).contains(&102));
    }

    #[test]
    fn queue_promotes_only_the_green_prefix() {
        let mut scenario = Scenario::new();
        let mut prs = Vec::new();
        for source in ["bugfix/PROJ-1-a", "bugfix/PROJ-2-b", "bugfix/PROJ-3-c"] {
            let pr = scenario.open_pr("bob", source, "development/1.0");
            scenario.approve(pr, "bob");
            assert!(matches!(scenario.run_pr(pr), Ok(None)));
            scenario.set_green(&format!("w/2.0/{}", source));
            assert_eq!(scenario.run_pr(pr).unwrap(), Some(125));
            prs.push(pr);
        }
        let (a, b, c) = (prs[0], prs[1], prs[2]);

        scenario.set_queue_status(a, BuildStatus::Successful);
        scenario.set_queue_status(b, BuildStatus::Failed);
        scenario.set_queue_status(c, BuildStatus::Failed);

        assert_eq!(scenario.run_queues().unwrap(), vec![a]);

        // A merged, B and C remain queued with a build-failure notice
        assert!(scenario.codes(a).contains(&102));
        assert!(scenario.fixture.origin_includes("development/1.0", "bugfix/PROJ-1-a"));
        assert!(!scenario.fixture.origin_includes("development/1.0", "bugfix/PROJ-2-b"));

        let mut workspace = scenario.fixture.workspace();
        let names = workspace.remote_branch_names().unwrap();
        let refs = CascadeSet::from_refs(names.iter().map(String::as_str), []);
        let queues = QueueCollection::build(&mut workspace, &refs).unwrap();
        assert!(queues.is_queued(b));
        assert!(queues.is_queued(c));
        assert!(!queues.is_queued(a));
        // the failing tip was reported with code 118
        assert!(scenario.codes(c).contains(&118));
    }

    #[test]
    fn out_of_order_queue_suppresses_promotion_and_rebuilds() {
        let mut scenario = Scenario::new();
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-a", "development/1.0");
        scenario.approve(pr, "bob");
        assert!(matches!(scenario.run_pr(pr), Ok(None)));
        scenario.set_green("w/2.0/bugfix/PROJ-1-a");
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(125));

        // a manual push on a lane breaks the ancestry
        scenario.fixture.commit_on("q/2.0", "rogue.txt", "manual");
        scenario.set_queue_status(pr, BuildStatus::Successful);

        let before = scenario.fixture.tip("development/1.0");
        assert!(matches!(
            scenario.run_queues(),
            Err(EvalError::IncoherentQueues(_))
        ));
        assert_eq!(scenario.fixture.tip("development/1.0"), before);

        // a re-evaluation of the queued PR reports the queues out of order
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(127));

        // the rebuild wipes the queues and re-admits the PR
        let to_requeue = scenario.rebuild().unwrap();
        assert_eq!(to_requeue, vec![pr]);
        assert!(!scenario.fixture.branch_exists("q/2.0"));
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(125));
        assert!(scenario.fixture.branch_exists("q/2.0"));
    }

    #[test]
    fn waiting_prs_are_skipped_by_the_rebuild() {
        let mut scenario = Scenario::new();
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-a", "development/1.0");
        scenario.approve(pr, "bob");
        assert!(matches!(scenario.run_pr(pr), Ok(None)));
        scenario.set_green("w/2.0/bugfix/PROJ-1-a");
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(125));

        scenario.host.add_comment(pr, "bob", "@robot wait");
        assert_eq!(scenario.rebuild().unwrap(), Vec::<PrId>::new());
        assert!(!scenario.fixture.branch_exists("q/2.0"));
    }

    #[test]
    fn bypass_by_the_author_is_not_authorized() {
        let mut scenario = Scenario::new();
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-a", "development/1.0");
        scenario.host.add_comment(pr, "bob", "@robot bypass_build_status");

        assert_eq!(scenario.run_pr(pr).unwrap(), Some(123));
        // no state change: no integration branches, nothing queued
        assert!(!scenario.fixture.branch_exists("w/2.0/bugfix/PROJ-1-a"));
        assert!(!scenario.fixture.branch_exists("q/1.0"));
    }

    #[test]
    fn reset_with_a_user_commit_requires_force() {
        let mut scenario = Scenario::new();
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-a", "development/1.0");
        scenario.approve(pr, "bob");
        assert!(matches!(scenario.run_pr(pr), Ok(None)));

        // a user pushes directly on the integration branch
        scenario
            .fixture
            .commit_on("w/2.0/bugfix/PROJ-1-a", "direct.txt", "user work");

        scenario.host.add_comment(pr, "bob", "@robot reset");
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(129));
        assert!(scenario.fixture.branch_exists("w/2.0/bugfix/PROJ-1-a"));

        scenario.host.add_comment(pr, "bob", "@robot force_reset");
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(128));
        assert!(!scenario.fixture.branch_exists("w/2.0/bugfix/PROJ-1-a"));
    }

    #[test]
    fn evaluation_is_idempotent_on_an_unchanged_repository() {
        let mut scenario = Scenario::new();
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-a", "development/1.0");

        // missing approvals block with code 115
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(115));
        let comments_after_first = scenario.host.comments_of(pr).len();

        // same snapshot, same verdict, no new comment
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(115));
        assert_eq!(scenario.host.comments_of(pr).len(), comments_after_first);

        // exactly one greeting was ever posted
        let greetings = scenario.codes(pr).iter().filter(|c| **c == 100).count();
        assert_eq!(greetings, 1);
    }

    #[test]
    fn unknown_destination_is_not_my_job() {
        let mut scenario = Scenario::new();
        let tip = scenario.fixture.commit_on("feature/x", "x.txt", "x");
        let pr = scenario
            .host
            .open_pull_request("bob", "feature/x", "main", tip);
        assert!(matches!(scenario.run_pr(pr), Err(EvalError::NotMyJob)));
        assert!(scenario.codes(pr).is_empty());
    }

    #[test]
    fn incorrect_prefix_is_reported() {
        let mut scenario = Scenario::new();
        let tip = scenario.fixture.commit_on("wip/stuff", "x.txt", "x");
        let pr = scenario
            .host
            .open_pull_request("bob", "wip/stuff", "development/1.0", tip);
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(105));
    }

    #[test]
    fn declined_pr_cleans_up_integration_branches() {
        let mut scenario = Scenario::new();
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-a", "development/1.0");
        scenario.approve(pr, "bob");
        assert!(matches!(scenario.run_pr(pr), Ok(None)));
        assert!(scenario.fixture.branch_exists("w/2.0/bugfix/PROJ-1-a"));

        scenario.host.set_state(pr, crate::hosting::PrState::Declined);
        assert!(matches!(scenario.run_pr(pr), Err(EvalError::NothingToDo)));
        assert!(!scenario.fixture.branch_exists("w/2.0/bugfix/PROJ-1-a"));
    }

    #[test]
    fn source_pushed_after_queueing_is_a_partial_merge() {
        let mut scenario = Scenario::new();
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-a", "development/1.0");
        scenario.approve(pr, "bob");
        assert!(matches!(scenario.run_pr(pr), Ok(None)));
        scenario.set_green("w/2.0/bugfix/PROJ-1-a");
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(125));
        scenario.set_queue_status(pr, BuildStatus::Successful);

        // the author pushes another commit after queueing
        scenario
            .fixture
            .commit_on("bugfix/PROJ-1-a", "late.txt", "late change");

        assert_eq!(scenario.run_queues().unwrap(), vec![pr]);
        assert!(scenario.codes(pr).contains(&126));
        // the late commit did not reach the destination
        assert!(!scenario.fixture.origin_includes("development/1.0", "bugfix/PROJ-1-a"));
    }

    #[test]
    fn rebased_source_clamps_commit_distance_to_zero() {
        let mut scenario = Scenario::new();
        scenario.settings.max_commit_diff = 1;

        // the branch is observed with three commits
        scenario.fixture.commit_on("bugfix/PROJ-1-a", "a.txt", "v1");
        scenario.fixture.commit_on("bugfix/PROJ-1-a", "b.txt", "v1");
        let old_tip = scenario.fixture.commit_on("bugfix/PROJ-1-a", "c.txt", "v1");
        // the pre-rebase tip stays fetchable, as a host's PR refs keep it
        scenario
            .fixture
            .create_branch("user/pre-rebase", "bugfix/PROJ-1-a");
        let pr = scenario
            .host
            .open_pull_request("bob", "bugfix/PROJ-1-a", "development/1.0", old_tip);

        // the author squash-rebases onto the destination...
        scenario
            .fixture
            .rebase_onto("bugfix/PROJ-1-a", "development/1.0", "squashed.txt", "v2");
        // ...and the destination then gains two commits of its own
        scenario.fixture.commit_on("development/1.0", "d1.txt", "d1");
        scenario.fixture.commit_on("development/1.0", "d2.txt", "d2");
        scenario.fixture.merge_resolving(
            "development/2.0",
            "development/1.0",
            "unused.txt",
            "unused",
        );

        // naively the source is 2 commits behind (over the limit of 1),
        // but the stale observation makes the signed distance negative;
        // it is clamped instead of reporting a divergence, so the
        // evaluation reaches the approvals check
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(115));
    }

    #[test]
    fn help_command_answers_with_the_manual() {
        let mut scenario = Scenario::new();
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-a", "development/1.0");
        scenario.host.add_comment(pr, "bob", "@robot help");
        assert_eq!(scenario.run_pr(pr).unwrap(), Some(101));
    }

    #[test]
    fn after_pull_request_blocks_until_dependency_merges() {
        let mut scenario = Scenario::new();
        let dep = scenario.open_pr("bob", "bugfix/PROJ-9-dep", "development/1.0");
        let pr = scenario.open_pr("bob", "bugfix/PROJ-1-a", "development/1.0");
        scenario.approve(pr, "bob");
        scenario
            .host
            .add_comment(pr, "bob", &format!("@robot after_pull_request={}", dep.0));

        assert_eq!(scenario.run_pr(pr).unwrap(), Some(120));

        scenario.host.set_state(dep, crate::hosting::PrState::Merged);
        // with the dependency merged the PR proceeds to integration
        assert!(matches!(scenario.run_pr(pr), Ok(None)));
        assert!(scenario.codes(pr).contains(&121));
    }
}
