//! Integration-branch engine.
//!
//! For every destination after the PR's own target, the bot owns a
//! `w/<version>/<source>` branch whose tip is the merge of the source
//! branch, the destination, and the previous integration branch. The first
//! integration target plays a special role: the source branch itself acts
//! as its predecessor, and a conflict against it must be fixed on the
//! feature branch (not on robot-owned branches).
//!
//! Users never rebase integration branches; conflict-resolution commits
//! pushed onto them are preserved across updates.

use thiserror::Error;
use tracing::{debug, info};

use crate::branches::{DestinationBranch, SourceBranch, integration_branch_name};
use crate::cascade::Cascade;
use crate::git::{GitError, MergeOutcome, Workspace};
use crate::types::Sha;

/// Errors from the integration engine. Everything user-facing (conflicts,
/// history mismatches) is reported as data, not as an error.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error(transparent)]
    Git(#[from] GitError),
}

/// One materialized integration branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationBranchState {
    pub name: String,
    pub destination: DestinationBranch,
    pub tip: Sha,
    /// True when this update created the branch.
    pub created: bool,
}

/// Result of creating/updating the integration branches of a cascade.
#[derive(Debug)]
pub enum UpdateResult {
    Updated {
        branches: Vec<IntegrationBranchState>,
        created_any: bool,
        /// Whether every integration branch already contained its
        /// predecessor's tip before this update ran.
        in_sync_before: bool,
        pushed: bool,
    },

    /// The first integration branch carries a commit that comes neither
    /// from the source branch nor from the robot.
    HistoryMismatch { commit: Sha, branch: String },

    /// A merge stopped on a conflict.
    Conflict {
        /// What was being merged when the conflict occurred.
        source: String,
        branch: String,
        /// True when the conflict is on the first integration target, in
        /// which case the resolution belongs on the feature branch.
        on_first: bool,
    },
}

/// Result of a `reset`.
#[derive(Debug, PartialEq, Eq)]
pub enum ResetResult {
    /// No integration branch existed.
    NothingToDo,
    /// Non-robot commits would be lost; refused without `force_reset`.
    LossyRefused,
    /// Branches removed.
    Done { removed: Vec<String> },
}

/// Names of the integration branches of a cascade, oldest target first.
pub fn branch_names(cascade: &Cascade, source: &SourceBranch) -> Vec<String> {
    cascade
        .forward()
        .iter()
        .map(|d| integration_branch_name(&d.version, &source.name))
        .collect()
}

/// The integration engine operates on the single git workspace.
pub struct IntegrationEngine<'a> {
    workspace: &'a mut Workspace,
    robot_email: String,
}

impl<'a> IntegrationEngine<'a> {
    pub fn new(workspace: &'a mut Workspace) -> Self {
        let robot_email = workspace.identity().email.clone();
        IntegrationEngine {
            workspace,
            robot_email,
        }
    }

    /// Creates missing integration branches and merges the new tips of the
    /// source and destinations through the cascade.
    ///
    /// `no_octopus` forces consecutive two-way merges; `skip_push_in_sync`
    /// suppresses the push when nothing new would reach CI (queue mode
    /// keeps the branches as they are to avoid rebuilding green tips).
    pub fn update(
        &mut self,
        cascade: &Cascade,
        source: &SourceBranch,
        no_octopus: bool,
        skip_push_in_sync: bool,
    ) -> Result<UpdateResult, IntegrationError> {
        let mut branches = Vec::new();
        let mut created_any = false;

        // Materialize local branches, from the remote copy when it exists.
        for destination in cascade.forward() {
            let name = integration_branch_name(&destination.version, &source.name);
            let created = !self.workspace.remote_branch_exists(&name)?;
            let start = if created {
                destination.name.clone()
            } else {
                name.clone()
            };
            self.workspace.create_branch(&name, &start)?;
            created_any |= created;
            branches.push(IntegrationBranchState {
                tip: self.workspace.rev_parse("HEAD")?,
                name,
                destination: destination.clone(),
                created,
            });
        }

        if branches.is_empty() {
            return Ok(UpdateResult::Updated {
                branches,
                created_any: false,
                in_sync_before: true,
                pushed: false,
            });
        }

        if let Some(mismatch) = self.history_mismatch(&branches[0], source)? {
            return Ok(UpdateResult::HistoryMismatch {
                commit: mismatch,
                branch: branches[0].name.clone(),
            });
        }

        let in_sync_before = self.in_sync(&branches, source)?;

        // Merge source and destination tips down the cascade.
        let mut previous = source.name.clone();
        for (index, state) in branches.iter_mut().enumerate() {
            self.workspace.checkout(&state.name)?;
            let revs = [state.destination.name.as_str(), previous.as_str()];
            let outcome = if no_octopus {
                self.workspace.consecutive_merge(&revs)?
            } else {
                self.workspace.robust_merge(&revs)?
            };
            if let MergeOutcome::Conflict { conflicting_files } = outcome {
                debug!(branch = %state.name, ?conflicting_files, "integration conflict");
                return Ok(UpdateResult::Conflict {
                    source: previous,
                    branch: state.name.clone(),
                    on_first: index == 0,
                });
            }
            state.tip = self.workspace.rev_parse("HEAD")?;
            previous = state.name.clone();
        }

        // Do not push branches that would only repeat their destination:
        // an empty integration branch pointing at development/x.y would
        // trigger a useless build.
        let pushed = if skip_push_in_sync && in_sync_before && !created_any {
            false
        } else {
            let mut to_push = Vec::new();
            for state in &branches {
                let remote = self.workspace.remote_heads()?.get(&state.name).cloned();
                if remote.as_ref() != Some(&state.tip)
                    && !self.workspace.commit_diff(&state.name, &state.destination.name)?.is_empty()
                {
                    to_push.push(state.name.clone());
                }
            }
            if to_push.is_empty() {
                false
            } else {
                let refs: Vec<&str> = to_push.iter().map(String::as_str).collect();
                self.workspace.push(&refs, true)?;
                info!(branches = ?to_push, "pushed integration branches");
                true
            }
        };

        Ok(UpdateResult::Updated {
            branches,
            created_any,
            in_sync_before,
            pushed,
        })
    }

    /// Scans the first integration branch for commits that come neither
    /// from the source branch nor from the robot itself.
    fn history_mismatch(
        &mut self,
        first: &IntegrationBranchState,
        source: &SourceBranch,
    ) -> Result<Option<Sha>, IntegrationError> {
        if first.created {
            return Ok(None);
        }
        for commit in self
            .workspace
            .commit_diff(&first.name, &first.destination.name)?
        {
            if self.workspace.includes_commit(&source.name, commit.as_str())? {
                continue;
            }
            if self.workspace.commit_author_email(&commit)? == self.robot_email {
                continue;
            }
            return Ok(Some(commit));
        }
        Ok(None)
    }

    /// Whether each integration branch already contains the tip of its
    /// predecessor (the source branch for the first one).
    fn in_sync(
        &mut self,
        branches: &[IntegrationBranchState],
        source: &SourceBranch,
    ) -> Result<bool, IntegrationError> {
        let mut previous = source.name.clone();
        for state in branches {
            let tip = self.workspace.branch_tip(&previous)?;
            if !self.workspace.includes_commit(&state.name, tip.as_str())? {
                return Ok(false);
            }
            previous = state.name.clone();
        }
        Ok(true)
    }

    /// Deletes the integration branches of a cascade.
    ///
    /// Commits on them that come neither from the source branch nor from
    /// the robot would be lost; without `force`, the reset is refused.
    pub fn reset(
        &mut self,
        cascade: &Cascade,
        source: &SourceBranch,
        force: bool,
    ) -> Result<ResetResult, IntegrationError> {
        let mut existing = Vec::new();
        for name in branch_names(cascade, source) {
            if self.workspace.remote_branch_exists(&name)? {
                existing.push(name);
            }
        }
        if existing.is_empty() {
            return Ok(ResetResult::NothingToDo);
        }

        if !force {
            for (name, destination) in existing.iter().zip(cascade.forward()) {
                for commit in self.workspace.commit_diff(name, &destination.name)? {
                    if self.workspace.includes_commit(&source.name, commit.as_str())? {
                        continue;
                    }
                    if self.workspace.commit_author_email(&commit)? != self.robot_email {
                        return Ok(ResetResult::LossyRefused);
                    }
                }
            }
        }

        let refs: Vec<&str> = existing.iter().map(String::as_str).collect();
        self.workspace.delete_remote_branches(&refs)?;
        for name in &existing {
            self.workspace.delete_local_branch(name)?;
        }
        info!(branches = ?existing, "reset integration branches");
        Ok(ResetResult::Done { removed: existing })
    }

    /// Direct-merge path (queues disabled): merge the source branch into
    /// the target and every integration branch into its destination, push
    /// all destinations atomically, then drop the integration branches.
    pub fn merge_cascade(
        &mut self,
        cascade: &Cascade,
        source: &SourceBranch,
    ) -> Result<(), IntegrationError> {
        let target = cascade.target();
        self.workspace.checkout(&target.name)?;
        self.merge_clean(&source.name, &target.name)?;

        let names = branch_names(cascade, source);
        for (name, destination) in names.iter().zip(cascade.forward()) {
            self.workspace.checkout(&destination.name)?;
            self.merge_clean(name, &destination.name)?;
        }

        let destinations: Vec<&str> = cascade
            .destinations
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        self.workspace.push(&destinations, false)?;

        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.workspace.delete_remote_branches(&refs)?;
        for name in &names {
            self.workspace.delete_local_branch(name)?;
        }
        Ok(())
    }

    fn merge_clean(&mut self, rev: &str, onto: &str) -> Result<(), IntegrationError> {
        match self.workspace.merge(rev)? {
            MergeOutcome::Conflict { conflicting_files } => Err(IntegrationError::Git(
                GitError::CommandFailed {
                    command: format!("merge {} into {}", rev, onto),
                    stderr: format!(
                        "unexpected conflict on validated branches: {:?}",
                        conflicting_files
                    ),
                },
            )),
            _ => Ok(()),
        }
    }
}
