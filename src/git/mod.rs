//! Local git workspace.
//!
//! The bot works in a cached clone of the repository. Every job starts by
//! syncing the clone against the remote; branches are then manipulated as
//! local branches and pushed back explicitly. Remote heads are read through
//! an ls-remote cache that is invalidated on every sync or push.
//!
//! All commands run with a clean environment (no system or user git config)
//! so behavior is reproducible across machines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{RepoId, Sha};

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Git command failed.
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Push was rejected (non-fast-forward or stale lease).
    #[error("push rejected: {details}")]
    PushRejected { details: String },

    /// A ref that was expected to exist does not.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// Invalid SHA in command output.
    #[error("invalid SHA in git output: {0}")]
    InvalidSha(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Result of a merge operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merge completed, possibly as a fast-forward.
    Merged,

    /// Merge was a no-op (already up-to-date).
    AlreadyUpToDate,

    /// Merge stopped on conflicting files; the merge has been aborted.
    Conflict { conflicting_files: Vec<String> },
}

impl MergeOutcome {
    /// True when the merge completed without conflict.
    pub fn is_clean(&self) -> bool {
        !matches!(self, MergeOutcome::Conflict { .. })
    }
}

/// Identity used for creating merge commits.
///
/// Passed via `-c` flags so commits can be created even with global git
/// config disabled.
#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

/// Configuration for the git workspace.
#[derive(Debug, Clone)]
pub struct GitConfig {
    /// Base directory for all cached clones.
    pub base_dir: PathBuf,

    /// The repository this workspace mirrors.
    pub repo: RepoId,

    /// URL of the remote.
    pub remote_url: String,

    /// Identity for the bot's merge commits.
    pub identity: CommitIdentity,
}

impl GitConfig {
    /// Path of the cached clone for this repository.
    pub fn clone_dir(&self) -> PathBuf {
        self.base_dir
            .join(format!("{}-{}", self.repo.owner, self.repo.slug))
    }
}

/// A synced working clone of the repository.
///
/// The workspace is the single writer for the repository; the dispatcher
/// guarantees one job holds it at a time.
pub struct Workspace {
    config: GitConfig,
    workdir: PathBuf,
    ls_remote_cache: Option<BTreeMap<String, Sha>>,
}

impl Workspace {
    /// Opens the cached clone, creating it on first use, and syncs it
    /// against the remote.
    pub fn open(config: GitConfig) -> GitResult<Self> {
        let workdir = config.clone_dir();
        if !workdir.join(".git").exists() {
            std::fs::create_dir_all(&workdir)?;
            let parent = workdir
                .parent()
                .ok_or_else(|| GitError::RefNotFound("clone dir has no parent".to_string()))?;
            run_git(
                parent,
                &[
                    "clone",
                    &config.remote_url,
                    workdir.to_str().unwrap_or_default(),
                ],
            )?;
        }
        let mut workspace = Workspace {
            config,
            workdir,
            ls_remote_cache: None,
        };
        workspace.sync()?;
        Ok(workspace)
    }

    /// Fetches the remote, pruning deleted branches, and drops every local
    /// branch back onto its remote counterpart. Invalidates the ls-remote
    /// cache.
    pub fn sync(&mut self) -> GitResult<()> {
        run_git(
            &self.workdir,
            &["fetch", "--prune", "--tags", "--force", "origin"],
        )?;
        // Detach so local branches can be deleted and re-created freely.
        // An empty repository has nothing to detach to; that is fine.
        if let Err(err) = run_git(&self.workdir, &["checkout", "--detach", "--quiet"]) {
            debug!(%err, "nothing to detach from");
        }
        let local = self.stdout(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        for branch in local.lines().filter(|l| !l.is_empty()) {
            run_git(&self.workdir, &["branch", "--delete", "--force", branch])?;
        }
        self.ls_remote_cache = None;
        Ok(())
    }

    /// Remote heads, `branch name -> tip`, read once per sync/push.
    pub fn remote_heads(&mut self) -> GitResult<&BTreeMap<String, Sha>> {
        if self.ls_remote_cache.is_none() {
            let out = self.stdout(&["ls-remote", "--heads", "origin"])?;
            let mut heads = BTreeMap::new();
            for line in out.lines() {
                let mut parts = line.split_whitespace();
                let (Some(sha), Some(refname)) = (parts.next(), parts.next()) else {
                    continue;
                };
                let Some(name) = refname.strip_prefix("refs/heads/") else {
                    continue;
                };
                let sha = Sha::parse(sha).map_err(|e| GitError::InvalidSha(e.to_string()))?;
                heads.insert(name.to_string(), sha);
            }
            self.ls_remote_cache = Some(heads);
        }
        // populated just above
        Ok(self.ls_remote_cache.as_ref().unwrap())
    }

    /// Names of all remote branches.
    pub fn remote_branch_names(&mut self) -> GitResult<Vec<String>> {
        Ok(self.remote_heads()?.keys().cloned().collect())
    }

    pub fn remote_branch_exists(&mut self, name: &str) -> GitResult<bool> {
        Ok(self.remote_heads()?.contains_key(name))
    }

    /// All tags known to the clone.
    pub fn tags(&self) -> GitResult<Vec<String>> {
        Ok(self
            .stdout(&["tag"])?
            .lines()
            .map(String::from)
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Checks a branch out as a local branch, resetting it onto its remote
    /// counterpart when one exists.
    pub fn checkout(&self, name: &str) -> GitResult<()> {
        if self.rev_parse(&format!("refs/remotes/origin/{}", name)).is_ok() {
            run_git(
                &self.workdir,
                &["checkout", "-B", name, &format!("origin/{}", name), "--quiet"],
            )?;
        } else {
            run_git(&self.workdir, &["checkout", name, "--quiet"])?;
        }
        Ok(())
    }

    /// Creates (or resets) a local branch at `start_point` and checks it out.
    pub fn create_branch(&self, name: &str, start_point: &str) -> GitResult<()> {
        run_git(
            &self.workdir,
            &["checkout", "-B", name, &self.resolve_start(start_point), "--quiet"],
        )?;
        Ok(())
    }

    /// Deletes a local branch if it exists.
    pub fn delete_local_branch(&self, name: &str) -> GitResult<()> {
        if self.rev_parse(&format!("refs/heads/{}", name)).is_ok() {
            run_git(&self.workdir, &["branch", "--delete", "--force", name])?;
        }
        Ok(())
    }

    /// Resolves a revision to a SHA.
    pub fn rev_parse(&self, rev: &str) -> GitResult<Sha> {
        let out = self
            .stdout(&["rev-parse", "--verify", "--quiet", &format!("{}^{{commit}}", rev)])
            .map_err(|_| GitError::RefNotFound(rev.to_string()))?;
        Sha::parse(out.trim()).map_err(|e| GitError::InvalidSha(e.to_string()))
    }

    /// The tip of a branch, preferring the remote-tracking ref.
    pub fn branch_tip(&self, name: &str) -> GitResult<Sha> {
        self.rev_parse(&format!("refs/heads/{}", name))
            .or_else(|_| self.rev_parse(&format!("refs/remotes/origin/{}", name)))
    }

    /// True when `ancestor` is reachable from `descendant`.
    pub fn includes_commit(&self, descendant: &str, ancestor: &str) -> GitResult<bool> {
        let ancestor = self.resolve_start(ancestor);
        let descendant = self.resolve_start(descendant);
        let output = git_command(&self.workdir)
            .args(["merge-base", "--is-ancestor", ancestor.as_str(), descendant.as_str()])
            .output()?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(GitError::CommandFailed {
                command: "git merge-base --is-ancestor".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
        }
    }

    /// Commits reachable from `branch` but not from `other`, newest first.
    pub fn commit_diff(&self, branch: &str, other: &str) -> GitResult<Vec<Sha>> {
        let out = self.stdout(&[
            "rev-list",
            &format!(
                "{}..{}",
                self.resolve_start(other),
                self.resolve_start(branch)
            ),
        ])?;
        out.lines()
            .filter(|l| !l.is_empty())
            .map(|l| Sha::parse(l).map_err(|e| GitError::InvalidSha(e.to_string())))
            .collect()
    }

    /// The author email of a commit.
    pub fn commit_author_email(&self, sha: &Sha) -> GitResult<String> {
        Ok(self
            .stdout(&["log", "-1", "--format=%ae", sha.as_str()])?
            .trim()
            .to_string())
    }

    /// Merges `rev` into the currently checked-out branch.
    pub fn merge(&self, rev: &str) -> GitResult<MergeOutcome> {
        self.merge_revs(&[rev])
    }

    /// Fast-forwards `branch` to `rev`; fails when the move is not a
    /// fast-forward.
    pub fn fast_forward(&self, branch: &str, rev: &str) -> GitResult<()> {
        self.checkout(branch)?;
        run_git(
            &self.workdir,
            &["merge", "--ff-only", &self.resolve_start(rev)],
        )?;
        Ok(())
    }

    /// Octopus merge of several revisions into the current branch.
    pub fn octopus_merge(&self, revs: &[&str]) -> GitResult<MergeOutcome> {
        self.merge_revs(revs)
    }

    /// Merges the given revisions into the current branch, preferring a
    /// single octopus merge and falling back to consecutive two-way merges
    /// when the octopus strategy gives up. The fallback keeps whichever
    /// merges completed; a conflict in the fallback is reported as such.
    pub fn robust_merge(&self, revs: &[&str]) -> GitResult<MergeOutcome> {
        if revs.len() < 2 {
            return self.merge_revs(revs);
        }
        let before = self.rev_parse("HEAD")?;
        match self.merge_revs(revs)? {
            MergeOutcome::Conflict { .. } => {
                debug!("octopus merge failed, retrying with consecutive merges");
                run_git(&self.workdir, &["reset", "--hard", before.as_str()])?;
                self.consecutive_merge(revs)
            }
            clean => Ok(clean),
        }
    }

    /// Two-way merges applied one revision at a time.
    pub fn consecutive_merge(&self, revs: &[&str]) -> GitResult<MergeOutcome> {
        let mut merged_any = false;
        for rev in revs.iter().copied() {
            match self.merge_revs(&[rev])? {
                MergeOutcome::Conflict { conflicting_files } => {
                    return Ok(MergeOutcome::Conflict { conflicting_files });
                }
                MergeOutcome::Merged => merged_any = true,
                MergeOutcome::AlreadyUpToDate => {}
            }
        }
        Ok(if merged_any {
            MergeOutcome::Merged
        } else {
            MergeOutcome::AlreadyUpToDate
        })
    }

    fn merge_revs(&self, revs: &[&str]) -> GitResult<MergeOutcome> {
        let resolved: Vec<String> = revs.iter().map(|r| self.resolve_start(r)).collect();
        let mut args = vec!["merge", "--no-edit"];
        args.extend(resolved.iter().map(String::as_str));
        let output = self
            .commit_command()
            .args(&args)
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            if stdout.contains("Already up to date") {
                return Ok(MergeOutcome::AlreadyUpToDate);
            }
            return Ok(MergeOutcome::Merged);
        }
        // A failed merge leaves the index dirty; collect conflicts and abort.
        let conflicting_files = self
            .stdout(&["diff", "--name-only", "--diff-filter=U"])
            .map(|out| out.lines().map(String::from).collect())
            .unwrap_or_default();
        if let Err(err) = run_git(&self.workdir, &["merge", "--abort"]) {
            warn!(%err, "could not abort failed merge");
        }
        Ok(MergeOutcome::Conflict { conflicting_files })
    }

    /// Pushes the given local branches to their remote counterparts.
    ///
    /// `force_with_lease` must only ever be used for integration branches;
    /// destinations are always pushed fast-forward.
    pub fn push(&mut self, branches: &[&str], force_with_lease: bool) -> GitResult<()> {
        if branches.is_empty() {
            return Ok(());
        }
        let refspecs: Vec<String> = branches
            .iter()
            .map(|b| format!("refs/heads/{}:refs/heads/{}", b, b))
            .collect();
        let mut args = vec!["push", "--atomic"];
        if force_with_lease {
            args.push("--force-with-lease");
        }
        args.push("origin");
        args.extend(refspecs.iter().map(String::as_str));
        self.ls_remote_cache = None;
        run_git(&self.workdir, &args).map_err(reject_on_non_fast_forward)?;
        Ok(())
    }

    /// Deletes remote branches. Missing branches are skipped.
    pub fn delete_remote_branches(&mut self, branches: &[&str]) -> GitResult<()> {
        let mut refspecs = Vec::new();
        for branch in branches {
            if self.remote_branch_exists(branch)? {
                refspecs.push(format!(":refs/heads/{}", branch));
            }
        }
        if refspecs.is_empty() {
            return Ok(());
        }
        let mut args = vec!["push", "origin"];
        args.extend(refspecs.iter().map(String::as_str));
        self.ls_remote_cache = None;
        run_git(&self.workdir, &args)?;
        Ok(())
    }

    /// Creates an annotated tag on `target` and pushes it.
    pub fn tag(&mut self, name: &str, target: &str) -> GitResult<()> {
        run_git(
            &self.workdir,
            &["tag", "--force", name, &self.resolve_start(target)],
        )?;
        run_git(&self.workdir, &["push", "origin", &format!("refs/tags/{}", name)])?;
        Ok(())
    }

    /// Prefer the remote-tracking ref when no local branch shadows it.
    fn resolve_start(&self, rev: &str) -> String {
        if self.rev_parse(&format!("refs/heads/{}", rev)).is_ok() {
            rev.to_string()
        } else if self
            .rev_parse(&format!("refs/remotes/origin/{}", rev))
            .is_ok()
        {
            format!("origin/{}", rev)
        } else {
            rev.to_string()
        }
    }

    fn commit_command(&self) -> Command {
        let identity = &self.config.identity;
        let mut cmd = git_command(&self.workdir);
        for setting in [
            format!("user.name={}", identity.name),
            format!("user.email={}", identity.email),
        ] {
            cmd.arg("-c").arg(setting);
        }
        cmd
    }

    fn stdout(&self, args: &[&str]) -> GitResult<String> {
        let output = run_git(&self.workdir, args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn identity(&self) -> &CommitIdentity {
        &self.config.identity
    }
}

fn reject_on_non_fast_forward(err: GitError) -> GitError {
    if let GitError::CommandFailed { stderr, .. } = &err
        && (stderr.contains("non-fast-forward") || stderr.contains("stale info"))
    {
        return GitError::PushRejected {
            details: stderr.clone(),
        };
    }
    err
}

/// Environment overrides applied to every git invocation: host and user
/// configuration are ignored, prompts are disabled.
const SCRUBBED_ENV: &[(&str, &str)] = &[
    ("GIT_CONFIG_NOSYSTEM", "1"),
    ("GIT_CONFIG_GLOBAL", "/dev/null"),
    ("GIT_TERMINAL_PROMPT", "0"),
];

fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir).envs(SCRUBBED_ENV.iter().copied());
    cmd
}

/// Run a git command in the given working directory, turning a non-zero
/// exit into `CommandFailed` with the captured stderr.
pub fn run_git(workdir: &Path, args: &[&str]) -> GitResult<Output> {
    let output = git_command(workdir).args(args).output()?;
    if !output.status.success() {
        return Err(command_failed(args, &output));
    }
    Ok(output)
}

fn command_failed(args: &[&str], output: &Output) -> GitError {
    let command = std::iter::once("git")
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    GitError::CommandFailed {
        command,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::GitFixture;

    #[test]
    fn open_clones_then_syncs() {
        let fixture = GitFixture::new();
        let mut workspace = fixture.workspace();
        assert!(workspace.remote_branch_exists("development/1.0").unwrap());
        // a second open must reuse the existing clone
        drop(workspace);
        let mut workspace = fixture.workspace();
        assert!(workspace.remote_branch_exists("development/1.0").unwrap());
    }

    #[test]
    fn ls_remote_cache_invalidated_by_push() {
        let fixture = GitFixture::new();
        let mut workspace = fixture.workspace();
        assert!(!workspace.remote_branch_exists("w/2.0/feature/x").unwrap());

        workspace
            .create_branch("w/2.0/feature/x", "development/2.0")
            .unwrap();
        workspace.push(&["w/2.0/feature/x"], false).unwrap();
        assert!(workspace.remote_branch_exists("w/2.0/feature/x").unwrap());
    }

    #[test]
    fn includes_commit_tracks_merges() {
        let fixture = GitFixture::new();
        fixture.commit_on("development/1.0", "fix.txt", "fix");
        let mut workspace = fixture.workspace();

        assert!(
            !workspace
                .includes_commit("development/2.0", "development/1.0")
                .unwrap()
        );

        workspace.create_branch("development/2.0", "development/2.0").unwrap();
        let outcome = workspace.merge("development/1.0").unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(
            workspace
                .includes_commit("development/2.0", "development/1.0")
                .unwrap()
        );
    }

    #[test]
    fn merge_conflict_is_reported_and_aborted() {
        let fixture = GitFixture::new();
        fixture.commit_on("development/1.0", "same.txt", "one");
        fixture.commit_on("development/2.0", "same.txt", "two");
        let mut workspace = fixture.workspace();
        workspace.sync().unwrap();

        workspace.create_branch("development/2.0", "development/2.0").unwrap();
        let outcome = workspace.merge("development/1.0").unwrap();
        match outcome {
            MergeOutcome::Conflict { conflicting_files } => {
                assert_eq!(conflicting_files, vec!["same.txt".to_string()]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        // the merge was aborted: the worktree is clean again
        let status = run_git(workspace.workdir(), &["status", "--porcelain"]).unwrap();
        assert!(String::from_utf8_lossy(&status.stdout).trim().is_empty());
    }

    #[test]
    fn robust_merge_combines_multiple_revisions() {
        let fixture = GitFixture::new();
        fixture.commit_on("development/1.0", "a.txt", "a");
        let feature = fixture.create_branch("feature/x", "development/1.0");
        fixture.commit_on("feature/x", "b.txt", "b");
        let mut workspace = fixture.workspace();
        workspace.sync().unwrap();

        workspace
            .create_branch("w/2.0/feature/x", "development/2.0")
            .unwrap();
        let outcome = workspace
            .robust_merge(&["development/1.0", "feature/x"])
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(
            workspace
                .includes_commit("w/2.0/feature/x", feature.as_str())
                .unwrap()
        );
    }

    #[test]
    fn commit_diff_lists_unmerged_commits() {
        let fixture = GitFixture::new();
        let first = fixture.commit_on("feature/x", "a.txt", "a");
        let second = fixture.commit_on("feature/x", "b.txt", "b");
        let mut workspace = fixture.workspace();
        workspace.sync().unwrap();

        let diff = workspace
            .commit_diff("feature/x", "development/1.0")
            .unwrap();
        assert_eq!(diff, vec![second, first]);
    }

    #[test]
    fn delete_remote_branches_skips_missing() {
        let fixture = GitFixture::new();
        let mut workspace = fixture.workspace();
        workspace
            .delete_remote_branches(&["w/2.0/feature/nope"])
            .unwrap();

        fixture.create_branch("w/2.0/feature/x", "development/2.0");
        workspace.sync().unwrap();
        workspace
            .delete_remote_branches(&["w/2.0/feature/x"])
            .unwrap();
        assert!(!workspace.remote_branch_exists("w/2.0/feature/x").unwrap());
    }
}
