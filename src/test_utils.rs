//! Shared test fixtures.
//!
//! `GitFixture` builds a throwaway origin repository seeded with two
//! development branches (`development/1.0` contained in `development/2.0`)
//! plus a side clone for simulating developer pushes. The bot's workspace
//! clones from the same origin, so tests exercise the real fetch/merge/push
//! paths.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::git::{CommitIdentity, GitConfig, Workspace, run_git};
use crate::types::{RepoId, Sha};

pub struct GitFixture {
    dir: TempDir,
    origin: PathBuf,
    seed: PathBuf,
}

impl GitFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create fixture tempdir");
        let origin = dir.path().join("origin.git");
        let seed = dir.path().join("seed");
        std::fs::create_dir_all(&origin).unwrap();
        std::fs::create_dir_all(&seed).unwrap();

        run_git(&origin, &["init", "--bare", "--initial-branch=main"]).unwrap();

        run_git(&seed, &["init", "--initial-branch=main"]).unwrap();
        run_git(&seed, &["config", "user.email", "dev@example.com"]).unwrap();
        run_git(&seed, &["config", "user.name", "Dev"]).unwrap();
        run_git(&seed, &["remote", "add", "origin", origin.to_str().unwrap()]).unwrap();

        std::fs::write(seed.join("README.md"), "# fixture").unwrap();
        run_git(&seed, &["add", "."]).unwrap();
        run_git(&seed, &["commit", "-m", "Initial commit"]).unwrap();
        run_git(&seed, &["push", "origin", "HEAD:refs/heads/development/1.0"]).unwrap();
        run_git(&seed, &["push", "origin", "HEAD:refs/heads/development/2.0"]).unwrap();
        run_git(
            &origin,
            &["symbolic-ref", "HEAD", "refs/heads/development/1.0"],
        )
        .unwrap();

        GitFixture { dir, origin, seed }
    }

    pub fn config(&self) -> GitConfig {
        GitConfig {
            base_dir: self.dir.path().join("cache"),
            repo: RepoId::new("acme", "widget"),
            remote_url: self.origin.to_str().unwrap().to_string(),
            identity: CommitIdentity {
                name: "Waterflow".to_string(),
                email: "waterflow@localhost".to_string(),
            },
        }
    }

    /// Opens (or re-opens) the bot workspace against the fixture origin.
    pub fn workspace(&self) -> Workspace {
        Workspace::open(self.config()).expect("open workspace")
    }

    fn checkout(&self, branch: &str, from: &str) {
        run_git(&self.seed, &["fetch", "origin"]).unwrap();
        run_git(
            &self.seed,
            &[
                "checkout",
                "-B",
                branch,
                &format!("origin/{}", from),
                "--quiet",
            ],
        )
        .unwrap();
    }

    /// Commits a file on `branch` as a developer and pushes it. The branch
    /// is created from `development/1.0` when it does not exist yet.
    pub fn commit_on(&self, branch: &str, file: &str, content: &str) -> Sha {
        self.commit_on_as(branch, file, content, "dev@example.com")
    }

    /// Commits a file on `branch` with an explicit author email.
    pub fn commit_on_as(&self, branch: &str, file: &str, content: &str, email: &str) -> Sha {
        if self.branch_exists(branch) {
            self.checkout(branch, branch);
        } else {
            self.checkout(branch, "development/1.0");
        }
        std::fs::write(self.seed.join(file), content).unwrap();
        run_git(&self.seed, &["add", file]).unwrap();
        run_git(
            &self.seed,
            &[
                "-c",
                &format!("user.email={}", email),
                "commit",
                "-m",
                &format!("Add {}", file),
            ],
        )
        .unwrap();
        run_git(
            &self.seed,
            &[
                "push",
                "--force",
                "origin",
                &format!("HEAD:refs/heads/{}", branch),
            ],
        )
        .unwrap();
        self.tip(branch)
    }

    /// Force-pushes `branch` to a fresh lineage cut from `base` with one
    /// new commit, the way a developer rebase discards previous commits.
    pub fn rebase_onto(&self, branch: &str, base: &str, file: &str, content: &str) -> Sha {
        self.checkout(branch, base);
        std::fs::write(self.seed.join(file), content).unwrap();
        run_git(&self.seed, &["add", file]).unwrap();
        run_git(&self.seed, &["commit", "-m", &format!("Rework {}", file)]).unwrap();
        run_git(
            &self.seed,
            &[
                "push",
                "--force",
                "origin",
                &format!("HEAD:refs/heads/{}", branch),
            ],
        )
        .unwrap();
        self.tip(branch)
    }

    /// Creates `name` at the tip of `from` on the origin.
    pub fn create_branch(&self, name: &str, from: &str) -> Sha {
        self.checkout(name, from);
        run_git(
            &self.seed,
            &["push", "origin", &format!("HEAD:refs/heads/{}", name)],
        )
        .unwrap();
        self.tip(name)
    }

    /// Merges `other` into `branch` as a developer, resolving any conflict
    /// by writing `content` into `file`.
    pub fn merge_resolving(&self, branch: &str, other: &str, file: &str, content: &str) -> Sha {
        self.checkout(branch, branch);
        let merged = run_git(&self.seed, &["merge", "--no-edit", &format!("origin/{}", other)]);
        if merged.is_err() {
            std::fs::write(self.seed.join(file), content).unwrap();
            run_git(&self.seed, &["add", file]).unwrap();
            run_git(&self.seed, &["commit", "--no-edit"]).unwrap();
        }
        run_git(
            &self.seed,
            &["push", "origin", &format!("HEAD:refs/heads/{}", branch)],
        )
        .unwrap();
        self.tip(branch)
    }

    pub fn delete_branch(&self, name: &str) {
        run_git(
            &self.seed,
            &["push", "origin", &format!(":refs/heads/{}", name)],
        )
        .unwrap();
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        run_git(
            &self.origin,
            &[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{}", name),
            ],
        )
        .is_ok()
    }

    /// Tip of a branch as recorded on the origin.
    pub fn tip(&self, branch: &str) -> Sha {
        let out = run_git(
            &self.origin,
            &["rev-parse", &format!("refs/heads/{}", branch)],
        )
        .unwrap();
        Sha::parse(String::from_utf8_lossy(&out.stdout).trim()).unwrap()
    }

    pub fn tag(&self, name: &str, branch: &str) {
        run_git(
            &self.origin,
            &["tag", name, &format!("refs/heads/{}", branch)],
        )
        .unwrap();
    }

    /// True when every commit of `ancestor` is contained in `descendant`
    /// on the origin.
    pub fn origin_includes(&self, descendant: &str, ancestor: &str) -> bool {
        run_git(
            &self.origin,
            &[
                "merge-base",
                "--is-ancestor",
                &format!("refs/heads/{}", ancestor),
                &format!("refs/heads/{}", descendant),
            ],
        )
        .is_ok()
    }

    pub fn origin_path(&self) -> &Path {
        &self.origin
    }
}

impl Default for GitFixture {
    fn default() -> Self {
        GitFixture::new()
    }
}
