//! The catalogue of user-facing messages.
//!
//! Every observable outcome of an evaluation is a [`Message`]: a stable
//! numeric code plus the parameters that matter for it. Rendering to
//! markdown happens here, away from the evaluator; the messenger derives
//! its at-most-once idempotency key from the serialized parameters.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{PrId, Sha};

/// Rendering context shared by all messages.
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// The robot's username, for mentions in remediation text.
    pub robot: String,
    /// The robot's version, shown in the footer.
    pub version: String,
    /// Currently active options, shown in the footer.
    pub active_options: Vec<String>,
}

/// A user-facing message with its stable status code.
///
/// Variants carry only the parameters that change the message; everything
/// presentational lives in [`Message::render`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum Message {
    /// 100 - first contact on a pull request.
    Greeting { author: String },

    /// 101 - the robot's manual.
    Help,

    /// 102 - the change reached every destination.
    SuccessfulMerge {
        branches: Vec<String>,
        ignored: Vec<String>,
        issue: Option<String>,
    },

    /// 103 - recognized command without an implementation.
    NotImplemented { command: String },

    /// 104 - on-demand status report.
    StatusReport { state: String },

    /// 105 - the source branch prefix is not recognized.
    IncorrectPrefix { prefix: String, allowed: Vec<String> },

    /// 106 - source prefix incompatible with the destination.
    IncompatibleBranch { source: String, destination: String },

    /// 107 - an issue reference is required and missing.
    MissingIssueKey { source: String, destination: String },

    /// 108 - the referenced issue does not exist.
    IssueNotFound { issue: String },

    /// 109 - subtask issues are not supported.
    SubtaskNotSupported { issue: String },

    /// 110 - the issue belongs to a project this robot does not handle.
    WrongProject { issue: String, expected: Vec<String> },

    /// 111 - issue type and branch prefix disagree.
    TypePrefixMismatch {
        prefix: String,
        issue_type: String,
        expected_prefix: Option<String>,
    },

    /// 112 - the issue's fix versions do not match the cascade.
    FixVersionMismatch {
        issue: String,
        found: Vec<String>,
        expected: Vec<String>,
    },

    /// 113 - the integration branch contains history from nowhere.
    HistoryMismatch {
        commit: Sha,
        integration_branch: String,
        feature_branch: String,
        development_branch: String,
    },

    /// 114 - a merge conflict stops the cascade.
    Conflict {
        source: String,
        integration_branch: String,
        development_branch: String,
        feature_branch: String,
        /// True when the conflict is against the PR's own destination, in
        /// which case the fix belongs on the feature branch.
        on_feature_branch: bool,
    },

    /// 115 - approvals are missing or a change request is outstanding.
    ApprovalsNeeded {
        missing_author: bool,
        missing_peers: usize,
        missing_leaders: usize,
        change_requesters: Vec<String>,
    },

    /// 118 - a build failed on an integration or queue branch.
    BuildFailed { branch: String, commit: Sha },

    /// 120 - declared dependencies are not merged yet.
    AfterPullRequest {
        opened: Vec<PrId>,
        declined: Vec<PrId>,
    },

    /// 121 - integration branches and pull requests were created.
    IntegrationCreated {
        children: Vec<String>,
        ignored: Vec<String>,
    },

    /// 122 - unknown token addressed to the robot.
    UnknownCommand { command: String, author: String },

    /// 123 - privileged token used without privilege.
    NotAuthorized {
        command: String,
        author: String,
        self_pr: bool,
    },

    /// 124 - the change conflicts with queued content.
    QueueConflict,

    /// 125 - the change entered the merge queue.
    Queued {
        branches: Vec<String>,
        ignored: Vec<String>,
        issue: Option<String>,
    },

    /// 126 - only the queued commits were merged.
    PartialMerge {
        commits: Vec<Sha>,
        branches: Vec<String>,
    },

    /// 127 - the queues are out of order; operator action required.
    QueueOutOfOrder,

    /// 128 - integration branches were reset.
    ResetComplete { undeclined: Vec<PrId> },

    /// 129 - reset refused: it would discard user work.
    LossyResetWarning,

    /// 134 - the source diverged beyond the configured limit.
    SourceDiverged { commits: usize, limit: usize },

    /// 134 - an authored-only token used by somebody else.
    NotAuthor {
        command: String,
        author: String,
        pr_author: String,
    },
}

impl Message {
    /// The stable status code of this message.
    pub fn code(&self) -> u16 {
        match self {
            Message::Greeting { .. } => 100,
            Message::Help => 101,
            Message::SuccessfulMerge { .. } => 102,
            Message::NotImplemented { .. } => 103,
            Message::StatusReport { .. } => 104,
            Message::IncorrectPrefix { .. } => 105,
            Message::IncompatibleBranch { .. } => 106,
            Message::MissingIssueKey { .. } => 107,
            Message::IssueNotFound { .. } => 108,
            Message::SubtaskNotSupported { .. } => 109,
            Message::WrongProject { .. } => 110,
            Message::TypePrefixMismatch { .. } => 111,
            Message::FixVersionMismatch { .. } => 112,
            Message::HistoryMismatch { .. } => 113,
            Message::Conflict { .. } => 114,
            Message::ApprovalsNeeded { .. } => 115,
            Message::BuildFailed { .. } => 118,
            Message::AfterPullRequest { .. } => 120,
            Message::IntegrationCreated { .. } => 121,
            Message::UnknownCommand { .. } => 122,
            Message::NotAuthorized { .. } => 123,
            Message::QueueConflict => 124,
            Message::Queued { .. } => 125,
            Message::PartialMerge { .. } => 126,
            Message::QueueOutOfOrder => 127,
            Message::ResetComplete { .. } => 128,
            Message::LossyResetWarning => 129,
            Message::SourceDiverged { .. } | Message::NotAuthor { .. } => 134,
        }
    }

    /// Whether this message may be posted again even when an identical one
    /// already exists (help and reports are re-posted on request; a partial
    /// merge is reported every time it happens).
    pub fn may_repeat(&self) -> bool {
        matches!(
            self,
            Message::Help
                | Message::NotImplemented { .. }
                | Message::StatusReport { .. }
                | Message::PartialMerge { .. }
        )
    }

    /// Whether a message of this code is posted at most once in the PR's
    /// lifetime, regardless of parameters.
    pub fn once_per_lifetime(&self) -> bool {
        matches!(self, Message::Greeting { .. })
    }

    /// The messenger's idempotency key: a digest over the salient
    /// parameters of the message.
    pub fn idempotency_key(&self) -> String {
        // serialization of a tagged enum over plain data cannot fail
        let json = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(json.as_bytes());
        digest
            .iter()
            .take(8)
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Renders the full comment body, footer included.
    pub fn render(&self, ctx: &RenderContext) -> String {
        let mut body = self.body(ctx);
        body.push_str("\n\n---\n");
        let options = if ctx.active_options.is_empty() {
            "none".to_string()
        } else {
            ctx.active_options.join(", ")
        };
        body.push_str(&format!(
            "_code {} - {} v{} - active options: {}_\n",
            self.code(),
            ctx.robot,
            ctx.version,
            options
        ));
        body
    }

    fn body(&self, ctx: &RenderContext) -> String {
        match self {
            Message::Greeting { author } => format!(
                "Hello @{},\n\n\
                 I am @{}, and I will be merging this pull request for you once \
                 it is approved and green. Comment `@{} help` for everything I \
                 respond to.",
                author, ctx.robot, ctx.robot
            ),
            Message::Help => format!(
                "**Commands** (one-shot): `help`, `status`, `reset`, `force_reset`.\n\
                 **Options** (active while the comment exists): `approve`, `wait`, \
                 `after_pull_request=<id>`, `no_octopus`, and the privileged \
                 `bypass_*` family.\n\n\
                 Address me with `@{} <token>` or `/<token>`.",
                ctx.robot
            ),
            Message::SuccessfulMerge {
                branches,
                ignored,
                issue,
            } => {
                let mut text = format!(
                    "I have successfully merged the changeset into:\n\n{}",
                    bullet_list(branches)
                );
                if !ignored.is_empty() {
                    text.push_str(&format!(
                        "\n\nThe following branches were left untouched:\n\n{}",
                        bullet_list(ignored)
                    ));
                }
                if let Some(issue) = issue {
                    text.push_str(&format!("\n\nGoodbye {}.", issue));
                }
                text
            }
            Message::NotImplemented { command } => {
                format!("The command `{}` exists but is not implemented yet.", command)
            }
            Message::StatusReport { state } => format!("Current status: {}", state),
            Message::IncorrectPrefix { prefix, allowed } => format!(
                "`{}/` is not a valid source branch prefix. Permitted prefixes: {}.",
                prefix,
                allowed
                    .iter()
                    .map(|p| format!("`{}/`", p))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Message::IncompatibleBranch {
                source,
                destination,
            } => format!(
                "A `{}` branch may not target `{}`: new features never land on \
                 maintenance-only destinations. Retarget the pull request or \
                 rename the source branch.",
                source, destination
            ),
            Message::MissingIssueKey {
                source,
                destination,
            } => format!(
                "`{}` does not reference an issue, and `{}` requires one. \
                 Rename the branch to `<prefix>/<PROJECT>-<number>-<label>`.",
                source, destination
            ),
            Message::IssueNotFound { issue } => {
                format!("The issue `{}` referenced by the source branch does not exist.", issue)
            }
            Message::SubtaskNotSupported { issue } => format!(
                "`{}` is a subtask. Please reference the parent issue instead.",
                issue
            ),
            Message::WrongProject { issue, expected } => format!(
                "`{}` does not belong to a project I handle (expected: {}).",
                issue,
                expected.join(", ")
            ),
            Message::TypePrefixMismatch {
                prefix,
                issue_type,
                expected_prefix,
            } => {
                let mut text = format!(
                    "The issue type `{}` does not match the `{}/` branch prefix.",
                    issue_type, prefix
                );
                if let Some(expected) = expected_prefix {
                    text.push_str(&format!(" Expected prefix: `{}/`.", expected));
                }
                text
            }
            Message::FixVersionMismatch {
                issue,
                found,
                expected,
            } => format!(
                "The `Fix Version/s` of `{}` do not match the branches this \
                 pull request will reach.\n\nFound: {}\nExpected: {}",
                issue,
                comma_or_none(found),
                comma_or_none(expected)
            ),
            Message::HistoryMismatch {
                commit,
                integration_branch,
                feature_branch,
                development_branch,
            } => format!(
                "Commit `{}` on `{}` comes neither from `{}` nor from `{}`. \
                 I cannot merge histories I do not understand; `reset` the \
                 integration branches to start over.",
                commit.short(),
                integration_branch,
                feature_branch,
                development_branch
            ),
            Message::Conflict {
                source,
                integration_branch,
                development_branch,
                feature_branch,
                on_feature_branch,
            } => {
                let remedy = if *on_feature_branch {
                    format!(
                        "Please merge `{}` into the feature branch `{}` and \
                         resolve the conflict there.",
                        development_branch, feature_branch
                    )
                } else {
                    format!(
                        "Please resolve the conflict on the integration branch \
                         `{}` (merge `{}` into it), and do not rebase it.",
                        integration_branch, source
                    )
                };
                format!(
                    "A conflict occurred while merging `{}` into `{}`.\n\n{}",
                    source, integration_branch, remedy
                )
            }
            Message::ApprovalsNeeded {
                missing_author,
                missing_peers,
                missing_leaders,
                change_requesters,
            } => {
                let mut waits = Vec::new();
                if *missing_author {
                    waits.push("the author's approval".to_string());
                }
                if *missing_peers > 0 {
                    waits.push(format!("{} more peer approval(s)", missing_peers));
                }
                if *missing_leaders > 0 {
                    waits.push(format!("{} more project-leader approval(s)", missing_leaders));
                }
                let mut text = format!("Waiting for {}.", waits.join(", "));
                if !change_requesters.is_empty() {
                    text.push_str(&format!(
                        "\n\nChanges were requested by: {}.",
                        change_requesters.join(", ")
                    ));
                }
                text
            }
            Message::BuildFailed { branch, commit } => format!(
                "The build on `{}` (commit `{}`) did not succeed. Push a fix \
                 or re-run the build to continue.",
                branch,
                commit.short()
            ),
            Message::AfterPullRequest { opened, declined } => {
                let mut text = String::from(
                    "This pull request waits on other pull requests to be merged first.",
                );
                if !opened.is_empty() {
                    text.push_str(&format!(
                        "\n\nStill open: {}.",
                        opened
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                }
                if !declined.is_empty() {
                    text.push_str(&format!(
                        "\n\nDeclined (the dependency can never be satisfied): {}.",
                        declined
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                }
                text
            }
            Message::IntegrationCreated { children, ignored } => {
                let mut text = format!(
                    "I have created the integration branches for this pull \
                     request:\n\n{}\n\nDo not edit them directly except to \
                     resolve conflicts; they belong to me.",
                    bullet_list(children)
                );
                if !ignored.is_empty() {
                    text.push_str(&format!(
                        "\n\nThe following branches will not be touched:\n\n{}",
                        bullet_list(ignored)
                    ));
                }
                text
            }
            Message::UnknownCommand { command, author } => format!(
                "@{}, I do not understand `{}`. Comment `@{} help` for the \
                 list of commands and options.",
                author, command, ctx.robot
            ),
            Message::NotAuthorized {
                command,
                author,
                self_pr,
            } => {
                let mut text = format!(
                    "@{}, you are not authorized to use `{}`.",
                    author, command
                );
                if *self_pr {
                    text.push_str(" Privileged options cannot be applied to your own pull request.");
                }
                text
            }
            Message::QueueConflict => "The changeset conflicts with content already \
                 in the merge queue. It will be retried automatically once the \
                 queue has been merged."
                .to_string(),
            Message::Queued {
                branches,
                ignored,
                issue,
            } => {
                let mut text = format!(
                    "The changeset has entered the merge queue and will be \
                     merged into:\n\n{}",
                    bullet_list(branches)
                );
                if !ignored.is_empty() {
                    text.push_str(&format!(
                        "\n\nIgnored branches:\n\n{}",
                        bullet_list(ignored)
                    ));
                }
                if let Some(issue) = issue {
                    text.push_str(&format!("\n\nTracking issue: {}.", issue));
                }
                text
            }
            Message::PartialMerge { commits, branches } => format!(
                "Only the commits that were queued have been merged into \
                 {}:\n\n{}\n\nCommits pushed after queueing restart the \
                 process from the beginning.",
                branches.join(", "),
                bullet_list(
                    &commits
                        .iter()
                        .map(|c| format!("`{}`", c.short()))
                        .collect::<Vec<_>>()
                )
            ),
            Message::QueueOutOfOrder => "The merge queues are out of order; I will \
                 not merge anything until an operator rebuilds or deletes them."
                .to_string(),
            Message::ResetComplete { undeclined } => {
                let mut text = String::from(
                    "The integration branches have been removed; the merge \
                     process restarts from the beginning.",
                );
                if !undeclined.is_empty() {
                    text.push_str(&format!(
                        "\n\nI could not decline these integration pull \
                         requests: {}.",
                        undeclined
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                }
                text
            }
            Message::LossyResetWarning => "The integration branches carry commits \
                 that do not come from the source branch; a reset would discard \
                 them. Use `force_reset` if that is what you want."
                .to_string(),
            Message::SourceDiverged { commits, limit } => format!(
                "The source branch is {} commits behind its destination, more \
                 than the configured limit of {}. Please update the source \
                 branch.",
                commits, limit
            ),
            Message::NotAuthor {
                command,
                author,
                pr_author,
            } => format!(
                "@{}, only the author of the pull request (@{}) may use `{}`.",
                author, pr_author, command
            ),
        }
    }
}

fn bullet_list<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(|i| format!("- {}", i.as_ref()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn comma_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}
