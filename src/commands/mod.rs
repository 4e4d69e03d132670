//! Options and commands addressed to the robot through PR comments.
//!
//! A line beginning with `@<robot>` or `/` is interpreted as either an
//! **option declaration** (sticky: in effect exactly while the comment
//! exists) or a **command call** (one-shot). Options are re-derived from
//! the live comment list on every evaluation, so deleting a comment
//! withdraws its options.
//!
//! Privilege rules: `bypass_*` tokens require the comment author to be an
//! admin, and are never usable by the PR author on their own PR (unless
//! granted through `pr_author_options`). `approve` is only valid when the
//! comment author is the PR author.

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::hosting::Comment;
use crate::messages::Message;
use crate::settings::RepositorySettings;
use crate::types::PrId;

/// A sticky option token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionToken {
    Approve,
    Wait,
    NoOctopus,
    Unanimity,
    AfterPullRequest,
    CreateIntegrationBranches,
    CreatePullRequests,
    BypassAuthorApproval,
    BypassPeerApproval,
    BypassLeaderApproval,
    BypassBuildStatus,
    BypassIncompatibleBranch,
    BypassJiraCheck,
}

impl OptionToken {
    pub fn keyword(&self) -> &'static str {
        match self {
            OptionToken::Approve => "approve",
            OptionToken::Wait => "wait",
            OptionToken::NoOctopus => "no_octopus",
            OptionToken::Unanimity => "unanimity",
            OptionToken::AfterPullRequest => "after_pull_request",
            OptionToken::CreateIntegrationBranches => "create_integration_branches",
            OptionToken::CreatePullRequests => "create_pull_requests",
            OptionToken::BypassAuthorApproval => "bypass_author_approval",
            OptionToken::BypassPeerApproval => "bypass_peer_approval",
            OptionToken::BypassLeaderApproval => "bypass_leader_approval",
            OptionToken::BypassBuildStatus => "bypass_build_status",
            OptionToken::BypassIncompatibleBranch => "bypass_incompatible_branch",
            OptionToken::BypassJiraCheck => "bypass_jira_check",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "approve" => OptionToken::Approve,
            "wait" => OptionToken::Wait,
            "no_octopus" => OptionToken::NoOctopus,
            "unanimity" => OptionToken::Unanimity,
            "after_pull_request" => OptionToken::AfterPullRequest,
            "create_integration_branches" => OptionToken::CreateIntegrationBranches,
            "create_pull_requests" => OptionToken::CreatePullRequests,
            "bypass_author_approval" => OptionToken::BypassAuthorApproval,
            "bypass_peer_approval" => OptionToken::BypassPeerApproval,
            "bypass_leader_approval" => OptionToken::BypassLeaderApproval,
            "bypass_build_status" => OptionToken::BypassBuildStatus,
            "bypass_incompatible_branch" => OptionToken::BypassIncompatibleBranch,
            "bypass_jira_check" => OptionToken::BypassJiraCheck,
            _ => return None,
        })
    }

    /// Bypass options waive a gating check; they are always privileged.
    pub fn privileged(&self) -> bool {
        matches!(
            self,
            OptionToken::BypassAuthorApproval
                | OptionToken::BypassPeerApproval
                | OptionToken::BypassLeaderApproval
                | OptionToken::BypassBuildStatus
                | OptionToken::BypassIncompatibleBranch
                | OptionToken::BypassJiraCheck
        )
    }

    /// Authored options are only valid from the PR author.
    pub fn authored(&self) -> bool {
        matches!(self, OptionToken::Approve)
    }
}

/// A one-shot command token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandToken {
    Help,
    Status,
    Reset,
    ForceReset,
    Build,
    Retry,
    Clear,
}

impl CommandToken {
    pub fn keyword(&self) -> &'static str {
        match self {
            CommandToken::Help => "help",
            CommandToken::Status => "status",
            CommandToken::Reset => "reset",
            CommandToken::ForceReset => "force_reset",
            CommandToken::Build => "build",
            CommandToken::Retry => "retry",
            CommandToken::Clear => "clear",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "help" => CommandToken::Help,
            "status" => CommandToken::Status,
            "reset" => CommandToken::Reset,
            "force_reset" => CommandToken::ForceReset,
            "build" => CommandToken::Build,
            "retry" => CommandToken::Retry,
            "clear" => CommandToken::Clear,
            _ => return None,
        })
    }

    /// Recognized but unimplemented commands answer with code 103.
    pub fn not_implemented(&self) -> bool {
        matches!(
            self,
            CommandToken::Build | CommandToken::Retry | CommandToken::Clear
        )
    }
}

/// The effective set of sticky options derived from the live comments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EffectiveOptions {
    pub approve: bool,
    pub wait: bool,
    pub no_octopus: bool,
    pub unanimity: bool,
    pub after_pull_request: Vec<PrId>,
    pub create_integration_branches: bool,
    pub create_pull_requests: bool,
    pub bypass_author_approval: bool,
    pub bypass_peer_approval: bool,
    pub bypass_leader_approval: bool,
    pub bypass_build_status: bool,
    pub bypass_incompatible_branch: bool,
    pub bypass_jira_check: bool,
}

impl EffectiveOptions {
    /// Labels of the active options, for the message footer.
    pub fn active_labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        let flags = [
            (self.approve, OptionToken::Approve),
            (self.wait, OptionToken::Wait),
            (self.no_octopus, OptionToken::NoOctopus),
            (self.unanimity, OptionToken::Unanimity),
            (
                self.create_integration_branches,
                OptionToken::CreateIntegrationBranches,
            ),
            (self.create_pull_requests, OptionToken::CreatePullRequests),
            (
                self.bypass_author_approval,
                OptionToken::BypassAuthorApproval,
            ),
            (self.bypass_peer_approval, OptionToken::BypassPeerApproval),
            (
                self.bypass_leader_approval,
                OptionToken::BypassLeaderApproval,
            ),
            (self.bypass_build_status, OptionToken::BypassBuildStatus),
            (
                self.bypass_incompatible_branch,
                OptionToken::BypassIncompatibleBranch,
            ),
            (self.bypass_jira_check, OptionToken::BypassJiraCheck),
        ];
        for (set, token) in flags {
            if set {
                labels.push(token.keyword().to_string());
            }
        }
        for pr in &self.after_pull_request {
            labels.push(format!("after_pull_request={}", pr.0));
        }
        labels
    }

    fn set(&mut self, token: OptionToken, value: Option<&str>) -> Result<(), String> {
        match token {
            OptionToken::Approve => self.approve = true,
            OptionToken::Wait => self.wait = true,
            OptionToken::NoOctopus => self.no_octopus = true,
            OptionToken::Unanimity => self.unanimity = true,
            OptionToken::CreateIntegrationBranches => self.create_integration_branches = true,
            OptionToken::CreatePullRequests => self.create_pull_requests = true,
            OptionToken::BypassAuthorApproval => self.bypass_author_approval = true,
            OptionToken::BypassPeerApproval => self.bypass_peer_approval = true,
            OptionToken::BypassLeaderApproval => self.bypass_leader_approval = true,
            OptionToken::BypassBuildStatus => self.bypass_build_status = true,
            OptionToken::BypassIncompatibleBranch => self.bypass_incompatible_branch = true,
            OptionToken::BypassJiraCheck => self.bypass_jira_check = true,
            OptionToken::AfterPullRequest => {
                let id: u64 = value
                    .ok_or("after_pull_request requires a value")?
                    .trim_start_matches('#')
                    .parse()
                    .map_err(|_| "after_pull_request takes a pull request number")?;
                let id = PrId(id);
                if !self.after_pull_request.contains(&id) {
                    self.after_pull_request.push(id);
                }
            }
        }
        Ok(())
    }
}

/// A command call together with its author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCall {
    pub token: CommandToken,
    pub author: String,
}

/// Everything learned from scanning a PR's comments.
#[derive(Debug, Clone, Default)]
pub struct CommentScan {
    pub options: EffectiveOptions,
    /// Commands found after the robot's last comment, oldest first.
    pub commands: Vec<CommandCall>,
}

/// A token the scan could not accept; translates into a status message.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("unknown token `{token}` from {author}")]
    Unknown { token: String, author: String },

    #[error("`{token}` used without privilege by {author}")]
    NotPrivileged {
        token: String,
        author: String,
        self_pr: bool,
    },

    #[error("`{token}` is reserved to the pull request author, used by {author}")]
    NotAuthored {
        token: String,
        author: String,
        pr_author: String,
    },
}

impl CommandError {
    pub fn into_message(self) -> Message {
        match self {
            CommandError::Unknown { token, author } => Message::UnknownCommand {
                command: token,
                author,
            },
            CommandError::NotPrivileged {
                token,
                author,
                self_pr,
            } => Message::NotAuthorized {
                command: token,
                author,
                self_pr,
            },
            CommandError::NotAuthored {
                token,
                author,
                pr_author,
            } => Message::NotAuthor {
                command: token,
                author,
                pr_author,
            },
        }
    }
}

/// Scans the comments of a pull request.
///
/// Options are collected from every live comment; commands only from
/// comments posted after the robot's last message (everything older has
/// been answered already).
pub fn scan_comments(
    comments: &[Comment],
    settings: &RepositorySettings,
    pr_author: &str,
) -> Result<CommentScan, CommandError> {
    let mut scan = CommentScan::default();

    for comment in comments {
        if comment.author == settings.robot {
            continue;
        }
        for line in comment.text.lines() {
            scan_option_line(line, &comment.author, pr_author, settings, &mut scan.options)?;
        }
    }

    // Commands: walk back until the robot's last comment.
    let unanswered = comments
        .iter()
        .rev()
        .take_while(|c| c.author != settings.robot)
        .collect::<Vec<_>>();
    for comment in unanswered.into_iter().rev() {
        for line in comment.text.lines() {
            if let Some(call) = scan_command_line(line, &comment.author, settings)? {
                scan.commands.push(call);
            }
        }
    }

    Ok(scan)
}

/// Strips the robot mention or slash prefix, returning the token text.
fn strip_prefix<'a>(line: &'a str, robot: &str) -> Option<&'a str> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix('/') {
        return Some(rest);
    }
    let mention = format!("@{}", robot);
    if line.len() >= mention.len() && line[..mention.len()].eq_ignore_ascii_case(&mention) {
        let rest = &line[mention.len()..];
        // `@robots` must not match `@robot`
        if rest.is_empty() || rest.starts_with([' ', '\t', ':']) {
            return Some(rest.trim_start_matches([' ', '\t', ':']));
        }
    }
    None
}

fn check_privilege(
    token: OptionToken,
    author: &str,
    pr_author: &str,
    settings: &RepositorySettings,
) -> Result<(), CommandError> {
    if token.privileged() && !settings.is_privileged(author, pr_author, token.keyword()) {
        return Err(CommandError::NotPrivileged {
            token: token.keyword().to_string(),
            author: author.to_string(),
            self_pr: author == pr_author,
        });
    }
    if token.authored() && author != pr_author {
        return Err(CommandError::NotAuthored {
            token: token.keyword().to_string(),
            author: author.to_string(),
            pr_author: pr_author.to_string(),
        });
    }
    Ok(())
}

fn scan_option_line(
    line: &str,
    author: &str,
    pr_author: &str,
    settings: &RepositorySettings,
    options: &mut EffectiveOptions,
) -> Result<(), CommandError> {
    let Some(rest) = strip_prefix(line, &settings.robot) else {
        return Ok(());
    };
    let words: Vec<&str> = rest.split_whitespace().collect();
    let Some(first) = words.first() else {
        return Ok(());
    };

    // A command line is not an option declaration.
    let (first_key, _) = split_token(first);
    if CommandToken::from_keyword(first_key).is_some() {
        return Ok(());
    }

    for word in words {
        let (keyword, value) = split_token(word);
        let Some(token) = OptionToken::from_keyword(keyword) else {
            return Err(CommandError::Unknown {
                token: keyword.to_string(),
                author: author.to_string(),
            });
        };
        check_privilege(token, author, pr_author, settings)?;
        if let Err(reason) = options.set(token, value) {
            debug!(keyword, reason, "ignoring malformed option");
        }
    }
    Ok(())
}

fn scan_command_line(
    line: &str,
    author: &str,
    settings: &RepositorySettings,
) -> Result<Option<CommandCall>, CommandError> {
    let Some(rest) = strip_prefix(line, &settings.robot) else {
        return Ok(None);
    };
    let Some(first) = rest.split_whitespace().next() else {
        return Ok(None);
    };
    let (keyword, value) = split_token(first);

    // Option declarations are handled by the options pass.
    if value.is_some() || OptionToken::from_keyword(keyword).is_some() {
        return Ok(None);
    }
    let Some(token) = CommandToken::from_keyword(keyword) else {
        return Err(CommandError::Unknown {
            token: keyword.to_string(),
            author: author.to_string(),
        });
    };
    Ok(Some(CommandCall {
        token,
        author: author.to_string(),
    }))
}

fn split_token(word: &str) -> (&str, Option<&str>) {
    match word.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (word, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::CommentId;

    fn settings() -> RepositorySettings {
        RepositorySettings {
            repository_owner: "acme".to_string(),
            repository_slug: "widget".to_string(),
            robot: "waterflow".to_string(),
            admins: vec!["alice".to_string()],
            ..Default::default()
        }
    }

    fn comment(id: u64, author: &str, text: &str) -> Comment {
        Comment {
            id: CommentId(id),
            author: author.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn author_can_approve() {
        let comments = vec![comment(1, "bob", "@waterflow approve")];
        let scan = scan_comments(&comments, &settings(), "bob").unwrap();
        assert!(scan.options.approve);
        assert_eq!(scan.options.active_labels(), vec!["approve".to_string()]);
    }

    #[test]
    fn approve_by_somebody_else_is_rejected() {
        let comments = vec![comment(1, "carol", "@waterflow approve")];
        let err = scan_comments(&comments, &settings(), "bob").unwrap_err();
        assert!(matches!(err, CommandError::NotAuthored { .. }));
        let message = err.into_message();
        assert_eq!(message.code(), 134);
    }

    #[test]
    fn bypass_requires_privilege() {
        let comments = vec![comment(1, "bob", "/bypass_build_status")];
        let err = scan_comments(&comments, &settings(), "bob").unwrap_err();
        match err {
            CommandError::NotPrivileged { self_pr, .. } => assert!(self_pr),
            other => panic!("expected NotPrivileged, got {:?}", other),
        }
    }

    #[test]
    fn admin_can_bypass_on_other_prs() {
        let comments = vec![comment(1, "alice", "@waterflow bypass_build_status")];
        let scan = scan_comments(&comments, &settings(), "bob").unwrap();
        assert!(scan.options.bypass_build_status);
    }

    #[test]
    fn admin_cannot_bypass_own_pr() {
        let comments = vec![comment(1, "alice", "@waterflow bypass_build_status")];
        assert!(scan_comments(&comments, &settings(), "alice").is_err());
    }

    #[test]
    fn pr_author_options_grant_self_bypass() {
        let mut settings = settings();
        settings
            .pr_author_options
            .insert("bob".to_string(), vec!["bypass_jira_check".to_string()]);
        let comments = vec![comment(1, "bob", "@waterflow bypass_jira_check")];
        let scan = scan_comments(&comments, &settings, "bob").unwrap();
        assert!(scan.options.bypass_jira_check);
    }

    #[test]
    fn unknown_token_is_reported() {
        let comments = vec![comment(1, "bob", "@waterflow frobnicate")];
        let err = scan_comments(&comments, &settings(), "bob").unwrap_err();
        assert!(matches!(err, CommandError::Unknown { .. }));
        assert_eq!(err.into_message().code(), 122);
    }

    #[test]
    fn after_pull_request_parses_values() {
        let comments = vec![
            comment(1, "bob", "@waterflow after_pull_request=12"),
            comment(2, "bob", "/after_pull_request=#34 wait"),
        ];
        let scan = scan_comments(&comments, &settings(), "bob").unwrap();
        assert_eq!(scan.options.after_pull_request, vec![PrId(12), PrId(34)]);
        assert!(scan.options.wait);
    }

    #[test]
    fn commands_only_counted_after_last_robot_comment() {
        let comments = vec![
            comment(1, "bob", "@waterflow reset"),
            comment(2, "waterflow", "done"),
            comment(3, "bob", "@waterflow help"),
        ];
        let scan = scan_comments(&comments, &settings(), "bob").unwrap();
        assert_eq!(
            scan.commands,
            vec![CommandCall {
                token: CommandToken::Help,
                author: "bob".to_string()
            }]
        );
    }

    #[test]
    fn mention_must_be_exact() {
        let comments = vec![comment(1, "bob", "@waterflowers approve")];
        let scan = scan_comments(&comments, &settings(), "bob").unwrap();
        assert!(!scan.options.approve);
        // mid-line mentions are prose, not commands
        let comments = vec![comment(1, "bob", "ask @waterflow approve for me")];
        let scan = scan_comments(&comments, &settings(), "bob").unwrap();
        assert!(!scan.options.approve);
    }

    #[test]
    fn mention_is_case_insensitive() {
        let comments = vec![comment(1, "bob", "@WaterFlow wait")];
        let scan = scan_comments(&comments, &settings(), "bob").unwrap();
        assert!(scan.options.wait);
    }

    #[test]
    fn plain_chatter_is_ignored() {
        let comments = vec![comment(1, "bob", "looks good to me!\nshipit")];
        let scan = scan_comments(&comments, &settings(), "bob").unwrap();
        assert_eq!(scan.options, EffectiveOptions::default());
        assert!(scan.commands.is_empty());
    }

    #[test]
    fn deleting_a_comment_withdraws_its_option() {
        let with = vec![comment(1, "bob", "@waterflow wait")];
        let scan = scan_comments(&with, &settings(), "bob").unwrap();
        assert!(scan.options.wait);
        // the comment list without it: the option is gone
        let scan = scan_comments(&[], &settings(), "bob").unwrap();
        assert!(!scan.options.wait);
    }

    #[test]
    fn multiple_options_on_one_line() {
        let comments = vec![comment(1, "alice", "@waterflow bypass_peer_approval bypass_build_status")];
        let scan = scan_comments(&comments, &settings(), "bob").unwrap();
        assert!(scan.options.bypass_peer_approval);
        assert!(scan.options.bypass_build_status);
    }
}
