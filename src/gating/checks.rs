//! The fixed-order check chain.
//!
//! `evaluate` maps a `PrFacts` record to a verdict. Checks run in a fixed
//! order and the first failure wins; each has a stable status code and, for
//! most, a bypass option carried in the facts. The function is pure:
//! running it twice on the same facts yields the same verdict.

use tracing::warn;

use crate::branches::DestinationKind;
use crate::hosting::BuildStatus;
use crate::messages::Message;
use crate::settings::RepositorySettings;

use super::facts::{IntegrationState, IssueFacts, PrFacts};

/// Why the evaluation ended without either a merge or a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Integration branches have not been requested yet (lazy creation).
    AwaitingIntegration,
    /// No build has been reported on some tip yet.
    BuildNotStarted,
    /// A build is still running.
    BuildInProgress,
    /// The `wait` option is set.
    WaitRequested,
}

/// Outcome of an evaluation.
#[derive(Debug)]
pub enum Verdict {
    /// Every check passed: queue (or merge) the pull request.
    Ready,
    /// A check failed with a user-facing message.
    Blocked(Box<Message>),
    /// Nothing to tell the user; re-evaluate on the next event.
    Waiting(WaitReason),
}

/// Runs the check chain over the facts.
pub fn evaluate(facts: &PrFacts, settings: &RepositorySettings) -> Verdict {
    let checks: [fn(&PrFacts, &RepositorySettings) -> Verdict; 10] = [
        check_compatibility,
        check_commit_diff,
        check_issue,
        check_integration_materialized,
        check_history,
        check_conflict,
        check_approvals,
        check_dependencies,
        check_builds,
        check_wait,
    ];
    for check in checks {
        match check(facts, settings) {
            Verdict::Ready => continue,
            blocked => return blocked,
        }
    }
    Verdict::Ready
}

/// Check 4 (code 106): the source prefix must be compatible with the
/// destination kind. New features never land on maintenance-only lines.
fn check_compatibility(facts: &PrFacts, _settings: &RepositorySettings) -> Verdict {
    if facts.options.bypass_incompatible_branch {
        return Verdict::Ready;
    }
    let target = facts.cascade.target();
    let maintenance_only = matches!(
        target.kind,
        DestinationKind::Stabilization | DestinationKind::Hotfix
    );
    if maintenance_only && !facts.source.prefix.includes_stabilization() {
        return Verdict::Blocked(Box::new(Message::IncompatibleBranch {
            source: facts.source.prefix.to_string(),
            destination: target.name.clone(),
        }));
    }
    Verdict::Ready
}

/// Check 5 (code 134): the source must not lag too far behind its
/// destination. Facts collection clamps the distance at 0 (and warns)
/// when a rebase made the previous observation stale.
fn check_commit_diff(facts: &PrFacts, settings: &RepositorySettings) -> Verdict {
    if settings.max_commit_diff == 0 {
        return Verdict::Ready;
    }
    if facts.commits_behind > settings.max_commit_diff {
        return Verdict::Blocked(Box::new(Message::SourceDiverged {
            commits: facts.commits_behind,
            limit: settings.max_commit_diff,
        }));
    }
    Verdict::Ready
}

/// Checks 6-11 (codes 107-112): tracker-issue consistency.
fn check_issue(facts: &PrFacts, settings: &RepositorySettings) -> Verdict {
    if facts.options.bypass_jira_check {
        return Verdict::Ready;
    }
    let issue = match &facts.issue {
        None => return Verdict::Ready,
        Some(IssueFacts::MissingKey) => {
            return Verdict::Blocked(Box::new(Message::MissingIssueKey {
                source: facts.source.name.clone(),
                destination: facts.cascade.target().name.clone(),
            }));
        }
        Some(IssueFacts::NotFound { key }) => {
            return Verdict::Blocked(Box::new(Message::IssueNotFound {
                issue: key.clone(),
            }));
        }
        Some(IssueFacts::Found(issue)) => issue,
    };

    if !settings.jira_keys.iter().any(|k| *k == issue.project) {
        return Verdict::Blocked(Box::new(Message::WrongProject {
            issue: issue.key.clone(),
            expected: settings.jira_keys.clone(),
        }));
    }

    if issue.is_subtask {
        return Verdict::Blocked(Box::new(Message::SubtaskNotSupported {
            issue: issue.key.clone(),
        }));
    }

    if let Some(expected_prefix) = settings.prefixes.get(&issue.issue_type)
        && expected_prefix != facts.source.prefix.as_str()
    {
        return Verdict::Blocked(Box::new(Message::TypePrefixMismatch {
            prefix: facts.source.prefix.to_string(),
            issue_type: issue.issue_type.clone(),
            expected_prefix: Some(expected_prefix.clone()),
        }));
    }

    if !settings.disable_version_checks {
        let mut found: Vec<String> = issue.fix_versions.clone();
        let mut expected: Vec<String> = facts.cascade.target_versions.clone();
        found.sort();
        expected.sort();
        if found != expected {
            return Verdict::Blocked(Box::new(Message::FixVersionMismatch {
                issue: issue.key.clone(),
                found,
                expected,
            }));
        }
    }
    Verdict::Ready
}

/// Check 12 (no code): integration branches exist, or nothing to do until
/// somebody asks for them.
fn check_integration_materialized(facts: &PrFacts, _settings: &RepositorySettings) -> Verdict {
    match facts.integration {
        IntegrationState::NotMaterialized => Verdict::Waiting(WaitReason::AwaitingIntegration),
        _ => Verdict::Ready,
    }
}

/// Check 13 (code 113): no foreign history on the first integration branch.
fn check_history(facts: &PrFacts, _settings: &RepositorySettings) -> Verdict {
    if let IntegrationState::HistoryMismatch { commit, branch } = &facts.integration {
        return Verdict::Blocked(Box::new(Message::HistoryMismatch {
            commit: commit.clone(),
            integration_branch: branch.clone(),
            feature_branch: facts.source.name.clone(),
            development_branch: facts.cascade.target().name.clone(),
        }));
    }
    Verdict::Ready
}

/// Check 14 (code 114): the cascade merged without conflict.
fn check_conflict(facts: &PrFacts, _settings: &RepositorySettings) -> Verdict {
    if let IntegrationState::Conflict {
        source,
        branch,
        on_first,
    } = &facts.integration
    {
        return Verdict::Blocked(Box::new(Message::Conflict {
            source: source.clone(),
            integration_branch: branch.clone(),
            development_branch: facts.cascade.target().name.clone(),
            feature_branch: facts.source.name.clone(),
            on_feature_branch: *on_first,
        }));
    }
    Verdict::Ready
}

/// Checks 15-17 (code 115): author, peer and leader approvals, and no
/// outstanding change request.
fn check_approvals(facts: &PrFacts, settings: &RepositorySettings) -> Verdict {
    let approvals = &facts.approvals;

    let missing_author = settings.need_author_approval
        && approvals.author_approval_supported
        && !facts.options.bypass_author_approval
        && !facts.options.approve
        && !approvals.author_approved;

    let peer_count = if facts.options.bypass_peer_approval {
        settings.required_peer_approvals
    } else {
        approvals.peer_approvers.len()
    };
    let missing_peers = settings.required_peer_approvals.saturating_sub(peer_count);

    let leader_count = if facts.options.bypass_leader_approval {
        settings.required_leader_approvals
    } else {
        approvals
            .peer_approvers
            .iter()
            .filter(|a| settings.project_leaders.contains(a))
            .count()
    };
    let missing_leaders = settings
        .required_leader_approvals
        .saturating_sub(leader_count);

    let change_requesters = if facts.options.bypass_peer_approval {
        Vec::new()
    } else {
        approvals.change_requesters.clone()
    };

    if missing_author || missing_peers > 0 || missing_leaders > 0 || !change_requesters.is_empty()
    {
        return Verdict::Blocked(Box::new(Message::ApprovalsNeeded {
            missing_author,
            missing_peers,
            missing_leaders,
            change_requesters,
        }));
    }
    Verdict::Ready
}

/// Check 18 (code 120): declared dependencies must be merged.
fn check_dependencies(facts: &PrFacts, _settings: &RepositorySettings) -> Verdict {
    if facts.dependencies.all_merged() {
        return Verdict::Ready;
    }
    Verdict::Blocked(Box::new(Message::AfterPullRequest {
        opened: facts.dependencies.opened.clone(),
        declined: facts.dependencies.declined.clone(),
    }))
}

/// Check 19 (code 118): every relevant tip built green.
fn check_builds(facts: &PrFacts, settings: &RepositorySettings) -> Verdict {
    if facts.options.bypass_build_status || settings.build_key.is_empty() {
        return Verdict::Ready;
    }
    let Some(worst) = facts.builds.iter().max_by_key(|b| b.status.severity()) else {
        return Verdict::Ready;
    };
    match worst.status {
        BuildStatus::Successful => Verdict::Ready,
        BuildStatus::InProgress => Verdict::Waiting(WaitReason::BuildInProgress),
        BuildStatus::NotStarted => Verdict::Waiting(WaitReason::BuildNotStarted),
        BuildStatus::Failed | BuildStatus::Stopped => {
            warn!(branch = %worst.branch, commit = %worst.commit, "build failed");
            Verdict::Blocked(Box::new(Message::BuildFailed {
                branch: worst.branch.clone(),
                commit: worst.commit.clone(),
            }))
        }
    }
}

/// Check 20 (no code): the `wait` option holds everything back.
fn check_wait(facts: &PrFacts, _settings: &RepositorySettings) -> Verdict {
    if facts.options.wait {
        Verdict::Waiting(WaitReason::WaitRequested)
    } else {
        Verdict::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branches::SourceBranch;
    use crate::cascade::CascadeSet;
    use crate::branches::SourcePrefix;
    use crate::commands::EffectiveOptions;
    use crate::gating::facts::{
        ApprovalFacts, BuildFacts, DependencyFacts, IntegrationState, IssueFacts,
    };
    use crate::hosting::{PrState, PullRequest};
    use crate::tracker::Issue;
    use crate::types::{PrId, Sha};

    fn sha(n: u64) -> Sha {
        Sha::parse(format!("{:0>40x}", n)).unwrap()
    }

    fn settings() -> RepositorySettings {
        RepositorySettings {
            repository_owner: "acme".to_string(),
            repository_slug: "widget".to_string(),
            required_peer_approvals: 2,
            required_leader_approvals: 1,
            project_leaders: vec!["lea".to_string()],
            jira_keys: vec!["PROJ".to_string()],
            ..Default::default()
        }
    }

    fn green_facts() -> PrFacts {
        let refs = CascadeSet::from_refs(["development/1.0", "development/2.0"], []);
        let cascade = refs
            .finalize("development/1.0", &SourcePrefix::Bugfix)
            .unwrap();
        PrFacts {
            pr: PullRequest {
                id: PrId(1),
                title: "fix".to_string(),
                author: "bob".to_string(),
                src_branch: "bugfix/PROJ-1-x".to_string(),
                dst_branch: "development/1.0".to_string(),
                src_commit: sha(1),
                state: PrState::Open,
                description: String::new(),
            },
            source: SourceBranch::parse("bugfix/PROJ-1-x", &[]).unwrap(),
            cascade,
            options: EffectiveOptions::default(),
            commands: Vec::new(),
            approvals: ApprovalFacts {
                author_approved: true,
                author_approval_supported: true,
                peer_approvers: vec!["lea".to_string(), "carol".to_string()],
                change_requesters: Vec::new(),
            },
            commits_behind: 0,
            issue: Some(IssueFacts::Found(Issue {
                key: "PROJ-1".to_string(),
                project: "PROJ".to_string(),
                issue_type: "Bug".to_string(),
                is_subtask: false,
                fix_versions: vec!["1.0.0".to_string(), "2.0.0".to_string()],
            })),
            integration: IntegrationState::Clean {
                branches: vec!["w/2.0/bugfix/PROJ-1-x".to_string()],
                created_any: false,
            },
            builds: vec![BuildFacts {
                branch: "w/2.0/bugfix/PROJ-1-x".to_string(),
                commit: sha(2),
                status: BuildStatus::Successful,
            }],
            dependencies: DependencyFacts::default(),
        }
    }

    fn code(verdict: Verdict) -> u16 {
        match verdict {
            Verdict::Blocked(message) => message.code(),
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    fn issue_mut(facts: &mut PrFacts) -> &mut Issue {
        match facts.issue.as_mut() {
            Some(IssueFacts::Found(issue)) => issue,
            other => panic!("expected a found issue, got {:?}", other),
        }
    }

    #[test]
    fn all_green_facts_are_ready() {
        // the green fixture's fix versions must match the derived targets
        let mut facts = green_facts();
        issue_mut(&mut facts).fix_versions = facts.cascade.target_versions.clone();
        assert!(matches!(evaluate(&facts, &settings()), Verdict::Ready));
    }

    #[test]
    fn evaluation_is_idempotent() {
        let facts = green_facts();
        let settings = settings();
        let first = format!("{:?}", evaluate(&facts, &settings));
        let second = format!("{:?}", evaluate(&facts, &settings));
        assert_eq!(first, second);
    }

    #[test]
    fn feature_to_stabilization_is_incompatible() {
        let refs = CascadeSet::from_refs(
            ["development/1.0", "stabilization/1.0.3", "development/2.0"],
            [],
        );
        let mut facts = green_facts();
        facts.source = SourceBranch::parse("feature/PROJ-1-x", &[]).unwrap();
        facts.cascade = refs
            .finalize("stabilization/1.0.3", &SourcePrefix::Feature)
            .unwrap();
        assert_eq!(code(evaluate(&facts, &settings())), 106);

        facts.options.bypass_incompatible_branch = true;
        assert!(!matches!(
            evaluate(&facts, &settings()),
            Verdict::Blocked(m) if m.code() == 106
        ));
    }

    #[test]
    fn commit_diff_limit_applies_when_configured() {
        let mut facts = green_facts();
        facts.commits_behind = 30;
        let mut settings = settings();
        assert!(!matches!(evaluate(&facts, &settings), Verdict::Blocked(_)));

        settings.max_commit_diff = 10;
        assert_eq!(code(evaluate(&facts, &settings)), 134);
    }

    #[test]
    fn missing_issue_key_is_reported() {
        let mut facts = green_facts();
        facts.issue = Some(IssueFacts::MissingKey);
        assert_eq!(code(evaluate(&facts, &settings())), 107);
    }

    #[test]
    fn missing_issue_is_reported() {
        let mut facts = green_facts();
        facts.issue = Some(IssueFacts::NotFound {
            key: "PROJ-1".to_string(),
        });
        assert_eq!(code(evaluate(&facts, &settings())), 108);
    }

    #[test]
    fn wrong_project_is_reported() {
        let mut facts = green_facts();
        issue_mut(&mut facts).project = "OTHER".to_string();
        assert_eq!(code(evaluate(&facts, &settings())), 110);
    }

    #[test]
    fn subtask_is_reported() {
        let mut facts = green_facts();
        issue_mut(&mut facts).is_subtask = true;
        assert_eq!(code(evaluate(&facts, &settings())), 109);
    }

    #[test]
    fn type_prefix_mismatch_is_reported() {
        let mut facts = green_facts();
        let mut settings = settings();
        settings
            .prefixes
            .insert("Story".to_string(), "feature".to_string());
        issue_mut(&mut facts).issue_type = "Story".to_string();
        assert_eq!(code(evaluate(&facts, &settings)), 111);
    }

    #[test]
    fn fix_version_mismatch_is_reported() {
        let mut facts = green_facts();
        issue_mut(&mut facts).fix_versions = vec!["9.9.9".to_string()];
        assert_eq!(code(evaluate(&facts, &settings())), 112);

        let mut settings = settings();
        settings.disable_version_checks = true;
        assert!(!matches!(evaluate(&facts, &settings), Verdict::Blocked(_)));
    }

    #[test]
    fn bypass_jira_check_skips_issue_checks() {
        let mut facts = green_facts();
        facts.issue = Some(IssueFacts::NotFound {
            key: "PROJ-1".to_string(),
        });
        facts.options.bypass_jira_check = true;
        assert!(!matches!(evaluate(&facts, &settings()), Verdict::Blocked(_)));
    }

    #[test]
    fn history_mismatch_blocks_before_approvals() {
        let mut facts = green_facts();
        facts.integration = IntegrationState::HistoryMismatch {
            commit: sha(7),
            branch: "w/2.0/bugfix/PROJ-1-x".to_string(),
        };
        // approvals are also missing, but 113 comes first in the chain
        facts.approvals = ApprovalFacts {
            author_approval_supported: true,
            ..Default::default()
        };
        assert_eq!(code(evaluate(&facts, &settings())), 113);
    }

    #[test]
    fn conflict_is_reported() {
        let mut facts = green_facts();
        facts.integration = IntegrationState::Conflict {
            source: "bugfix/PROJ-1-x".to_string(),
            branch: "w/2.0/bugfix/PROJ-1-x".to_string(),
            on_first: true,
        };
        assert_eq!(code(evaluate(&facts, &settings())), 114);
    }

    #[test]
    fn missing_approvals_are_itemized() {
        let mut facts = green_facts();
        facts.approvals = ApprovalFacts {
            author_approved: false,
            author_approval_supported: true,
            peer_approvers: vec!["carol".to_string()],
            change_requesters: vec!["dave".to_string()],
        };
        match evaluate(&facts, &settings()) {
            Verdict::Blocked(message) => match *message {
                Message::ApprovalsNeeded {
                    missing_author,
                    missing_peers,
                    missing_leaders,
                    ref change_requesters,
                } => {
                    assert!(missing_author);
                    assert_eq!(missing_peers, 1);
                    assert_eq!(missing_leaders, 1);
                    assert_eq!(change_requesters, &vec!["dave".to_string()]);
                }
                ref other => panic!("expected ApprovalsNeeded, got {:?}", other),
            },
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    #[test]
    fn author_check_skipped_when_unsupported() {
        let mut facts = green_facts();
        facts.approvals.author_approved = false;
        facts.approvals.author_approval_supported = false;
        assert!(matches!(evaluate(&facts, &settings()), Verdict::Ready));
    }

    #[test]
    fn approve_option_stands_in_for_author_approval() {
        let mut facts = green_facts();
        facts.approvals.author_approved = false;
        facts.options.approve = true;
        assert!(matches!(evaluate(&facts, &settings()), Verdict::Ready));
    }

    #[test]
    fn bypasses_waive_peer_and_leader_approvals() {
        let mut facts = green_facts();
        facts.approvals.peer_approvers = Vec::new();
        facts.options.bypass_peer_approval = true;
        facts.options.bypass_leader_approval = true;
        assert!(matches!(evaluate(&facts, &settings()), Verdict::Ready));
    }

    #[test]
    fn open_dependencies_block() {
        let mut facts = green_facts();
        facts.dependencies = DependencyFacts {
            opened: vec![PrId(7)],
            declined: Vec::new(),
        };
        assert_eq!(code(evaluate(&facts, &settings())), 120);
    }

    #[test]
    fn failed_build_blocks() {
        let mut facts = green_facts();
        facts.builds[0].status = BuildStatus::Failed;
        assert_eq!(code(evaluate(&facts, &settings())), 118);

        facts.options.bypass_build_status = true;
        assert!(matches!(evaluate(&facts, &settings()), Verdict::Ready));
    }

    #[test]
    fn pending_build_waits_silently() {
        let mut facts = green_facts();
        facts.builds[0].status = BuildStatus::InProgress;
        assert!(matches!(
            evaluate(&facts, &settings()),
            Verdict::Waiting(WaitReason::BuildInProgress)
        ));

        facts.builds[0].status = BuildStatus::NotStarted;
        assert!(matches!(
            evaluate(&facts, &settings()),
            Verdict::Waiting(WaitReason::BuildNotStarted)
        ));
    }

    #[test]
    fn worst_build_status_wins() {
        let mut facts = green_facts();
        facts.builds.push(BuildFacts {
            branch: "w/3.0/bugfix/PROJ-1-x".to_string(),
            commit: sha(9),
            status: BuildStatus::Failed,
        });
        assert_eq!(code(evaluate(&facts, &settings())), 118);
    }

    #[test]
    fn wait_option_holds_a_green_pr() {
        let mut facts = green_facts();
        facts.options.wait = true;
        assert!(matches!(
            evaluate(&facts, &settings()),
            Verdict::Waiting(WaitReason::WaitRequested)
        ));
    }

    #[test]
    fn unmaterialized_integration_waits() {
        let mut facts = green_facts();
        facts.integration = IntegrationState::NotMaterialized;
        assert!(matches!(
            evaluate(&facts, &settings()),
            Verdict::Waiting(WaitReason::AwaitingIntegration)
        ));
    }
}
