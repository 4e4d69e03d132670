//! The merge queue.
//!
//! Approved pull requests are serialized through per-destination lanes.
//! Each destination `d` has a fast-forward-only lane branch `q/<version>`;
//! a PR admitted to the queue contributes one `q/w/<pr>/<version>/<src>`
//! item branch per lane, chained onto the previous item (or the
//! destination when the lane was empty). Builds run on the item tips;
//! promotion fast-forwards every destination to the longest green prefix.
//!
//! Ground truth is the set of `q/*` branches; nothing else is persisted.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::branches::{
    DestinationBranch, QueueRef, SourceBranch, Version, integration_branch_name, queue_item_name,
    queue_lane_name,
};
use crate::cascade::{Cascade, CascadeSet};
use crate::git::{GitError, MergeOutcome, Workspace};
use crate::hosting::BuildStatus;
use crate::types::{PrId, Sha};

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Git(#[from] GitError),
}

/// One defect found while validating the queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueIssue {
    /// Item branches exist on a version with no `q/<version>` lane.
    MissingLane { version: Version },

    /// A lane exists for a version with no matching destination branch.
    UnknownLane { version: Version },

    /// The lane no longer contains its destination's tip.
    LaneBehindDestination { lane: String },

    /// An empty lane must point exactly at its destination.
    LaneNotInSync { lane: String },

    /// The lane tip and the newest item tip disagree.
    LaneDiverged { lane: String },

    /// An item does not contain its predecessor in the lane.
    BrokenChain { upper: String, lower: String },

    /// The per-lane sequences disagree with the admission order.
    InconsistentOrder,
}

/// One PR's contribution in one lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub pr: PrId,
    pub version: Version,
    pub branch: String,
    pub tip: Sha,
    pub source: String,
}

#[derive(Debug)]
struct Lane {
    version: Version,
    /// `q/<version>`, when the lane branch exists.
    branch: Option<String>,
    tip: Option<Sha>,
    destination: Option<DestinationBranch>,
    /// Items oldest-first (each item contains its predecessor).
    items: Vec<QueueItem>,
}

/// The queues of the repository, rebuilt from `q/*` refs on every use.
#[derive(Debug)]
pub struct QueueCollection {
    lanes: Vec<Lane>,
    merge_paths: Vec<Vec<Version>>,
}

impl QueueCollection {
    /// Collects `q/*` branches from the remote and orders the items of
    /// each lane by ancestry.
    pub fn build(workspace: &mut Workspace, refs: &CascadeSet) -> Result<Self, QueueError> {
        let mut lanes: Vec<Lane> = Vec::new();
        let heads: Vec<(String, Sha)> = workspace
            .remote_heads()?
            .iter()
            .map(|(name, sha)| (name.clone(), sha.clone()))
            .collect();

        for (name, tip) in heads {
            let Some(queue_ref) = QueueRef::parse(&name) else {
                continue;
            };
            match queue_ref {
                QueueRef::Lane { version } => {
                    let lane = lane_mut(&mut lanes, version, refs);
                    lane.branch = Some(name);
                    lane.tip = Some(tip);
                }
                QueueRef::Item {
                    pr,
                    version,
                    source,
                } => {
                    let item = QueueItem {
                        pr,
                        version,
                        branch: name,
                        tip,
                        source,
                    };
                    let lane = lane_mut(&mut lanes, version, refs);
                    // ancestry insertion: an item goes before the first
                    // existing item that contains it
                    let mut position = lane.items.len();
                    for (index, existing) in lane.items.iter().enumerate() {
                        if workspace.includes_commit(existing.tip.as_str(), item.tip.as_str())? {
                            position = index;
                            break;
                        }
                    }
                    lane.items.insert(position, item);
                }
            }
        }

        lanes.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(QueueCollection {
            lanes,
            merge_paths: refs.merge_paths(),
        })
    }

    /// True when nothing is queued anywhere.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|l| l.items.is_empty())
    }

    pub fn is_queued(&self, pr: PrId) -> bool {
        self.lanes
            .iter()
            .any(|l| l.items.iter().any(|i| i.pr == pr))
    }

    /// Every item of every lane.
    pub fn items(&self) -> impl Iterator<Item = &QueueItem> {
        self.lanes.iter().flat_map(|l| l.items.iter())
    }

    /// All lane and item branch names.
    pub fn branch_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for lane in &self.lanes {
            if let Some(branch) = &lane.branch {
                names.push(branch.clone());
            }
            names.extend(lane.items.iter().map(|i| i.branch.clone()));
        }
        names
    }

    /// Queued PRs in admission order (oldest first). Hotfix-lane PRs are
    /// listed first: they never appear in the development lanes.
    pub fn queued_prs(&self) -> Vec<PrId> {
        let mut prs: Vec<PrId> = Vec::new();
        for path in &self.merge_paths {
            for pr in self.path_order(path) {
                if !prs.contains(&pr) {
                    prs.push(pr);
                }
            }
        }
        // single-lane hotfix paths come first, like their own queue
        prs.sort_by_key(|pr| {
            let on_dev_path = self
                .merge_paths
                .first()
                .is_some_and(|path| self.path_order(path).contains(pr));
            on_dev_path
        });
        prs
    }

    /// The admission order on one merge path: the item sequence of the
    /// newest lane of the path (every queued PR's cascade reaches it).
    fn path_order(&self, path: &[Version]) -> Vec<PrId> {
        let Some(last) = path.last() else {
            return Vec::new();
        };
        self.lanes
            .iter()
            .find(|lane| lane.version == *last)
            .map(|lane| lane.items.iter().map(|i| i.pr).collect())
            .unwrap_or_default()
    }

    fn lanes_on_path<'a>(&'a self, path: &'a [Version]) -> impl Iterator<Item = &'a Lane> {
        self.lanes
            .iter()
            .filter(move |lane| path.contains(&lane.version))
    }

    /// Checks the queues for coherence. An empty result means promotion is
    /// safe; anything else requires operator action (rebuild or delete).
    pub fn validate(&self, workspace: &Workspace) -> Result<Vec<QueueIssue>, QueueError> {
        let mut issues = Vec::new();

        for lane in &self.lanes {
            self.validate_lane(workspace, lane, &mut issues)?;
        }
        for path in &self.merge_paths {
            self.validate_path(workspace, path, &mut issues)?;
        }
        if !issues.is_empty() {
            warn!(?issues, "queues failed validation");
        }
        Ok(issues)
    }

    fn validate_lane(
        &self,
        workspace: &Workspace,
        lane: &Lane,
        issues: &mut Vec<QueueIssue>,
    ) -> Result<(), QueueError> {
        let Some(branch) = &lane.branch else {
            issues.push(QueueIssue::MissingLane {
                version: lane.version,
            });
            return Ok(());
        };
        let Some(destination) = &lane.destination else {
            issues.push(QueueIssue::UnknownLane {
                version: lane.version,
            });
            return Ok(());
        };

        if !workspace.includes_commit(branch, &destination.name)? {
            issues.push(QueueIssue::LaneBehindDestination {
                lane: branch.clone(),
            });
        }

        match lane.items.last() {
            None => {
                let lane_tip = workspace.branch_tip(branch)?;
                let dst_tip = workspace.branch_tip(&destination.name)?;
                if lane_tip != dst_tip {
                    issues.push(QueueIssue::LaneNotInSync {
                        lane: branch.clone(),
                    });
                }
            }
            Some(newest) => {
                if lane.tip.as_ref() != Some(&newest.tip) {
                    issues.push(QueueIssue::LaneDiverged {
                        lane: branch.clone(),
                    });
                }
            }
        }

        // every item must contain its predecessor, the oldest must contain
        // the destination
        let mut previous = destination.name.clone();
        for item in &lane.items {
            if !workspace.includes_commit(item.branch.as_str(), &previous)? {
                issues.push(QueueIssue::BrokenChain {
                    upper: item.branch.clone(),
                    lower: previous.clone(),
                });
            }
            previous = item.branch.clone();
        }
        Ok(())
    }

    fn validate_path(
        &self,
        workspace: &Workspace,
        path: &[Version],
        issues: &mut Vec<QueueIssue>,
    ) -> Result<(), QueueError> {
        // once anything is queued on the path, every newer version of the
        // path must have its lane
        let mut seen = false;
        for version in path {
            let lane = self.lanes.iter().find(|l| l.version == *version);
            let has_branch = lane.is_some_and(|l| l.branch.is_some());
            if seen && !has_branch {
                issues.push(QueueIssue::MissingLane { version: *version });
            }
            seen |= lane.is_some();
        }

        let order = self.path_order(path);

        for lane in self.lanes_on_path(path) {
            let lane_prs: Vec<PrId> = lane.items.iter().map(|i| i.pr).collect();
            if !is_subsequence(&lane_prs, &order) {
                issues.push(QueueIssue::InconsistentOrder);
                return Ok(());
            }
        }

        // vertical inclusion: a PR's item in a newer lane contains its item
        // in an older lane
        for pr in &order {
            let mut previous: Option<&QueueItem> = None;
            for lane in self.lanes_on_path(path) {
                let Some(item) = lane.items.iter().find(|i| i.pr == *pr) else {
                    continue;
                };
                if let Some(lower) = previous
                    && !workspace.includes_commit(item.branch.as_str(), lower.branch.as_str())?
                {
                    issues.push(QueueIssue::BrokenChain {
                        upper: item.branch.clone(),
                        lower: lower.branch.clone(),
                    });
                }
                previous = Some(item);
            }
        }
        Ok(())
    }

    /// The longest prefix of the admission order that can merge, given the
    /// build statuses of the item tips.
    ///
    /// Only the newest remaining tip of each lane is consulted: a green
    /// build there validates every item it contains. When that tip is not
    /// green, the PR that produced it and everything admitted after it are
    /// dropped, and the lookup recurses on the rest.
    pub fn mergeable_prs(&self, statuses: &HashMap<Sha, BuildStatus>) -> Vec<PrId> {
        let mut mergeable = Vec::new();
        for path in &self.merge_paths {
            for pr in self.mergeable_on_path(path, statuses) {
                if !mergeable.contains(&pr) {
                    mergeable.push(pr);
                }
            }
        }
        mergeable
    }

    fn mergeable_on_path(
        &self,
        path: &[Version],
        statuses: &HashMap<Sha, BuildStatus>,
    ) -> Vec<PrId> {
        let mut order = self.path_order(path);
        'shrink: loop {
            if order.is_empty() {
                return order;
            }
            for lane in self.lanes_on_path(path) {
                let newest_remaining = lane
                    .items
                    .iter()
                    .rev()
                    .find(|item| order.contains(&item.pr));
                let Some(item) = newest_remaining else {
                    continue;
                };
                let status = statuses
                    .get(&item.tip)
                    .copied()
                    .unwrap_or(BuildStatus::NotStarted);
                if status != BuildStatus::Successful {
                    debug!(pr = %item.pr, branch = %item.branch, ?status, "queue tip not green");
                    // drop the failed PR and everything admitted after it
                    let position = order
                        .iter()
                        .position(|pr| *pr == item.pr)
                        .unwrap_or(0);
                    order.truncate(position);
                    continue 'shrink;
                }
            }
            return order;
        }
    }

    /// PRs whose newest queue tip reports a failed build, for notification.
    pub fn failed_items(&self, statuses: &HashMap<Sha, BuildStatus>) -> Vec<&QueueItem> {
        let mut failed = Vec::new();
        for lane in &self.lanes {
            if let Some(newest) = lane.items.last()
                && statuses
                    .get(&newest.tip)
                    .is_some_and(|status| status.is_failed())
            {
                failed.push(newest);
            }
        }
        failed
    }
}

fn lane_mut<'a>(lanes: &'a mut Vec<Lane>, version: Version, refs: &CascadeSet) -> &'a mut Lane {
    if let Some(index) = lanes.iter().position(|l| l.version == version) {
        return &mut lanes[index];
    }
    let destination = refs
        .destinations()
        .iter()
        .find(|d| d.version == version)
        .cloned();
    lanes.push(Lane {
        version,
        branch: None,
        tip: None,
        destination,
        items: Vec::new(),
    });
    lanes.last_mut().expect("just pushed")
}

fn is_subsequence(needle: &[PrId], haystack: &[PrId]) -> bool {
    let mut iter = haystack.iter();
    needle.iter().all(|n| iter.any(|h| h == n))
}

/// Outcome of an admission attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// The PR is queued; the new item branches are listed.
    Queued { branches: Vec<String> },
    /// The changeset conflicts with queued content; nothing was pushed.
    Conflict,
}

/// Admits a pull request to the queue.
///
/// For each destination of the cascade, the matching integration branch is
/// merged onto the lane tip and a `q/w/` item branch is cut there. The
/// first lane takes the source branch itself (there is no integration
/// branch for the PR's own target). Everything is pushed in one atomic
/// push, or nothing is.
pub fn admit(
    workspace: &mut Workspace,
    cascade: &Cascade,
    source: &SourceBranch,
    pr: PrId,
) -> Result<AdmitOutcome, QueueError> {
    let mut to_push: Vec<String> = Vec::new();
    let mut previous_item: Option<String> = None;

    for (index, destination) in cascade.destinations.iter().enumerate() {
        let lane = queue_lane_name(&destination.version);
        if workspace.remote_branch_exists(&lane)? {
            workspace.create_branch(&lane, &lane)?;
        } else {
            workspace.create_branch(&lane, &destination.name)?;
        }

        let contribution = if index == 0 {
            source.name.clone()
        } else {
            integration_branch_name(&destination.version, &source.name)
        };

        let outcome = match &previous_item {
            None => workspace.merge(&contribution)?,
            Some(previous) => {
                workspace.robust_merge(&[contribution.as_str(), previous.as_str()])?
            }
        };
        if let MergeOutcome::Conflict { conflicting_files } = outcome {
            info!(lane = %lane, ?conflicting_files, "queue admission conflict");
            return Ok(AdmitOutcome::Conflict);
        }

        let item = queue_item_name(pr, &destination.version, &source.name);
        workspace.create_branch(&item, &lane)?;
        to_push.push(lane);
        to_push.push(item.clone());
        previous_item = Some(item);
    }

    let refs: Vec<&str> = to_push.iter().map(String::as_str).collect();
    workspace.push(&refs, false)?;
    info!(%pr, "admitted to the merge queue");
    Ok(AdmitOutcome::Queued {
        branches: to_push
            .into_iter()
            .filter(|name| name.starts_with("q/w/"))
            .collect(),
    })
}

/// Result of a promotion.
#[derive(Debug, Default)]
pub struct Promotion {
    /// PRs whose queued content reached the destinations, admission order.
    pub merged_prs: Vec<PrId>,
}

/// Fast-forwards every destination to the given green prefix and removes
/// the merged item branches. Destinations advance in one atomic push; if
/// that push fails nothing has moved, and the next job re-reads ground
/// truth and repeats.
pub fn promote(
    workspace: &mut Workspace,
    queues: &QueueCollection,
    mergeable: &[PrId],
) -> Result<Promotion, QueueError> {
    if mergeable.is_empty() {
        return Ok(Promotion::default());
    }

    let mut advanced: Vec<String> = Vec::new();
    let mut merged_items: Vec<String> = Vec::new();

    for lane in &queues.lanes {
        let Some(destination) = &lane.destination else {
            continue;
        };
        let boundary = lane
            .items
            .iter()
            .rev()
            .find(|item| mergeable.contains(&item.pr));
        let Some(boundary) = boundary else {
            continue;
        };
        workspace.fast_forward(&destination.name, boundary.tip.as_str())?;
        advanced.push(destination.name.clone());
        merged_items.extend(
            lane.items
                .iter()
                .filter(|item| mergeable.contains(&item.pr))
                .map(|item| item.branch.clone()),
        );
    }

    let refs: Vec<&str> = advanced.iter().map(String::as_str).collect();
    workspace.push(&refs, false)?;

    let refs: Vec<&str> = merged_items.iter().map(String::as_str).collect();
    workspace.delete_remote_branches(&refs)?;

    info!(prs = ?mergeable, destinations = ?advanced, "promoted queue prefix");
    Ok(Promotion {
        merged_prs: mergeable.to_vec(),
    })
}

/// Deletes every `q/*` branch. Used by the wipe and rebuild operations.
pub fn delete_all(workspace: &mut Workspace, queues: &QueueCollection) -> Result<(), QueueError> {
    let names = queues.branch_names();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    workspace.delete_remote_branches(&refs)?;
    for name in &names {
        workspace.delete_local_branch(name)?;
    }
    info!(count = names.len(), "deleted queue branches");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branches::SourcePrefix;
    use crate::integration::IntegrationEngine;
    use crate::test_utils::GitFixture;

    fn refs(workspace: &mut Workspace) -> CascadeSet {
        let names = workspace.remote_branch_names().unwrap();
        CascadeSet::from_refs(names.iter().map(String::as_str), [])
    }

    /// Drives one PR through integration and admission.
    fn queue_pr(fixture: &GitFixture, pr: PrId, source_name: &str) -> Cascade {
        fixture.commit_on(source_name, &format!("{}.txt", pr.0), "change");
        let source = SourceBranch::parse(source_name, &[]).unwrap();
        let mut workspace = fixture.workspace();
        let cascade = refs(&mut workspace)
            .finalize("development/1.0", &SourcePrefix::Bugfix)
            .unwrap();
        let mut engine = IntegrationEngine::new(&mut workspace);
        engine.update(&cascade, &source, false, false).unwrap();
        let outcome = admit(&mut workspace, &cascade, &source, pr).unwrap();
        assert!(matches!(outcome, AdmitOutcome::Queued { .. }));
        cascade
    }

    fn collection(fixture: &GitFixture) -> QueueCollection {
        let mut workspace = fixture.workspace();
        let refs = refs(&mut workspace);
        QueueCollection::build(&mut workspace, &refs).unwrap()
    }

    fn all_green(queues: &QueueCollection) -> HashMap<Sha, BuildStatus> {
        queues
            .items()
            .map(|item| (item.tip.clone(), BuildStatus::Successful))
            .collect()
    }

    #[test]
    fn admission_creates_lanes_and_items() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");

        assert!(fixture.branch_exists("q/1.0"));
        assert!(fixture.branch_exists("q/2.0"));
        assert!(fixture.branch_exists("q/w/1/1.0/bugfix/PROJ-1-a"));
        assert!(fixture.branch_exists("q/w/1/2.0/bugfix/PROJ-1-a"));

        let queues = collection(&fixture);
        assert!(queues.is_queued(PrId(1)));
        assert_eq!(queues.queued_prs(), vec![PrId(1)]);
    }

    #[test]
    fn admission_preserves_arrival_order() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        queue_pr(&fixture, PrId(2), "bugfix/PROJ-2-b");
        queue_pr(&fixture, PrId(3), "bugfix/PROJ-3-c");

        let queues = collection(&fixture);
        assert_eq!(queues.queued_prs(), vec![PrId(1), PrId(2), PrId(3)]);

        let workspace = fixture.workspace();
        assert!(queues.validate(&workspace).unwrap().is_empty());
    }

    #[test]
    fn conflicting_admission_leaves_queue_untouched() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        let queues_before = collection(&fixture);
        let names_before = queues_before.branch_names();

        // second PR edits the same file with different content
        fixture.commit_on("bugfix/PROJ-9-z", "1.txt", "conflicting change");
        let source = SourceBranch::parse("bugfix/PROJ-9-z", &[]).unwrap();
        let mut workspace = fixture.workspace();
        let cascade = refs(&mut workspace)
            .finalize("development/1.0", &SourcePrefix::Bugfix)
            .unwrap();
        let mut engine = IntegrationEngine::new(&mut workspace);
        engine.update(&cascade, &source, false, false).unwrap();
        let outcome = admit(&mut workspace, &cascade, &source, PrId(9)).unwrap();
        assert_eq!(outcome, AdmitOutcome::Conflict);

        let queues_after = collection(&fixture);
        assert_eq!(queues_after.branch_names(), names_before);
        assert!(!queues_after.is_queued(PrId(9)));
    }

    #[test]
    fn promotion_merges_green_prefix() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        let queues = collection(&fixture);
        let statuses = all_green(&queues);

        let mergeable = queues.mergeable_prs(&statuses);
        assert_eq!(mergeable, vec![PrId(1)]);

        let mut workspace = fixture.workspace();
        let promotion = promote(&mut workspace, &queues, &mergeable).unwrap();
        assert_eq!(promotion.merged_prs, vec![PrId(1)]);

        assert!(fixture.origin_includes("development/1.0", "bugfix/PROJ-1-a"));
        assert!(fixture.origin_includes("development/2.0", "bugfix/PROJ-1-a"));
        assert!(fixture.origin_includes("development/2.0", "development/1.0"));
        assert!(!fixture.branch_exists("q/w/1/1.0/bugfix/PROJ-1-a"));
    }

    #[test]
    fn red_build_blocks_itself_and_later_prs() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        queue_pr(&fixture, PrId(2), "bugfix/PROJ-2-b");
        queue_pr(&fixture, PrId(3), "bugfix/PROJ-3-c");
        let queues = collection(&fixture);

        // PR #1 fully green; PR #2 red on its 2.0 tip; PR #3 not built yet
        let mut statuses = HashMap::new();
        for item in queues.items() {
            match item.pr {
                PrId(1) => {
                    statuses.insert(item.tip.clone(), BuildStatus::Successful);
                }
                PrId(2) if item.version == Version::new(2, Some(0), None) => {
                    statuses.insert(item.tip.clone(), BuildStatus::Failed);
                }
                PrId(2) => {
                    statuses.insert(item.tip.clone(), BuildStatus::Successful);
                }
                _ => {}
            }
        }

        assert_eq!(queues.mergeable_prs(&statuses), vec![PrId(1)]);
    }

    #[test]
    fn later_green_tip_validates_earlier_pending_items() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        queue_pr(&fixture, PrId(2), "bugfix/PROJ-2-b");
        let queues = collection(&fixture);

        // only PR #2's tips (the newest of each lane) are green; PR #1's
        // own builds never reported
        let statuses: HashMap<Sha, BuildStatus> = queues
            .items()
            .filter(|i| i.pr == PrId(2))
            .map(|i| (i.tip.clone(), BuildStatus::Successful))
            .collect();

        assert_eq!(queues.mergeable_prs(&statuses), vec![PrId(1), PrId(2)]);
    }

    #[test]
    fn failed_items_reports_newest_tip_per_lane() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        let queues = collection(&fixture);

        let mut statuses = HashMap::new();
        for item in queues.items() {
            statuses.insert(item.tip.clone(), BuildStatus::Failed);
        }
        let failed = queues.failed_items(&statuses);
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|item| item.pr == PrId(1)));
    }

    #[test]
    fn manual_push_on_lane_is_detected() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        // a manual commit directly on the lane breaks the ancestry
        fixture.commit_on("q/2.0", "rogue.txt", "manual");

        let queues = collection(&fixture);
        let workspace = fixture.workspace();
        let issues = queues.validate(&workspace).unwrap();
        assert!(
            issues
                .iter()
                .any(|i| matches!(i, QueueIssue::LaneDiverged { lane } if lane == "q/2.0")),
            "expected LaneDiverged, got {:?}",
            issues
        );
    }

    #[test]
    fn deleted_lane_with_items_is_detected() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        fixture.delete_branch("q/2.0");

        let queues = collection(&fixture);
        let workspace = fixture.workspace();
        let issues = queues.validate(&workspace).unwrap();
        assert!(issues.contains(&QueueIssue::MissingLane {
            version: Version::new(2, Some(0), None)
        }));
    }

    #[test]
    fn delete_all_wipes_queue_branches() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        let queues = collection(&fixture);

        let mut workspace = fixture.workspace();
        delete_all(&mut workspace, &queues).unwrap();

        assert!(!fixture.branch_exists("q/1.0"));
        assert!(!fixture.branch_exists("q/2.0"));
        assert!(!fixture.branch_exists("q/w/1/1.0/bugfix/PROJ-1-a"));
    }

    #[test]
    fn promotion_of_prefix_keeps_remaining_items_valid() {
        let fixture = GitFixture::new();
        queue_pr(&fixture, PrId(1), "bugfix/PROJ-1-a");
        queue_pr(&fixture, PrId(2), "bugfix/PROJ-2-b");
        let queues = collection(&fixture);

        let mut workspace = fixture.workspace();
        promote(&mut workspace, &queues, &[PrId(1)]).unwrap();

        assert!(fixture.origin_includes("development/1.0", "bugfix/PROJ-1-a"));
        assert!(!fixture.origin_includes("development/1.0", "bugfix/PROJ-2-b"));
        assert!(fixture.branch_exists("q/w/2/1.0/bugfix/PROJ-2-b"));

        // the remaining queue still validates
        let queues = collection(&fixture);
        let workspace = fixture.workspace();
        assert!(queues.validate(&workspace).unwrap().is_empty());
        assert_eq!(queues.queued_prs(), vec![PrId(2)]);
    }
}
