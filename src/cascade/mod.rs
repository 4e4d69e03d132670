//! Cascade construction.
//!
//! Given the set of live destination branches, compute the ordered cascade a
//! pull request must traverse: the stabilization branches of the target
//! line (when the source prefix is allowed there), the target development
//! branch, then every strictly-newer development line. Destinations the PR
//! will not touch are reported as ignored so the author can see them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::branches::{DestinationBranch, DestinationKind, SourcePrefix, Version};

/// Errors raised while finalizing a cascade.
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("destination branch {0} is not part of the cascade")]
    TargetNotFound(String),

    #[error("there is not a single development branch to merge to")]
    NoDevelopmentDestination,
}

/// All recognized destination branches of the repository, cascade-sorted,
/// together with the release tags used to derive expected versions.
#[derive(Debug, Clone, Default)]
pub struct CascadeSet {
    destinations: Vec<DestinationBranch>,
    tags: Vec<String>,
}

impl CascadeSet {
    /// Collects destinations from a list of branch names (other names are
    /// silently skipped) and release tags.
    pub fn from_refs<'a>(
        branch_names: impl IntoIterator<Item = &'a str>,
        tags: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut destinations: Vec<DestinationBranch> = branch_names
            .into_iter()
            .filter_map(DestinationBranch::parse)
            .collect();
        destinations.sort_by(|a, b| a.version.cmp(&b.version));
        destinations.dedup_by(|a, b| a.name == b.name);
        CascadeSet {
            destinations,
            tags: tags.into_iter().map(String::from).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Looks a destination up by branch name.
    pub fn find(&self, name: &str) -> Option<&DestinationBranch> {
        self.destinations.iter().find(|d| d.name == name)
    }

    /// All destinations in cascade order.
    pub fn destinations(&self) -> &[DestinationBranch] {
        &self.destinations
    }

    /// The ordered merge paths used by queue validation: one path through
    /// every stabilization and development lane, plus a standalone path per
    /// hotfix destination.
    pub fn merge_paths(&self) -> Vec<Vec<Version>> {
        let main: Vec<Version> = self
            .destinations
            .iter()
            .filter(|d| d.kind != DestinationKind::Hotfix)
            .map(|d| d.version)
            .collect();
        let mut paths = Vec::new();
        if !main.is_empty() {
            paths.push(main);
        }
        for d in &self.destinations {
            if d.kind == DestinationKind::Hotfix {
                paths.push(vec![d.version]);
            }
        }
        paths
    }

    /// Adjacent development pairs `(older, newer)`, for the
    /// forward-propagation invariant check.
    pub fn development_pairs(&self) -> Vec<(&DestinationBranch, &DestinationBranch)> {
        let devs: Vec<&DestinationBranch> = self
            .destinations
            .iter()
            .filter(|d| d.kind == DestinationKind::Development)
            .collect();
        devs.windows(2).map(|w| (w[0], w[1])).collect()
    }

    /// Finalizes the cascade for a pull request targeting `target` from a
    /// source carrying `prefix`.
    pub fn finalize(&self, target: &str, prefix: &SourcePrefix) -> Result<Cascade, CascadeError> {
        let target = self
            .find(target)
            .ok_or_else(|| CascadeError::TargetNotFound(target.to_string()))?;

        let mut included = Vec::new();
        let mut ignored = Vec::new();

        for branch in &self.destinations {
            let take = match (target.kind, branch.kind) {
                // A hotfix target is its own single-entry cascade.
                (DestinationKind::Hotfix, _) => branch.name == target.name,
                (_, DestinationKind::Hotfix) => false,
                (_, DestinationKind::Stabilization) => {
                    // the target itself always stays in its own cascade;
                    // prefix compatibility is the gating evaluator's call
                    branch.name == target.name
                        || (prefix.includes_stabilization()
                            && branch.version.same_line(&target.version)
                            && branch.version >= target.version)
                }
                (_, DestinationKind::Development) => {
                    // the development line of the target, and everything newer
                    let target_line =
                        Version::new(target.version.major, target.version.minor, None);
                    branch.version >= target_line
                }
            };
            if take {
                included.push(branch.clone());
            } else {
                ignored.push(branch.name.clone());
            }
        }

        if included.is_empty() {
            return Err(CascadeError::NoDevelopmentDestination);
        }
        if target.kind != DestinationKind::Hotfix
            && !included
                .iter()
                .any(|d| d.kind == DestinationKind::Development)
        {
            return Err(CascadeError::NoDevelopmentDestination);
        }

        ignored.sort();
        let target_versions = self.target_versions(&included);
        debug!(?target_versions, cascade = ?included.iter().map(|d| &d.name).collect::<Vec<_>>(),
               "finalized cascade");

        Ok(Cascade {
            destinations: included,
            ignored,
            target_versions,
        })
    }

    /// Expected fix versions for the given cascade, derived from release
    /// tags: a stabilization branch names its version exactly; a
    /// development line expects the next unreleased micro; a major-only
    /// line expects the next minor.
    fn target_versions(&self, cascade: &[DestinationBranch]) -> Vec<String> {
        let mut versions = Vec::new();
        for branch in cascade {
            let v = branch.version;
            match branch.kind {
                DestinationKind::Stabilization => {
                    versions.push(v.to_string());
                }
                DestinationKind::Hotfix => {
                    let hfrev = self
                        .tag_components(4)
                        .filter(|t| {
                            t[0] == v.major && Some(t[1]) == v.minor && Some(t[2]) == v.patch
                        })
                        .map(|t| t[3])
                        .max()
                        .map_or(1, |r| r + 1);
                    versions.push(format!("{}.{}", v, hfrev));
                }
                DestinationKind::Development => match v.minor {
                    Some(minor) => {
                        let mut micro = self
                            .tag_components(3)
                            .filter(|t| t[0] == v.major && t[1] == minor)
                            .map(|t| t[2])
                            .max()
                            .map_or(0, |m| m + 1);
                        // a live stabilization branch already claims its micro
                        while self.destinations.iter().any(|d| {
                            d.kind == DestinationKind::Stabilization
                                && d.version.same_line(&v)
                                && d.version.patch == Some(micro)
                        }) {
                            micro += 1;
                        }
                        versions.push(format!("{}.{}.{}", v.major, minor, micro));
                    }
                    None => {
                        let branch_minor = self
                            .destinations
                            .iter()
                            .filter(|d| d.version.major == v.major)
                            .filter_map(|d| d.version.minor)
                            .max();
                        let tag_minor = self
                            .tag_components(3)
                            .filter(|t| t[0] == v.major)
                            .map(|t| t[1])
                            .max();
                        let next_minor = branch_minor
                            .into_iter()
                            .chain(tag_minor)
                            .max()
                            .map_or(0, |m| m + 1);
                        versions.push(format!("{}.{}.0", v.major, next_minor));
                    }
                },
            }
        }
        versions.dedup();
        versions
    }

    /// Release tags split into exactly `n` numeric components, with an
    /// optional leading `v` stripped.
    fn tag_components(&self, n: usize) -> impl Iterator<Item = Vec<u32>> + '_ {
        self.tags.iter().filter_map(move |tag| {
            let tag = tag.strip_prefix('v').unwrap_or(tag);
            let parts: Vec<u32> = tag
                .split('.')
                .map(|p| p.parse().ok())
                .collect::<Option<_>>()?;
            (parts.len() == n).then_some(parts)
        })
    }
}

/// The ordered cascade of one pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cascade {
    /// Destinations the change will traverse, oldest first; the first entry
    /// is the PR's target.
    pub destinations: Vec<DestinationBranch>,
    /// Destination branch names the change will not touch.
    pub ignored: Vec<String>,
    /// Versions the associated issue is expected to fix.
    pub target_versions: Vec<String>,
}

impl Cascade {
    /// The original target of the pull request.
    pub fn target(&self) -> &DestinationBranch {
        // finalize() never returns an empty cascade
        &self.destinations[0]
    }

    /// Destinations strictly after the target, i.e. those that get an
    /// integration branch.
    pub fn forward(&self) -> &[DestinationBranch] {
        &self.destinations[1..]
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.destinations.iter().map(|d| d.name.clone()).collect()
    }
}
