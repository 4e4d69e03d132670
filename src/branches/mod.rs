//! The GitWaterFlow branch-name grammar.
//!
//! This module parses every special-role branch name recognized or produced
//! by the bot, and defines the cascade ordering on branch versions.
//!
//! Recognized destinations:
//! - `development/<major>` and `development/<major>.<minor>`
//! - `stabilization/<major>.<minor>.<patch>`
//! - `hotfix/<major>.<minor>.<patch>`
//!
//! Produced by the bot:
//! - `w/<version>/<source>` (integration branch)
//! - `q/<version>` (queue lane)
//! - `q/w/<pr>/<version>/<source>` (per-PR queue item)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

use crate::types::PrId;

/// Error returned when a branch name does not match any known pattern.
#[derive(Debug, Clone, Error)]
#[error("unrecognized branch name: {0}")]
pub struct UnrecognizedBranch(pub String);

/// A GitWaterFlow version, as carried in branch names.
///
/// `development/4` parses to `4` (no minor), `development/4.3` to `4.3`, and
/// `stabilization/4.3.18` to `4.3.18`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: Option<u32>,
    pub patch: Option<u32>,
}

impl Version {
    pub fn new(major: u32, minor: Option<u32>, patch: Option<u32>) -> Self {
        Version {
            major,
            minor,
            patch,
        }
    }

    /// Parses a dotted version string: `4`, `4.3` or `4.3.18`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(p) => Some(p.parse().ok()?),
            None => None,
        };
        let patch = match parts.next() {
            Some(p) => Some(p.parse().ok()?),
            None => None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Version {
            major,
            minor,
            patch,
        })
    }

    /// True when both versions name the same `major.minor` line.
    pub fn same_line(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{}", minor)?;
        }
        if let Some(patch) = self.patch {
            write!(f, ".{}", patch)?;
        }
        Ok(())
    }
}

/// Cascade ordering: `4.3.18 < 4.3 < 4 < 5.1 < 10.0 < 10`.
///
/// Within a major, minor versions ascend and the major-only branch comes
/// last (it is the `(major, +∞)` line). At the same `major.minor`, a
/// version with a patch component (a stabilization line) precedes the
/// patchless development line.
impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.major != other.major {
            return self.major.cmp(&other.major);
        }
        match (self.minor, other.minor) {
            (None, None) => {}
            // major-only sorts after any major.minor of the same major
            (None, Some(_)) => return Ordering::Greater,
            (Some(_), None) => return Ordering::Less,
            (Some(a), Some(b)) if a != b => return a.cmp(&b),
            (Some(_), Some(_)) => {}
        }
        match (self.patch, other.patch) {
            (None, None) => Ordering::Equal,
            // patchful (stabilization) precedes patchless (development)
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The kind of a destination branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Development,
    Stabilization,
    Hotfix,
}

/// A branch a pull request may target, discovered by fetch and never
/// mutated by the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationBranch {
    pub name: String,
    pub kind: DestinationKind,
    pub version: Version,
}

impl DestinationBranch {
    /// Parses a destination branch name, if it is one.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(version) = name.strip_prefix("development/") {
            let version = Version::parse(version)?;
            // three-component development branches do not exist
            if version.patch.is_some() {
                return None;
            }
            return Some(DestinationBranch {
                name: name.to_string(),
                kind: DestinationKind::Development,
                version,
            });
        }
        if let Some(version) = name.strip_prefix("stabilization/") {
            let version = Version::parse(version)?;
            version.patch?;
            return Some(DestinationBranch {
                name: name.to_string(),
                kind: DestinationKind::Stabilization,
                version,
            });
        }
        if let Some(version) = name.strip_prefix("hotfix/") {
            // versionless hotfix/<label> branches are legacy and ignored
            let version = Version::parse(version)?;
            version.patch?;
            return Some(DestinationBranch {
                name: name.to_string(),
                kind: DestinationKind::Hotfix,
                version,
            });
        }
        None
    }
}

impl fmt::Display for DestinationBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The prefix of a source branch, constraining where it may cascade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePrefix {
    Feature,
    Bugfix,
    Improvement,
    Project,
    Documentation,
    Design,
    Epic,
    /// A prefix allowed through repository configuration (`bypass_prefixes`).
    Custom(String),
}

impl SourcePrefix {
    fn from_builtin(s: &str) -> Option<Self> {
        match s {
            "feature" => Some(SourcePrefix::Feature),
            "bugfix" => Some(SourcePrefix::Bugfix),
            "improvement" => Some(SourcePrefix::Improvement),
            "project" => Some(SourcePrefix::Project),
            "documentation" => Some(SourcePrefix::Documentation),
            "design" => Some(SourcePrefix::Design),
            "epic" => Some(SourcePrefix::Epic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourcePrefix::Feature => "feature",
            SourcePrefix::Bugfix => "bugfix",
            SourcePrefix::Improvement => "improvement",
            SourcePrefix::Project => "project",
            SourcePrefix::Documentation => "documentation",
            SourcePrefix::Design => "design",
            SourcePrefix::Epic => "epic",
            SourcePrefix::Custom(s) => s,
        }
    }

    /// Whether branches with this prefix cascade through stabilization
    /// branches, or skip them (new features never land on maintenance-only
    /// lines).
    pub fn includes_stabilization(&self) -> bool {
        matches!(
            self,
            SourcePrefix::Bugfix | SourcePrefix::Improvement | SourcePrefix::Documentation
        )
    }
}

impl fmt::Display for SourcePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An issue key parsed from a source branch label, e.g. `PROJ-123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueKey {
    /// The project part, uppercased (`PROJ`).
    pub project: String,
    /// The full key, uppercased (`PROJ-123`).
    pub key: String,
}

impl IssueKey {
    /// Extracts an issue key from the start of a branch label.
    ///
    /// `PROJ-123-fix-the-thing` yields `PROJ-123`; a label without a leading
    /// `<project>-<number>` yields `None`.
    fn from_label(label: &str) -> Option<Self> {
        let (project, rest) = label.split_once('-')?;
        if project.is_empty() || !project.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        // at least the project part must not itself be numeric-only
        if project.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        let project = project.to_ascii_uppercase();
        Some(IssueKey {
            key: format!("{}-{}", project, digits),
            project,
        })
    }
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// The source branch of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBranch {
    pub name: String,
    pub prefix: SourcePrefix,
    pub label: String,
    pub issue_key: Option<IssueKey>,
}

impl SourceBranch {
    /// Parses a source branch name. `extra_prefixes` lists the additional
    /// prefixes permitted by configuration.
    pub fn parse(name: &str, extra_prefixes: &[String]) -> Result<Self, UnrecognizedBranch> {
        let (prefix, label) = name
            .split_once('/')
            .ok_or_else(|| UnrecognizedBranch(name.to_string()))?;
        if label.is_empty() {
            return Err(UnrecognizedBranch(name.to_string()));
        }
        let prefix = match SourcePrefix::from_builtin(prefix) {
            Some(p) => p,
            None if extra_prefixes.iter().any(|e| e == prefix) => {
                SourcePrefix::Custom(prefix.to_string())
            }
            None => return Err(UnrecognizedBranch(name.to_string())),
        };
        Ok(SourceBranch {
            name: name.to_string(),
            prefix,
            issue_key: IssueKey::from_label(label),
            label: label.to_string(),
        })
    }
}

impl fmt::Display for SourceBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A parsed `w/<version>/<source>` integration branch name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationRef {
    pub version: Version,
    pub source: String,
}

impl IntegrationRef {
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("w/")?;
        let (version, source) = rest.split_once('/')?;
        if source.is_empty() {
            return None;
        }
        Some(IntegrationRef {
            version: Version::parse(version)?,
            source: source.to_string(),
        })
    }
}

/// A parsed `q/…` branch name: either a lane or a per-PR queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueRef {
    /// `q/<version>` - the fast-forward lane of one destination.
    Lane { version: Version },
    /// `q/w/<pr>/<version>/<source>` - one PR's contribution in a lane.
    Item {
        pr: PrId,
        version: Version,
        source: String,
    },
}

impl QueueRef {
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("q/")?;
        if let Some(rest) = rest.strip_prefix("w/") {
            let (pr, rest) = rest.split_once('/')?;
            let pr = PrId(pr.parse().ok()?);
            let (version, source) = rest.split_once('/')?;
            if source.is_empty() {
                return None;
            }
            return Some(QueueRef::Item {
                pr,
                version: Version::parse(version)?,
                source: source.to_string(),
            });
        }
        Some(QueueRef::Lane {
            version: Version::parse(rest)?,
        })
    }
}

/// Name of the integration branch staging `source` against `version`.
pub fn integration_branch_name(version: &Version, source: &str) -> String {
    format!("w/{}/{}", version, source)
}

/// Name of the queue lane of a destination.
pub fn queue_lane_name(version: &Version) -> String {
    format!("q/{}", version)
}

/// Name of one PR's queue-item branch in a lane.
pub fn queue_item_name(pr: PrId, version: &Version, source: &str) -> String {
    format!("q/w/{}/{}/{}", pr.0, version, source)
}
