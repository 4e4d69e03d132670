//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! JobId where a PrId is expected) and make the code more self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when parsing an invalid SHA.
#[derive(Debug, Clone, Error)]
#[error("invalid SHA: expected 40 hex characters, got {len} bytes: {preview}")]
pub struct InvalidSha {
    len: usize,
    preview: String,
}

/// A pull request number within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrId(pub u64);

impl fmt::Display for PrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for PrId {
    fn from(n: u64) -> Self {
        PrId(n)
    }
}

/// A git-host comment ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub u64);

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CommentId {
    fn from(n: u64) -> Self {
        CommentId(n)
    }
}

/// A job identifier, allocated sequentially by the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A git commit SHA (40 hex characters).
///
/// This type guarantees that the contained string is exactly 40 lowercase hex
/// characters. Construction is only possible via `Sha::parse`, which validates
/// the input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha(String);

impl Sha {
    /// Parses a string as a SHA, validating that it is exactly 40 hex characters.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidSha> {
        let s = s.into();
        if s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            // Normalize to lowercase for consistent comparison
            Ok(Sha(s.to_ascii_lowercase()))
        } else {
            Err(InvalidSha {
                len: s.len(),
                preview: s.chars().take(20).collect(),
            })
        }
    }

    /// Returns the SHA as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (7-character) version of the SHA for display.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Sha {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Sha::parse(s).map_err(serde::de::Error::custom)
    }
}

/// A repository identifier (owner/slug format).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub slug: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, slug: impl Into<String>) -> Self {
        RepoId {
            owner: owner.into(),
            slug: slug.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn pr_id_serde_roundtrip(n: u64) {
            let pr = PrId(n);
            let json = serde_json::to_string(&pr).unwrap();
            let parsed: PrId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(pr, parsed);
        }

        #[test]
        fn pr_id_display_format(n: u64) {
            prop_assert_eq!(format!("{}", PrId(n)), format!("#{}", n));
        }

        #[test]
        fn sha_serde_roundtrip(s in "[0-9a-f]{40}") {
            let sha = Sha::parse(&s).unwrap();
            let json = serde_json::to_string(&sha).unwrap();
            let parsed: Sha = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(sha, parsed);
        }

        #[test]
        fn sha_short_returns_7_chars(s in "[0-9a-f]{40}") {
            let sha = Sha::parse(&s).unwrap();
            prop_assert_eq!(sha.short().len(), 7);
            prop_assert_eq!(sha.short(), &s[..7]);
        }

        #[test]
        fn sha_parse_rejects_invalid_length(s in "[0-9a-f]{0,39}|[0-9a-f]{41,80}") {
            prop_assert!(Sha::parse(&s).is_err());
        }

        #[test]
        fn sha_parse_rejects_non_hex(s in "[0-9a-f]{39}[g-z]") {
            prop_assert!(Sha::parse(&s).is_err());
        }

        #[test]
        fn sha_parse_normalizes_to_lowercase(s in "[0-9A-Fa-f]{40}") {
            let sha = Sha::parse(&s).unwrap();
            prop_assert_eq!(sha.as_str(), s.to_ascii_lowercase());
        }

        #[test]
        fn repo_id_display(
            owner in "[a-zA-Z][a-zA-Z0-9-]{0,38}",
            slug in "[a-zA-Z][a-zA-Z0-9_-]{0,99}"
        ) {
            let id = RepoId::new(&owner, &slug);
            prop_assert_eq!(format!("{}", id), format!("{}/{}", owner, slug));
        }
    }

    #[test]
    fn deserialize_rejects_invalid_sha() {
        let json = r#""not-a-valid-sha""#;
        let result: Result<Sha, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
