//! Core domain types used throughout the application.

pub mod ids;

pub use ids::{CommentId, InvalidSha, JobId, PrId, RepoId, Sha};
