//! At-most-once message delivery.
//!
//! Every comment the robot posts starts with a machine-readable marker
//! embedded in an HTML comment. Before posting, the messenger scans the
//! PR's existing robot comments for a marker with the same code and
//! idempotency key; ground truth lives in the comments themselves, so a
//! restarted bot never double-posts.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hosting::{GitHost, HostError};
use crate::messages::{Message, RenderContext};
use crate::settings::RepositorySettings;
use crate::types::{CommentId, PrId};

/// The marker that begins a robot comment.
pub const MARKER_START: &str = "<!-- waterflow-status ";

/// The marker terminator.
pub const MARKER_END: &str = " -->";

/// Machine-readable payload embedded in every robot comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub code: u16,
    pub key: String,
}

/// Outcome of a posting attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    Posted(CommentId),
    /// An identical message already exists; nothing was posted.
    AlreadyPosted,
}

/// Posts status messages with at-most-once semantics.
pub struct Messenger {
    robot: String,
    version: String,
}

impl Messenger {
    pub fn new(settings: &RepositorySettings) -> Self {
        Messenger {
            robot: settings.robot.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Posts `message` on `pr` unless an identical message is already
    /// there. Messages marked repeatable are always posted; the greeting
    /// is posted at most once per PR lifetime regardless of parameters.
    pub fn post(
        &self,
        host: &mut dyn GitHost,
        pr: PrId,
        message: &Message,
        active_options: &[String],
    ) -> Result<PostOutcome, HostError> {
        let marker = Marker {
            code: message.code(),
            key: message.idempotency_key(),
        };

        if !message.may_repeat() {
            let history = host.list_comments(pr)?;
            let duplicate = history
                .iter()
                .filter(|c| c.author == self.robot)
                .filter_map(|c| parse_marker(&c.text))
                .any(|m| {
                    if message.once_per_lifetime() {
                        m.code == marker.code
                    } else {
                        m == marker
                    }
                });
            if duplicate {
                debug!(code = marker.code, key = %marker.key, "message already posted");
                return Ok(PostOutcome::AlreadyPosted);
            }
        }

        let ctx = RenderContext {
            robot: self.robot.clone(),
            version: self.version.clone(),
            active_options: active_options.to_vec(),
        };
        // marker json has no `-->` to escape: keys are hex, codes numeric
        let payload = serde_json::to_string(&marker).map_err(|e| HostError::Api(e.to_string()))?;
        let body = format!(
            "{}{}{}\n{}",
            MARKER_START,
            payload,
            MARKER_END,
            message.render(&ctx)
        );
        let id = host.post_comment(pr, &body)?;
        Ok(PostOutcome::Posted(id))
    }
}

/// Extracts the marker from a comment body, if present.
pub fn parse_marker(text: &str) -> Option<Marker> {
    let start = text.find(MARKER_START)? + MARKER_START.len();
    let end = text[start..].find(MARKER_END)? + start;
    serde_json::from_str(&text[start..end]).ok()
}
