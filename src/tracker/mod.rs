//! Issue tracker adapters.
//!
//! The circuit breaker and orchestrator only talk to an [`IssueTracker`].
//! Label writes are compare-and-swap: [`IssueTracker::set_labels`] takes the
//! version token read with the issue and reports a [`LabelUpdate::Conflict`]
//! when another writer got there first.
//!
//! - [`InMemoryTracker`]: in-process implementation of the same contract
//! - [`GhTracker`]: GitHub through the `gh api` CLI

mod gh;
mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use gh::GhTracker;
pub use memory::{InMemoryTracker, TrackerOp};

use crate::error::TrackerError;

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_state")]
    pub state: String,
}

fn default_state() -> String {
    "open".to_string()
}

impl Issue {
    pub fn new(number: u64, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            body: body.into(),
            labels: Vec::new(),
            state: default_state(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Opaque optimistic-concurrency token read alongside an issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken(pub String);

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedIssue {
    pub issue: Issue,
    pub version: VersionToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub head: String,
    pub base: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl PullRequest {
    pub fn has_any_label(&self, labels: &[String]) -> bool {
        self.labels.iter().any(|l| labels.contains(l))
    }

    /// Whether the body links `#<issue>` as a whole token.
    pub fn references_issue(&self, issue: u64) -> bool {
        let needle = format!("#{issue}");
        self.body.match_indices(&needle).any(|(idx, _)| {
            !self.body[idx + needle.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelUpdate {
    Applied { version: VersionToken },
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub name: String,
    pub color: String,
    pub description: String,
}

impl LabelSpec {
    pub fn new(
        name: impl Into<String>,
        color: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            description: description.into(),
        }
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn get_issue(&self, number: u64) -> TrackerResult<VersionedIssue>;

    /// Replace the full label set if `expected` is still current.
    async fn set_labels(
        &self,
        number: u64,
        labels: &[String],
        expected: &VersionToken,
    ) -> TrackerResult<LabelUpdate>;

    async fn add_labels(&self, number: u64, labels: &[String]) -> TrackerResult<()>;

    /// Fails with a 404 when the label is not on the issue.
    async fn remove_label(&self, number: u64, label: &str) -> TrackerResult<()>;

    async fn add_comment(&self, number: u64, body: &str) -> TrackerResult<Comment>;

    async fn list_comments(&self, number: u64) -> TrackerResult<Vec<Comment>>;

    async fn list_open_pulls(&self) -> TrackerResult<Vec<PullRequest>>;

    async fn create_pull(&self, request: &NewPullRequest) -> TrackerResult<PullRequest>;

    async fn update_pull(&self, number: u64, title: &str, body: &str)
    -> TrackerResult<PullRequest>;

    async fn add_pull_labels(&self, number: u64, labels: &[String]) -> TrackerResult<()>;

    /// Fails with a 422 when the label already exists.
    async fn create_label(&self, spec: &LabelSpec) -> TrackerResult<()>;
}
