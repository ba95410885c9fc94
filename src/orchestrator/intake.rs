use serde::{Deserialize, Serialize};

use crate::fingerprint::RawError;
use crate::tracker::Issue;

/// Structured fields extracted from an issue body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedIssue {
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: String,
    #[serde(default)]
    pub breadcrumbs: Vec<String>,
    /// Reporter-supplied fingerprint. Preferred over the derived one as the
    /// attempt key when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub extension: String,
}

impl ParsedIssue {
    pub fn raw_error(&self) -> RawError {
        RawError::new(&self.error_type, &self.error_message, &self.stack_trace)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub parsed: ParsedIssue,
    /// Any entry is a hard validation failure.
    pub errors: Vec<String>,
}

impl ParseOutcome {
    pub fn ok(parsed: ParsedIssue) -> Self {
        Self {
            parsed,
            errors: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Turns issue text into structured error fields.
pub trait IssueParser: Send + Sync {
    fn parse(&self, issue: &Issue) -> ParseOutcome;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sanitized {
    pub text: String,
    /// One entry per redaction, naming the kind of data removed.
    pub redactions: Vec<String>,
}

impl Sanitized {
    pub fn clean(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            redactions: Vec::new(),
        }
    }
}

/// Redacts personal data from error text before it is fingerprinted,
/// persisted or sent to a model.
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, text: &str) -> Sanitized;
}
