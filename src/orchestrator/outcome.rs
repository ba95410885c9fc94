use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::observability::{RunMetrics, TokenTotals};
use crate::routing::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Not attempted; a later invocation may pick it up.
    Skipped,
    /// Validation or guardrail refusal.
    Rejected,
    /// Attempted and the tests did not pass.
    Failed,
    Succeeded,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skipped => "skipped",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        };
        write!(f, "{}", s)
    }
}

/// Result of processing one issue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub issue: u64,
    pub disposition: Disposition,
    /// Stable machine-readable reason for anything but success.
    pub reason: Option<String>,
    /// Human-readable context, e.g. a reset time.
    pub detail: Option<String>,
    pub tier: Option<Tier>,
    pub model: Option<String>,
    pub fix_generated: bool,
    pub tests_passed: bool,
    pub pr_number: Option<u64>,
    /// Pull request retries.
    pub retries: usize,
    pub delay_history: Vec<u64>,
    pub cost: f64,
    pub hop: Option<u32>,
}

impl ProcessOutcome {
    pub(crate) fn new(issue: u64, disposition: Disposition) -> Self {
        Self {
            issue,
            disposition,
            reason: None,
            detail: None,
            tier: None,
            model: None,
            fix_generated: false,
            tests_passed: false,
            pr_number: None,
            retries: 0,
            delay_history: Vec::new(),
            cost: 0.0,
            hop: None,
        }
    }

    pub(crate) fn skipped(issue: u64, reason: impl Into<String>) -> Self {
        Self::new(issue, Disposition::Skipped).with_reason(reason)
    }

    pub(crate) fn rejected(issue: u64, reason: impl Into<String>) -> Self {
        Self::new(issue, Disposition::Rejected).with_reason(reason)
    }

    pub(crate) fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.disposition == Disposition::Succeeded
    }
}

/// Counters accumulated across one batch. Owned by the caller and passed
/// into every `process_issue` call of the batch.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total_cost: f64,
    pub patterns_used: u32,
    pub zero_cost_fixes: u32,
    pub cooldowns: u32,
    pub fingerprints: Vec<String>,
    pub prs_created: u32,
    pub prs_updated: u32,
    pub tokens: TokenTotals,
    pub errors: Vec<String>,
}

impl RunContext {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            total_cost: 0.0,
            patterns_used: 0,
            zero_cost_fixes: 0,
            cooldowns: 0,
            fingerprints: Vec::new(),
            prs_created: 0,
            prs_updated: 0,
            tokens: TokenTotals::default(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn note_fingerprint(&mut self, id: &str) {
        if !self.fingerprints.iter().any(|f| f == id) {
            self.fingerprints.push(id.to_string());
        }
    }

    pub fn to_metrics(&self, repo: &str, finished_at: DateTime<Utc>) -> RunMetrics {
        let latency = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        RunMetrics {
            timestamp: finished_at,
            repo: repo.to_string(),
            fingerprints_processed: self.fingerprints.clone(),
            prs_created: self.prs_created,
            prs_updated: self.prs_updated,
            cooldowns: self.cooldowns,
            cost: self.total_cost,
            tokens: self.tokens,
            latency,
            errors: self.errors.clone(),
            patterns_used: self.patterns_used,
            zero_cost_fixes: self.zero_cost_fixes,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    #[test]
    fn test_fingerprints_deduplicated() {
        let mut run = RunContext::new(Utc::now());
        run.note_fingerprint("a");
        run.note_fingerprint("b");
        run.note_fingerprint("a");
        assert_eq!(run.fingerprints, vec!["a", "b"]);
    }

    #[test]
    fn test_to_metrics_latency() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut run = RunContext::new(start);
        run.total_cost = 0.25;
        run.prs_created = 2;

        let metrics = run.to_metrics("acme/ext", start + Duration::milliseconds(1500));
        assert_eq!(metrics.latency, 1500);
        assert_eq!(metrics.prs_created, 2);
        assert_eq!(metrics.repo, "acme/ext");
    }

    #[test]
    fn test_outcome_serializes_lowercase_disposition() {
        let outcome = ProcessOutcome::skipped(7, "cooldown_active");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["disposition"], "skipped");
        assert_eq!(json["reason"], "cooldown_active");
        assert!(!outcome.is_success());
    }
}
