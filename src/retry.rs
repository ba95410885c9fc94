//! Tier-execution retries and infrastructure backoff.
//!
//! Both share the same notion of "same error": normalized Levenshtein
//! distance over the extracted error text.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::cost::TokenUsage;
use crate::error::{GovernorError, Result};
use crate::routing::{Route, Tier};

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

static ERROR_LINE: OnceLock<Regex> = OnceLock::new();

fn error_line() -> &'static Regex {
    ERROR_LINE.get_or_init(|| Regex::new(r"(?i)Error: (.*)").unwrap())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    pub model: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: Vec<TokenUsage>,
}

impl AttemptReport {
    pub fn failed(model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn passed(&self) -> bool {
        self.tests_passed == Some(true) || self.success
    }

    /// Text after `Error: ` in the test output, else the error string.
    pub fn error_message(&self) -> &str {
        if let Some(output) = &self.test_output
            && let Some(caps) = error_line().captures(output)
            && let Some(m) = caps.get(1)
        {
            return m.as_str();
        }
        self.error.as_deref().unwrap_or("")
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens
            .iter()
            .map(|t| t.input_tokens + t.output_tokens)
            .sum()
    }
}

/// Whether two failures carry effectively the same error text.
/// Empty text on either side never matches.
pub fn is_same_error(previous: &AttemptReport, current: &AttemptReport, max_distance: f64) -> bool {
    let prev = previous.error_message();
    let curr = current.error_message();
    if prev.is_empty() || curr.is_empty() {
        return false;
    }
    let distance = levenshtein(prev, curr);
    let longest = prev.chars().count().max(curr.chars().count()).max(1);
    distance as f64 / longest as f64 <= max_distance
}

#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub issue_number: u64,
    pub route: Route,
    /// Sanitized error text the fix should address.
    pub error: String,
    pub attempt_number: u32,
    pub previous_attempts: Vec<AttemptReport>,
}

impl AttemptContext {
    pub fn tier(&self) -> Tier {
        self.route.tier
    }
}

/// Generates a patch and runs the tests for one attempt.
#[async_trait]
pub trait TierExecutor: Send + Sync {
    async fn execute(&self, context: &AttemptContext) -> Result<AttemptReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStop {
    DeterministicFailure,
    MaxRetriesExceeded,
}

impl RetryStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeterministicFailure => "deterministic_failure",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub success: bool,
    pub attempts: Vec<AttemptReport>,
    pub reason: Option<RetryStop>,
    pub should_escalate: bool,
}

impl RetryOutcome {
    pub fn last(&self) -> Option<&AttemptReport> {
        self.attempts.last()
    }

    pub fn total_cost(&self) -> f64 {
        self.attempts.iter().map(|a| a.cost).sum()
    }
}

pub fn attempt_limit(tier: Tier, requested: Option<u32>) -> u32 {
    let default = tier.default_attempts();
    requested.unwrap_or(default).min(default).max(1)
}

pub struct RetryHandler {
    config: RetryConfig,
    timeout: Option<Duration>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            timeout: None,
        }
    }

    /// Deadline for each executor call. An expired call counts as a failed attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::from_config(&self.config)
    }

    async fn run_attempt(&self, executor: &dyn TierExecutor, context: &AttemptContext) -> AttemptReport {
        let model = context.route.model.clone();
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, executor.execute(context)).await {
                Ok(result) => result,
                Err(_) => Err(GovernorError::Timeout(limit.as_secs())),
            },
            None => executor.execute(context).await,
        };
        result.unwrap_or_else(|e| {
            warn!(
                issue = context.issue_number,
                attempt = context.attempt_number,
                error = %e,
                "Attempt failed to execute"
            );
            AttemptReport::failed(model, e.to_string())
        })
    }

    pub async fn attempt_fix_with_retries(
        &self,
        executor: &dyn TierExecutor,
        issue_number: u64,
        route: &Route,
        error: &str,
    ) -> RetryOutcome {
        let limit = attempt_limit(route.tier, self.config.requested_attempts);
        let mut attempts: Vec<AttemptReport> = Vec::new();

        for index in 0..limit {
            let context = AttemptContext {
                issue_number,
                route: route.clone(),
                error: error.to_string(),
                attempt_number: index + 1,
                previous_attempts: attempts.clone(),
            };
            let report = self.run_attempt(executor, &context).await;
            let passed = report.passed();
            attempts.push(report);

            if passed {
                debug!(issue = issue_number, attempt = index + 1, tier = %route.tier, "Attempt passed");
                return RetryOutcome {
                    success: true,
                    attempts,
                    reason: None,
                    should_escalate: false,
                };
            }

            if let [.., previous, current] = attempts.as_slice()
                && is_same_error(previous, current, self.config.same_error_distance)
            {
                warn!(issue = issue_number, attempt = index + 1, "Same error twice, stopping");
                return RetryOutcome {
                    success: false,
                    attempts,
                    reason: Some(RetryStop::DeterministicFailure),
                    should_escalate: true,
                };
            }
        }

        warn!(issue = issue_number, attempts = limit, tier = %route.tier, "Attempts exhausted");
        RetryOutcome {
            success: false,
            attempts,
            reason: Some(RetryStop::MaxRetriesExceeded),
            should_escalate: true,
        }
    }
}

/// Bounded retry for tracker calls.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub rate_limit_base_ms: u64,
    pub linear_ms: u64,
}

impl Backoff {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_pr_attempts.max(1),
            rate_limit_base_ms: config.rate_limit_base_delay_ms,
            linear_ms: config.linear_delay_ms,
        }
    }

    /// Exponential for rate limits, linear otherwise. `attempt` is 1-based.
    pub fn delay_ms(&self, attempt: u32, error: &GovernorError) -> u64 {
        if error.is_rate_limit() {
            self.rate_limit_base_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        } else {
            self.linear_ms.saturating_mul(u64::from(attempt))
        }
    }

    /// Run `op` until it succeeds or the ceiling is hit, returning the last
    /// error. Every failure short of the ceiling is retried, whatever its
    /// status. Every wait is appended to `delays` in milliseconds.
    pub async fn run<T, F, Fut>(&self, mut op: F, delays: &mut Vec<u64>) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_ms(attempt, &e);
                    warn!(attempt, delay_ms = delay, error = %e, "Retrying after failure");
                    delays.push(delay);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }
}
