//! Pre-merge checks on a generated patch.
//!
//! Checked in order: run budget, changed lines, files touched, path filters,
//! secrets. The first violation wins.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{GuardrailConfig, PathFilters};
use crate::error::Result;

const BUILTIN_SECRET_PATTERNS: &[&str] = &[
    r"sk_live_[0-9A-Za-z]{16,}",
    r"rk_live_[0-9A-Za-z]{16,}",
    r"AKIA[0-9A-Z]{16}",
    r"-----BEGIN [A-Z ]*PRIVATE KEY-----",
    r"gh[pousr]_[A-Za-z0-9]{36}",
    r"xox[abprs]-[A-Za-z0-9-]{10,}",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailViolation {
    BudgetExceeded,
    DiffLimitExceeded,
    FileLimitExceeded,
    PathFilterViolation,
    SecretDetected,
}

impl GuardrailViolation {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::BudgetExceeded => "budget_exceeded",
            Self::DiffLimitExceeded => "diff_limit_exceeded",
            Self::FileLimitExceeded => "file_limit_exceeded",
            Self::PathFilterViolation => "path_filter_violation",
            Self::SecretDetected => "secret_detected",
        }
    }
}

impl fmt::Display for GuardrailViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub files: Vec<String>,
    pub changed_lines: usize,
    pub added: Vec<String>,
}

/// Files come from `diff --git a/.. b/..` headers; changed lines are `+`/`-`
/// lines other than the `+++`/`---` file markers.
pub fn analyze_patch(patch: &str) -> PatchStats {
    let mut stats = PatchStats::default();
    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            let file = rest
                .split_whitespace()
                .nth(1)
                .or_else(|| rest.split_whitespace().next())
                .unwrap_or(rest);
            let file = file
                .strip_prefix("b/")
                .or_else(|| file.strip_prefix("a/"))
                .unwrap_or(file)
                .to_string();
            if !stats.files.contains(&file) {
                stats.files.push(file);
            }
            continue;
        }
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if let Some(added) = line.strip_prefix('+') {
            stats.changed_lines += 1;
            stats.added.push(added.to_string());
        } else if line.starts_with('-') {
            stats.changed_lines += 1;
        }
    }
    stats
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches(['.', '/'])
}

fn matches_prefix(file: &str, pattern: &str) -> bool {
    let pattern = normalize(pattern);
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    if pattern.ends_with('/') {
        return file.starts_with(pattern);
    }
    file == pattern
        || file
            .strip_prefix(pattern)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn violates_filters(files: &[String], filters: &PathFilters) -> bool {
    let included = filters.include.is_empty()
        || files
            .iter()
            .any(|f| filters.include.iter().any(|p| matches_prefix(normalize(f), p)));
    let excluded = files
        .iter()
        .any(|f| filters.exclude.iter().any(|p| matches_prefix(normalize(f), p)));
    !included || excluded
}

pub struct Guardrails {
    config: GuardrailConfig,
    secrets: Vec<Regex>,
}

impl Guardrails {
    pub fn new(config: GuardrailConfig) -> Result<Self> {
        let secrets = BUILTIN_SECRET_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(config.secret_patterns.iter().cloned())
            .map(|p| Regex::new(&p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { config, secrets })
    }

    pub fn budget_limit(&self) -> f64 {
        self.config.budget_limit
    }

    /// `run_total` is what the run has spent before this patch.
    pub fn check(&self, patch: &str, cost: f64, run_total: f64) -> Option<GuardrailViolation> {
        let violation = self.evaluate(patch, cost, run_total);
        if let Some(v) = violation {
            warn!(violation = %v, cost, run_total, "Patch rejected by guardrail");
        }
        violation
    }

    fn evaluate(&self, patch: &str, cost: f64, run_total: f64) -> Option<GuardrailViolation> {
        if run_total + cost > self.config.budget_limit {
            return Some(GuardrailViolation::BudgetExceeded);
        }

        let stats = analyze_patch(patch);
        if stats.changed_lines > self.config.max_diff_lines {
            return Some(GuardrailViolation::DiffLimitExceeded);
        }
        if stats.files.len() > self.config.max_files {
            return Some(GuardrailViolation::FileLimitExceeded);
        }

        let filters = &self.config.path_filters;
        if (!filters.include.is_empty() || !filters.exclude.is_empty())
            && violates_filters(&stats.files, filters)
        {
            return Some(GuardrailViolation::PathFilterViolation);
        }

        if stats
            .added
            .iter()
            .any(|line| self.secrets.iter().any(|re| re.is_match(line)))
        {
            return Some(GuardrailViolation::SecretDetected);
        }

        None
    }
}
