use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::error::{GovernorError, Result};

pub const CONFIG_FILE: &str = "config.toml";
const DEFAULT_SIGNATURE_SECRET: &str = "default-secret";
/// Upper bound on `attempts.max_attempts`; the cooldown doubles per attempt.
pub const MAX_ATTEMPTS_LIMIT: u32 = 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub orchestrator: OrchestratorConfig,
    pub attempts: AttemptConfig,
    pub patterns: PatternConfig,
    pub rate_limit: RateLimitConfig,
    pub budget: BudgetConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub routing: RoutingConfig,
    pub guardrails: GuardrailConfig,
    pub alerts: AlertConfig,
    pub paths: StatePaths,
}

impl GovernorConfig {
    pub async fn load(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from disk, then layer `AUTOFIX_*` environment overrides on top.
    pub async fn load_with_env(state_dir: &Path) -> Result<Self> {
        let mut config = Self::load(state_dir).await?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, state_dir: &Path) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(state_dir).await?;
        let content =
            toml::to_string_pretty(self).map_err(|e| GovernorError::Config(e.to_string()))?;
        fs::write(state_dir.join(CONFIG_FILE), content).await?;
        Ok(())
    }

    /// Apply environment overrides through `lookup`.
    ///
    /// Unparseable values are ignored with a warning so a typo in a deploy
    /// variable never widens a limit silently.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparseable environment override");
                    None
                }
            }
        }

        if let Some(env) = lookup("AUTOFIX_ENV") {
            self.patterns.learning_enabled = env.eq_ignore_ascii_case("production");
        }
        if let Some(v) = parsed(&lookup, "AUTOFIX_DAILY_BUDGET_CAP") {
            self.budget.caps.daily = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOFIX_WEEKLY_BUDGET_CAP") {
            self.budget.caps.weekly = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOFIX_MONTHLY_BUDGET_CAP") {
            self.budget.caps.monthly = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOFIX_RATE_LIMIT_PER_MINUTE") {
            self.rate_limit.per_minute = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOFIX_RATE_LIMIT_PER_DAY") {
            self.rate_limit.per_day = v;
        }
        if let Some(secret) = lookup("AUTOFIX_SIGNATURE_SECRET")
            && !secret.is_empty()
        {
            self.circuit_breaker.signature_secret = secret;
        }
        if let Some(tier) = parsed(&lookup, "AUTOFIX_FORCE_TIER") {
            self.routing.force_tier = Some(tier);
        }
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.orchestrator.trigger_label.trim().is_empty() {
            errors.push("orchestrator.trigger_label must not be empty".into());
        }
        if self.orchestrator.model_timeout_secs == 0 {
            errors.push("orchestrator.model_timeout_secs must be greater than 0".into());
        }
        if self.orchestrator.max_prs_per_run == 0 {
            errors.push("orchestrator.max_prs_per_run must be greater than 0".into());
        }

        if self.attempts.max_attempts == 0 {
            errors.push("attempts.max_attempts must be greater than 0".into());
        }
        if self.attempts.max_attempts > MAX_ATTEMPTS_LIMIT {
            errors.push(format!(
                "attempts.max_attempts must not exceed {MAX_ATTEMPTS_LIMIT} (got {})",
                self.attempts.max_attempts
            ));
        }
        if self.attempts.base_cooldown_hours <= 0 {
            errors.push("attempts.base_cooldown_hours must be greater than 0".into());
        }

        if !(0.0..=1.0).contains(&self.patterns.confidence_threshold) {
            errors.push("patterns.confidence_threshold must be between 0.0 and 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.patterns.fuzzy_penalty) {
            errors.push("patterns.fuzzy_penalty must be between 0.0 and 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.patterns.learning_rate) || self.patterns.learning_rate == 0.0
        {
            errors.push("patterns.learning_rate must be in (0.0, 1.0]".into());
        }

        if self.rate_limit.per_minute == 0 || self.rate_limit.per_day == 0 {
            errors.push("rate_limit windows must allow at least one attempt".into());
        }
        if self.rate_limit.per_minute > self.rate_limit.per_day {
            errors.push("rate_limit.per_minute must not exceed rate_limit.per_day".into());
        }

        let caps = &self.budget.caps;
        if caps.daily < 0.0 || caps.weekly < 0.0 || caps.monthly < 0.0 {
            errors.push("budget caps must not be negative".into());
        }
        let t = &self.budget.thresholds;
        if !(t.warning < t.critical && t.critical <= t.exceeded) {
            errors.push("budget thresholds must satisfy warning < critical <= exceeded".into());
        }
        let r = &self.budget.reservation;
        if r.tier1 <= 0.0 || r.tier2 <= 0.0 || r.tier3 <= 0.0 {
            errors.push("budget reservation amounts must be greater than 0".into());
        }

        if self.circuit_breaker.max_hops == 0 {
            errors.push("circuit_breaker.max_hops must be greater than 0".into());
        }
        if self.circuit_breaker.lock_owner.contains(char::is_whitespace) {
            errors.push("circuit_breaker.lock_owner must not contain whitespace".into());
        }

        if self.retry.max_pr_attempts == 0 {
            errors.push("retry.max_pr_attempts must be greater than 0".into());
        }
        if !(0.0..1.0).contains(&self.retry.same_error_distance) {
            errors.push("retry.same_error_distance must be in [0.0, 1.0)".into());
        }

        if let Some(tier) = self.routing.force_tier
            && !(1..=3).contains(&tier)
        {
            errors.push(format!("routing.force_tier must be 1, 2 or 3 (got {tier})"));
        }
        if self.routing.shallow_depth >= self.routing.medium_depth {
            errors.push("routing.shallow_depth must be less than routing.medium_depth".into());
        }

        if self.guardrails.max_files == 0 {
            errors.push("guardrails.max_files must be greater than 0".into());
        }
        for pattern in &self.guardrails.secret_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("guardrails.secret_patterns: invalid regex '{pattern}': {e}"));
            }
        }

        if !errors.is_empty() {
            return Err(GovernorError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        if self.circuit_breaker.signature_secret == DEFAULT_SIGNATURE_SECRET {
            warn!("Audit comments are signed with the default secret; set AUTOFIX_SIGNATURE_SECRET");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Label an issue must carry before the pipeline touches it.
    pub trigger_label: String,
    /// Label applied when the issue body fails validation.
    pub incomplete_label: String,
    pub base_branch: String,
    /// Fix branches are named `{branch_prefix}{issue}`.
    pub branch_prefix: String,
    pub model_timeout_secs: u64,
    pub max_body_bytes: usize,
    /// Ceiling on open automation pull requests before new ones are held back.
    pub max_prs_per_run: usize,
    /// Applied to every pull request the pipeline opens. Open pull requests
    /// carrying any of them count toward `max_prs_per_run`.
    pub pr_labels: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            trigger_label: "robot".into(),
            incomplete_label: "incomplete".into(),
            base_branch: "main".into(),
            branch_prefix: "fix/issue-".into(),
            model_timeout_secs: 30,
            max_body_bytes: 64 * 1024,
            max_prs_per_run: 5,
            pr_labels: vec!["autofix".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptConfig {
    pub max_attempts: u32,
    pub base_cooldown_hours: i64,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_cooldown_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub confidence_threshold: f64,
    /// Multiplier applied to fuzzy (same type and file) matches.
    pub fuzzy_penalty: f64,
    /// EMA smoothing factor for success rate updates.
    pub learning_rate: f64,
    pub min_uses_for_retirement: u32,
    pub retirement_threshold: f64,
    /// Extraction and learning only run when enabled.
    pub learning_enabled: bool,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            fuzzy_penalty: 0.9,
            learning_rate: 0.1,
            min_uses_for_retirement: 10,
            retirement_threshold: 0.5,
            learning_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: usize,
    pub per_day: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 5,
            per_day: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetCaps {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
}

impl Default for BudgetCaps {
    fn default() -> Self {
        Self {
            daily: 0.066,
            weekly: 0.33,
            monthly: 1.0,
        }
    }
}

/// Usage percentages at which alerts fire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetThresholds {
    pub warning: f64,
    pub critical: f64,
    pub exceeded: f64,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            warning: 75.0,
            critical: 90.0,
            exceeded: 100.0,
        }
    }
}

/// Up-front reservation per routing tier, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierReservations {
    pub tier1: f64,
    pub tier2: f64,
    pub tier3: f64,
}

impl Default for TierReservations {
    fn default() -> Self {
        Self {
            tier1: 0.001,
            tier2: 0.004,
            tier3: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub currency: String,
    pub caps: BudgetCaps,
    pub thresholds: BudgetThresholds,
    pub reservation: TierReservations,
    /// Hard ceiling on the cost of a single fix.
    pub per_fix_limit: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            currency: "USD".into(),
            caps: BudgetCaps::default(),
            thresholds: BudgetThresholds::default(),
            reservation: TierReservations::default(),
            per_fix_limit: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub max_hops: u32,
    /// Owner segment of the `processing:<owner>` lock label.
    pub lock_owner: String,
    pub stale_lock_minutes: i64,
    pub signature_secret: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_hops: 3,
            lock_owner: "autofix".into(),
            stale_lock_minutes: 30,
            signature_secret: DEFAULT_SIGNATURE_SECRET.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_pr_attempts: u32,
    pub rate_limit_base_delay_ms: u64,
    pub linear_delay_ms: u64,
    /// Normalized edit distance at or below which two errors count as the same.
    pub same_error_distance: f64,
    /// Caller-requested attempt count; clamped to the tier default.
    pub requested_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_pr_attempts: 3,
            rate_limit_base_delay_ms: 1000,
            linear_delay_ms: 200,
            same_error_distance: 0.1,
            requested_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub force_tier: Option<u8>,
    pub shallow_depth: usize,
    pub medium_depth: usize,
    pub medium_max_files: usize,
    /// Extra regexes, matched against normalized paths, that force tier 3.
    pub extra_sensitive_patterns: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            force_tier: None,
            shallow_depth: 5,
            medium_depth: 15,
            medium_max_files: 3,
            extra_sensitive_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathFilters {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub max_diff_lines: usize,
    pub max_files: usize,
    /// Total cost a single run may spend across all issues.
    pub budget_limit: f64,
    pub path_filters: PathFilters,
    /// Regexes appended to the built-in secret detectors.
    pub secret_patterns: Vec<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_diff_lines: 500,
            max_files: 10,
            budget_limit: 5.0,
            path_filters: PathFilters::default(),
            secret_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub cooldown_hours: i64,
    pub max_annual_cost: f64,
    pub min_success_rate: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: 24,
            max_annual_cost: 10.0,
            min_success_rate: 0.6,
        }
    }
}

/// File names of the persisted state documents, relative to the state dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatePaths {
    pub attempts: PathBuf,
    pub patterns: PathBuf,
    pub rate_limit: PathBuf,
    pub budget: PathBuf,
    pub run_log: PathBuf,
}

impl Default for StatePaths {
    fn default() -> Self {
        Self {
            attempts: PathBuf::from("attempt-store.json"),
            patterns: PathBuf::from("patterns.json"),
            rate_limit: PathBuf::from("state/rate_limiter.json"),
            budget: PathBuf::from("state/budget.json"),
            run_log: PathBuf::from("logs/runs.jsonl"),
        }
    }
}

impl StatePaths {
    pub fn resolve(&self, state_dir: &Path) -> ResolvedPaths {
        ResolvedPaths {
            attempts: state_dir.join(&self.attempts),
            patterns: state_dir.join(&self.patterns),
            rate_limit: state_dir.join(&self.rate_limit),
            budget: state_dir.join(&self.budget),
            run_log: state_dir.join(&self.run_log),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub attempts: PathBuf,
    pub patterns: PathBuf,
    pub rate_limit: PathBuf,
    pub budget: PathBuf,
    pub run_log: PathBuf,
}
