//! Orchestrator wired to an in-memory tracker.

use std::sync::Arc;

use autofix_governor::config::GovernorConfig;
use autofix_governor::orchestrator::{Orchestrator, OrchestratorBuilder};
use autofix_governor::tracker::{InMemoryTracker, Issue};

use super::executor::ScriptedExecutor;
use super::intake::{EmailSanitizer, LineParser};

pub const TRIGGER: &str = "robot";

pub struct Harness {
    pub tracker: Arc<InMemoryTracker>,
    pub executor: Arc<ScriptedExecutor>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(executor: ScriptedExecutor) -> Self {
        Self::with_config(executor, |_| {})
    }

    pub fn with_config(executor: ScriptedExecutor, tweak: impl FnOnce(&mut GovernorConfig)) -> Self {
        let mut config = test_config();
        tweak(&mut config);
        Self::build(executor, config, |b| b)
    }

    pub fn build(
        executor: ScriptedExecutor,
        config: GovernorConfig,
        extra: impl FnOnce(OrchestratorBuilder) -> OrchestratorBuilder,
    ) -> Self {
        let tracker = Arc::new(InMemoryTracker::new());
        let executor = Arc::new(executor);
        let builder = Orchestrator::builder(config, tracker.clone(), executor.clone())
            .with_parser(Arc::new(LineParser))
            .with_sanitizer(Arc::new(EmailSanitizer));
        let orchestrator = extra(builder).build().expect("orchestrator builds");
        Self {
            tracker,
            executor,
            orchestrator,
        }
    }

    /// Open an issue carrying the trigger label.
    pub fn open_issue(&self, number: u64, body: &str) {
        self.tracker.add_issue(
            Issue::new(number, format!("[ext] error #{number}"), body).with_labels([TRIGGER]),
        );
    }

    pub fn comment_bodies(&self, number: u64) -> Vec<String> {
        self.tracker
            .comments(number)
            .into_iter()
            .map(|c| c.body)
            .collect()
    }

    pub fn has_label(&self, number: u64, label: &str) -> bool {
        self.tracker.labels(number).iter().any(|l| l == label)
    }
}

/// Defaults with a quiet signing secret and room in every budget period.
pub fn test_config() -> GovernorConfig {
    let mut config = GovernorConfig::default();
    config.circuit_breaker.signature_secret = "test-secret".into();
    config.budget.caps.daily = 10.0;
    config.budget.caps.weekly = 50.0;
    config.budget.caps.monthly = 100.0;
    config.retry.linear_delay_ms = 200;
    config
}
