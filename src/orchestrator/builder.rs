use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::intake::{IssueParser, Sanitizer};
use super::pipeline::Orchestrator;
use crate::attempts::{AttemptDocument, AttemptStore};
use crate::budget::{BudgetLedger, BudgetStore};
use crate::circuit::CircuitBreaker;
use crate::clock::{SharedClock, system_clock};
use crate::config::{GovernorConfig, ResolvedPaths};
use crate::cost::CostTracker;
use crate::error::{GovernorError, Result};
use crate::guardrails::Guardrails;
use crate::observability::{AlertManager, MetricsCollector, RunLog};
use crate::patterns::{PatternExtractor, PatternLearner, PatternLibrary, PatternLibraryStore};
use crate::rate_limit::{RateLimitState, RateLimiter};
use crate::retry::{RetryHandler, TierExecutor};
use crate::routing::Router;
use crate::storage::{JsonFileStore, MemoryStore, StateStore};
use crate::tracker::IssueTracker;

/// Wires the governance components around a tracker and an executor.
///
/// State lives in memory unless a state directory is given, in which case
/// each document is a JSON file under it and runs are appended to the run log.
pub struct OrchestratorBuilder {
    config: GovernorConfig,
    tracker: Arc<dyn IssueTracker>,
    executor: Arc<dyn TierExecutor>,
    parser: Option<Arc<dyn IssueParser>>,
    sanitizer: Option<Arc<dyn Sanitizer>>,
    clock: Option<SharedClock>,
    metrics: Option<Arc<MetricsCollector>>,
    state_dir: Option<PathBuf>,
}

impl OrchestratorBuilder {
    pub fn new(
        config: GovernorConfig,
        tracker: Arc<dyn IssueTracker>,
        executor: Arc<dyn TierExecutor>,
    ) -> Self {
        Self {
            config,
            tracker,
            executor,
            parser: None,
            sanitizer: None,
            clock: None,
            metrics: None,
            state_dir: None,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn IssueParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share one collector across orchestrators of the same process.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    fn store<T>(&self, path: impl FnOnce(&ResolvedPaths) -> PathBuf) -> Arc<dyn StateStore<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        match &self.state_dir {
            Some(dir) => {
                let paths = self.config.paths.resolve(dir);
                Arc::new(JsonFileStore::new(path(&paths)))
            }
            None => Arc::new(MemoryStore::new()),
        }
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let parser = self
            .parser
            .clone()
            .ok_or_else(|| GovernorError::Config("issue parser is required".into()))?;
        let sanitizer = self
            .sanitizer
            .clone()
            .ok_or_else(|| GovernorError::Config("sanitizer is required".into()))?;
        let clock = self.clock.clone().unwrap_or_else(system_clock);
        let metrics = self.metrics.clone().unwrap_or_default();

        let attempt_store: Arc<dyn StateStore<AttemptDocument>> = self.store(|p| p.attempts.clone());
        let pattern_store: Arc<dyn StateStore<PatternLibrary>> = self.store(|p| p.patterns.clone());
        let rate_store: Arc<dyn StateStore<RateLimitState>> = self.store(|p| p.rate_limit.clone());
        let budget_store: Arc<dyn StateStore<BudgetLedger>> = self.store(|p| p.budget.clone());
        let run_log = self
            .state_dir
            .as_ref()
            .map(|dir| RunLog::new(self.config.paths.resolve(dir).run_log));

        let config = self.config;
        let patterns = Arc::new(PatternLibraryStore::new(pattern_store, clock.clone()));

        Ok(Orchestrator {
            tracker: self.tracker.clone(),
            executor: self.executor,
            parser,
            sanitizer,
            attempts: AttemptStore::new(attempt_store, clock.clone(), config.attempts.clone()),
            extractor: PatternExtractor::new(patterns.clone(), config.patterns.learning_enabled),
            learner: PatternLearner::new(patterns.clone(), &config.patterns),
            patterns,
            rate_limiter: RateLimiter::new(rate_store, clock.clone(), config.rate_limit.clone()),
            budget: BudgetStore::new(budget_store, clock.clone(), config.budget.clone()),
            breaker: CircuitBreaker::new(self.tracker, clock.clone(), config.circuit_breaker.clone()),
            retry: RetryHandler::new(config.retry.clone())
                .with_timeout(Duration::from_secs(config.orchestrator.model_timeout_secs)),
            router: Router::new(config.routing.clone())?,
            cost: CostTracker::new(config.budget.per_fix_limit),
            guardrails: Guardrails::new(config.guardrails.clone())?,
            alerts: AlertManager::new(clock.clone(), config.alerts.clone()),
            metrics,
            run_log,
            clock,
            config,
        })
    }
}
