use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::builder::OrchestratorBuilder;
use super::intake::{IssueParser, ParsedIssue, Sanitizer};
use super::outcome::{Disposition, ProcessOutcome, RunContext};
use crate::attempts::AttemptStore;
use crate::budget::{BudgetStore, RefundRequest, ReservationRequest};
use crate::circuit::{CircuitBreaker, LockMetadata};
use crate::clock::SharedClock;
use crate::config::GovernorConfig;
use crate::cost::{CostTracker, DEFAULT_FIXES_PER_YEAR};
use crate::error::{GovernorError, Result};
use crate::fingerprint::{Fingerprint, RawError, fingerprint};
use crate::guardrails::Guardrails;
use crate::observability::{Alert, AlertManager, MetricsCollector, RunLog, RunMetrics};
use crate::patterns::{
    ExtractInput, LearningEvent, PatternExtractor, PatternLearner, PatternLibraryStore,
    PatternMatch, PatternMatcher,
};
use crate::rate_limit::{RateLimitCheck, RateLimiter};
use crate::retry::{AttemptReport, RetryHandler, TierExecutor};
use crate::routing::{Route, Router, Tier};
use crate::tracker::{Issue, IssueTracker, NewPullRequest};

const TESTS_FAILED_COMMENT: &str = "⚠️ Tests failed after applying fix. Manual review required.";
const COST_LIMIT_REASON: &str = "cost_limit_exceeded";

/// Everything known about an issue once it has passed validation.
struct Job {
    issue: Issue,
    raw: RawError,
    fingerprint: Fingerprint,
    /// Attempt-store key: the reported fingerprint when present.
    key: String,
    hop: Option<u32>,
}

impl Job {
    fn number(&self) -> u64 {
        self.issue.number
    }

    /// Sanitized text handed to the tier executor.
    fn error_text(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.raw.error_type, self.raw.message, self.raw.stack
        )
    }
}

/// What `publish` did with the fix branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Published {
    Created(u64),
    Updated(u64),
    /// Too many automation pull requests are already open.
    Capped { open: usize, max: usize },
}

/// Reservation and spend that must be settled when the attempt ends.
#[derive(Debug, Default)]
struct Held {
    reservation: Option<(String, f64)>,
    spent: f64,
}

/// Per-issue decision pipeline.
///
/// Validation, cooldown and lock checks run first and never cost anything.
/// Once the lock is held, everything else runs inside a scope whose budget
/// refund and lock release happen on every exit, including errors and panics.
pub struct Orchestrator {
    pub(super) config: GovernorConfig,
    pub(super) clock: SharedClock,
    pub(super) tracker: Arc<dyn IssueTracker>,
    pub(super) executor: Arc<dyn TierExecutor>,
    pub(super) parser: Arc<dyn IssueParser>,
    pub(super) sanitizer: Arc<dyn Sanitizer>,
    pub(super) attempts: AttemptStore,
    pub(super) patterns: Arc<PatternLibraryStore>,
    pub(super) extractor: PatternExtractor,
    pub(super) learner: PatternLearner,
    pub(super) rate_limiter: RateLimiter,
    pub(super) budget: BudgetStore,
    pub(super) breaker: CircuitBreaker,
    pub(super) retry: RetryHandler,
    pub(super) router: Router,
    pub(super) cost: CostTracker,
    pub(super) guardrails: Guardrails,
    pub(super) metrics: Arc<MetricsCollector>,
    pub(super) alerts: AlertManager,
    pub(super) run_log: Option<RunLog>,
}

impl Orchestrator {
    pub fn builder(
        config: GovernorConfig,
        tracker: Arc<dyn IssueTracker>,
        executor: Arc<dyn TierExecutor>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config, tracker, executor)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn budget(&self) -> &BudgetStore {
        &self.budget
    }

    pub fn attempts(&self) -> &AttemptStore {
        &self.attempts
    }

    pub fn patterns(&self) -> &PatternLibraryStore {
        &self.patterns
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cost_tracker(&self) -> &CostTracker {
        &self.cost
    }

    pub fn run_log(&self) -> Option<&RunLog> {
        self.run_log.as_ref()
    }

    pub fn start_run(&self) -> RunContext {
        RunContext::new(self.clock.now())
    }

    /// Process one issue. `Err` is reserved for infrastructure failures;
    /// skips and rejections come back as outcomes.
    pub async fn process_issue(&self, number: u64, run: &mut RunContext) -> Result<ProcessOutcome> {
        let span = info_span!("issue", issue = number, run_id = %run.run_id);
        self.process(number, run).instrument(span).await
    }

    /// Process issues one at a time. A failing issue is recorded in the run
    /// and does not stop the batch.
    pub async fn process_batch(&self, numbers: &[u64], run: &mut RunContext) -> Vec<ProcessOutcome> {
        let mut outcomes = Vec::with_capacity(numbers.len());
        for &number in numbers {
            match self.process_issue(number, run).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(issue = number, error = %e, "Issue processing failed");
                    run.errors.push(format!("#{number}: {e}"));
                    outcomes.push(
                        ProcessOutcome::new(number, Disposition::Failed)
                            .with_reason("processing_error")
                            .with_detail(e.to_string()),
                    );
                }
            }
        }
        outcomes
    }

    /// Persist the run record and raise budget and SLO alerts.
    pub async fn finish_run(&self, run: &RunContext, repo: &str) -> Result<RunMetrics> {
        let metrics = run.to_metrics(repo, self.clock.now());
        if let Some(log) = &self.run_log {
            log.append(&metrics).await?;
        }

        for threshold in self.budget.check_thresholds().await? {
            self.alerts.send(&Alert::from(&threshold));
        }
        let projected = self.cost.project_annual_cost(DEFAULT_FIXES_PER_YEAR);
        let slo = self.alerts.check_slos(&self.metrics.snapshot(), projected);
        self.alerts.send_all(&slo);

        info!(
            run_id = %run.run_id,
            cost = metrics.cost,
            prs_created = metrics.prs_created,
            prs_updated = metrics.prs_updated,
            cooldowns = metrics.cooldowns,
            errors = metrics.errors.len(),
            "Run finished"
        );
        Ok(metrics)
    }

    async fn process(&self, number: u64, run: &mut RunContext) -> Result<ProcessOutcome> {
        let issue = match self.tracker.get_issue(number).await {
            Ok(read) => read.issue,
            Err(e) if e.is_not_found() => {
                warn!(issue = number, "Issue not found");
                return Ok(ProcessOutcome::rejected(number, "issue_not_found")
                    .with_detail(format!("Issue #{number} not found")));
            }
            Err(e) => return Err(e.into()),
        };

        let trigger = &self.config.orchestrator.trigger_label;
        if !issue.has_label(trigger) {
            debug!(issue = number, label = %trigger, "Trigger label missing");
            return Ok(ProcessOutcome::skipped(number, "missing robot label"));
        }

        let mut parsed = self.parser.parse(&issue);
        let max_body = self.config.orchestrator.max_body_bytes;
        if issue.body.len() > max_body {
            parsed.errors.push(format!("Issue body exceeds {max_body} byte limit"));
        }
        if !parsed.is_valid() {
            return self.reject_incomplete(number, &parsed.errors).await;
        }

        let job = self.prepare(issue, parsed.parsed, run);

        if !self.attempts.can_attempt(&job.key).await? {
            run.cooldowns += 1;
            let state = self.attempts.get_state(&job.key).await?;
            info!(issue = number, fingerprint = %job.key, attempts = state.attempts, "Cooldown active");
            let mut outcome = ProcessOutcome::skipped(number, "cooldown_active");
            if let Some(until) = state.cooldown_until {
                outcome = outcome.with_detail(format!("Next attempt after {}", until.to_rfc3339()));
            }
            return Ok(outcome);
        }

        let metadata = LockMetadata::new(
            run.run_id.to_string(),
            format!("autofix attempt for {}", job.key),
        );
        let lock = self
            .breaker
            .acquire_lock_and_increment_hop(number, &metadata)
            .await?;
        if !lock.acquired {
            let reason = lock.reason.map(|r| r.as_str()).unwrap_or("lock_unavailable");
            let mut outcome = ProcessOutcome::skipped(number, reason);
            outcome.hop = lock.current_hop;
            return Ok(outcome);
        }

        let job = Job {
            hop: lock.current_hop,
            ..job
        };
        let mut held = Held::default();
        let result = AssertUnwindSafe(self.attempt(&job, run, &mut held))
            .catch_unwind()
            .await;
        self.settle(number, &held).await;

        match result {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn prepare(&self, issue: Issue, parsed: ParsedIssue, run: &mut RunContext) -> Job {
        let raw = RawError::new(
            &parsed.error_type,
            self.sanitize(&parsed.error_message),
            self.sanitize(&parsed.stack_trace),
        );
        let fingerprint = fingerprint(&raw);
        let key = parsed
            .fingerprint
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| fingerprint.id.clone());
        run.note_fingerprint(&key);
        debug!(issue = issue.number, fingerprint = %fingerprint.id, key = %key, "Fingerprinted");

        Job {
            issue,
            raw,
            fingerprint,
            key,
            hop: None,
        }
    }

    fn sanitize(&self, text: &str) -> String {
        let sanitized = self.sanitizer.sanitize(text);
        for kind in &sanitized.redactions {
            self.metrics.record_redaction(kind);
        }
        sanitized.text
    }

    async fn reject_incomplete(&self, number: u64, errors: &[String]) -> Result<ProcessOutcome> {
        let reason = errors.join("; ");
        warn!(issue = number, %reason, "Issue failed validation");
        self.tracker
            .add_labels(number, &[self.config.orchestrator.incomplete_label.clone()])
            .await?;
        self.tracker
            .add_comment(
                number,
                &format!("⚠️ {reason}\n\nPlease ensure issue follows the expected format."),
            )
            .await?;
        Ok(ProcessOutcome::rejected(number, "validation_failed").with_detail(reason))
    }

    /// Best-effort user-facing comment.
    async fn notify(&self, number: u64, body: &str) {
        if let Err(e) = self.tracker.add_comment(number, body).await {
            warn!(issue = number, error = %e, "Failed to post comment");
        }
    }

    async fn attempt(&self, job: &Job, run: &mut RunContext, held: &mut Held) -> Result<ProcessOutcome> {
        let number = job.number();

        let rate = self.rate_limiter.can_proceed().await?;
        if !rate.allowed {
            return Ok(self.rate_limited(job, &rate).await);
        }

        let route = self.router.select(&job.raw.stack);
        let amount = self.budget.reservation_for(route.tier);
        let reservation = self
            .budget
            .reserve(ReservationRequest::new(
                amount,
                format!("issue #{number} {}", route.tier),
            ))
            .await?;
        let Some(reservation_id) = reservation.reservation_id.clone() else {
            let detail = reservation
                .reason
                .unwrap_or_else(|| "Budget reservation refused".into());
            self.notify(number, &format!("💸 Budget insufficient: {detail}"))
                .await;
            let mut outcome = ProcessOutcome::skipped(number, "budget_insufficient").with_detail(detail);
            outcome.hop = job.hop;
            return Ok(outcome);
        };
        held.reservation = Some((reservation_id, amount));
        self.rate_limiter.record_attempt().await?;

        let library = self.patterns.load().await?;
        let hit = PatternMatcher::new(library, &self.config.patterns).find(&job.fingerprint);

        let (report, tier, stop) = match &hit {
            Some(m) => {
                info!(issue = number, pattern = %m.pattern.id, strategy = %m.strategy, "Replaying pattern");
                (replay_report(m), None, None)
            }
            None => {
                info!(issue = number, tier = %route.tier, model = %route.model, "Executing tier");
                let outcome = self
                    .retry
                    .attempt_fix_with_retries(self.executor.as_ref(), number, &route, &job.error_text())
                    .await;
                for _ in 1..outcome.attempts.len() {
                    self.metrics.record_retry(false);
                }
                if outcome.should_escalate {
                    self.metrics.record_retry(true);
                }
                (merge_attempts(&route, &outcome.attempts), Some(route.tier), outcome.reason)
            }
        };

        let cost = report.cost;
        held.spent = cost;
        for usage in &report.tokens {
            run.tokens.input += usage.input_tokens;
            run.tokens.output += usage.output_tokens;
        }

        let mut outcome = ProcessOutcome::new(number, Disposition::Failed);
        outcome.tier = tier;
        outcome.model = Some(report.model.clone());
        outcome.fix_generated = report.patch.is_some();
        outcome.tests_passed = report.passed();
        outcome.cost = cost;
        outcome.hop = job.hop;

        if !report.passed() {
            run.total_cost += cost;
            self.attempts.record_attempt(&job.key, false).await?;
            self.metrics.record_fix(tier, false, cost);
            if let Err(e) = self.breaker.mark_failure(number).await {
                warn!(issue = number, error = %e, "Failed to mark failure");
            }
            self.notify(number, TESTS_FAILED_COMMENT).await;
            let reason = stop.map(|s| s.as_str()).unwrap_or("tests_failed");
            info!(issue = number, %reason, cost, "Fix failed");
            return Ok(outcome.with_reason(reason));
        }

        let patch = report.patch.as_deref().unwrap_or("");
        let violation = match self.track_usage(&report) {
            Err(GovernorError::CostLimit(message)) => {
                warn!(issue = number, %message, "Fix rejected by cost ceiling");
                Some(COST_LIMIT_REASON)
            }
            Err(e) => return Err(e),
            Ok(()) => self
                .guardrails
                .check(patch, cost, run.total_cost)
                .map(|v| v.reason()),
        };
        run.total_cost += cost;

        if let Some(reason) = violation {
            self.attempts.record_attempt(&job.key, false).await?;
            self.metrics.record_fix(tier, false, cost);
            if let Some(m) = &hit {
                self.learn(number, &m.pattern.id, false).await;
            }
            if let Err(e) = self.breaker.mark_failure(number).await {
                warn!(issue = number, error = %e, "Failed to mark failure");
            }
            self.notify(
                number,
                &format!("🛑 Fix rejected by safety guardrail ({reason}). Manual review required."),
            )
            .await;
            outcome.disposition = Disposition::Rejected;
            return Ok(outcome.with_reason(reason));
        }

        self.attempts.record_attempt(&job.key, true).await?;
        match &hit {
            Some(m) => {
                self.learn(number, &m.pattern.id, true).await;
                run.patterns_used += 1;
                run.zero_cost_fixes += 1;
            }
            None => self.extract(job, patch).await,
        }
        self.metrics.record_fix(tier, true, cost);

        let mut delays = Vec::new();
        let published = self.publish(number, tier, &mut delays).await;
        for _ in &delays {
            self.metrics.record_retry(false);
        }
        outcome.retries = delays.len();
        outcome.delay_history = delays;
        let pr_number = match published? {
            Published::Created(pr) => {
                run.prs_created += 1;
                pr
            }
            Published::Updated(pr) => {
                run.prs_updated += 1;
                pr
            }
            Published::Capped { open, max } => {
                let detail = format!("Max PR budget reached ({open}/{max})");
                self.notify(
                    number,
                    &format!(
                        "⏳ Open automation PR limit reached ({open}/{max}). The fix will be retried in a later run."
                    ),
                )
                .await;
                info!(issue = number, open, max, "Pull request cap reached");
                outcome.disposition = Disposition::Skipped;
                return Ok(outcome.with_reason("pr_limit_reached").with_detail(detail));
            }
        };
        self.notify(
            number,
            &format!("✅ Fix deployed to PR #{pr_number}. Tests passing."),
        )
        .await;
        if let Err(e) = self.breaker.mark_success(number).await {
            warn!(issue = number, error = %e, "Failed to mark success");
        }

        info!(issue = number, pr = pr_number, cost, "Fix succeeded");
        outcome.disposition = Disposition::Succeeded;
        outcome.pr_number = Some(pr_number);
        Ok(outcome)
    }

    async fn rate_limited(&self, job: &Job, rate: &RateLimitCheck) -> ProcessOutcome {
        let reason = rate.reason.clone().unwrap_or_else(|| "Rate limit exceeded".into());
        let resets_at = if rate.current.per_minute >= rate.limits.per_minute {
            rate.resets_at.per_minute
        } else {
            rate.resets_at.per_day
        };
        let detail = format!("{reason}. Next attempt after {}", resets_at.to_rfc3339());
        self.notify(job.number(), &format!("⏳ {detail}")).await;
        let mut outcome = ProcessOutcome::skipped(job.number(), "rate_limited").with_detail(detail);
        outcome.hop = job.hop;
        outcome
    }

    fn track_usage(&self, report: &AttemptReport) -> Result<()> {
        for usage in &report.tokens {
            self.cost.track_usage(usage.clone())?;
        }
        Ok(())
    }

    async fn learn(&self, number: u64, pattern_id: &str, success: bool) {
        match self
            .learner
            .learn(LearningEvent::new(pattern_id, success))
            .await
        {
            Ok(outcome) => debug!(issue = number, pattern = %pattern_id, ?outcome, "Pattern learned"),
            Err(e) => warn!(issue = number, pattern = %pattern_id, error = %e, "Pattern learning failed"),
        }
    }

    async fn extract(&self, job: &Job, patch: &str) {
        if patch.is_empty() {
            return;
        }
        let input = ExtractInput::new(job.fingerprint.clone(), patch)
            .with_description(format!("{}: {}", job.raw.error_type, job.raw.message));
        match self.extractor.extract(input).await {
            // The fix that produced the pattern counts as its first success.
            Ok(Some(pattern)) => self.learn(job.number(), &pattern.id, true).await,
            Ok(None) => {}
            Err(e) => warn!(issue = job.number(), error = %e, "Pattern extraction failed"),
        }
    }

    /// Update the open pull request on the fix branch, else open one unless
    /// the open automation pull requests already fill `max_prs_per_run`.
    async fn publish(&self, number: u64, tier: Option<Tier>, delays: &mut Vec<u64>) -> Result<Published> {
        let origin = match tier {
            Some(t) => format!("Tier {}", t.number()),
            None => "Pattern replay".to_string(),
        };
        let request = NewPullRequest {
            title: format!("fix: automated fix for issue #{number}"),
            body: format!("Fixes #{number}\n\nAutomated fix generated by autofix ({origin})."),
            head: format!("{}{}", self.config.orchestrator.branch_prefix, number),
            base: self.config.orchestrator.base_branch.clone(),
        };
        let request = &request;
        let tracker = &self.tracker;
        let labels = &self.config.orchestrator.pr_labels;
        let max = self.config.orchestrator.max_prs_per_run;

        let published = self
            .retry
            .backoff()
            .run(
                move |attempt| async move {
                    debug!(issue = number, attempt, head = %request.head, "Publishing pull request");
                    let open = tracker.list_open_pulls().await?;
                    if let Some(existing) = open.iter().find(|p| p.head == request.head) {
                        let pr = tracker
                            .update_pull(existing.number, &request.title, &request.body)
                            .await?;
                        return Ok(Published::Updated(pr.number));
                    }
                    // Without labels every open pull request counts.
                    let automation = open
                        .iter()
                        .filter(|p| labels.is_empty() || p.has_any_label(labels))
                        .count();
                    if automation >= max {
                        return Ok(Published::Capped {
                            open: automation,
                            max,
                        });
                    }
                    let pr = tracker.create_pull(request).await?;
                    Ok::<_, GovernorError>(Published::Created(pr.number))
                },
                delays,
            )
            .await?;

        if let Published::Created(pr) = published
            && !labels.is_empty()
            && let Err(e) = self.tracker.add_pull_labels(pr, labels).await
        {
            warn!(issue = number, pr, error = %e, "Failed to label pull request");
        }
        Ok(published)
    }

    /// Refund first, then release. Failures here are logged and never replace
    /// the attempt's own result.
    async fn settle(&self, number: u64, held: &Held) {
        if let Some((reservation_id, reserved)) = &held.reservation {
            let actual = held.spent.min(*reserved);
            let refund = RefundRequest {
                reservation_id: reservation_id.clone(),
                actual_amount: actual,
            };
            if let Err(e) = self.budget.refund(refund).await {
                error!(issue = number, reservation = %reservation_id, error = %e, "Refund failed");
            }
            let overrun = held.spent - reserved;
            if overrun > 0.0
                && let Err(e) = self
                    .budget
                    .record_overrun(overrun, &format!("issue #{number} overrun"))
                    .await
            {
                error!(issue = number, overrun, error = %e, "Failed to record overrun");
            }
        }

        if let Err(e) = self.breaker.release_lock(number).await {
            error!(issue = number, error = %e, "Lock release failed");
        }
    }
}

fn replay_report(hit: &PatternMatch) -> AttemptReport {
    AttemptReport {
        success: true,
        tests_passed: Some(true),
        patch: Some(hit.pattern.patch.clone()),
        model: format!("pattern-{}", hit.strategy),
        ..Default::default()
    }
}

/// Final attempt's result with the cost and tokens of every attempt.
fn merge_attempts(route: &Route, attempts: &[AttemptReport]) -> AttemptReport {
    let mut report = attempts
        .last()
        .cloned()
        .unwrap_or_else(|| AttemptReport::failed(&route.model, "no attempts were made"));
    report.cost = attempts.iter().map(|a| a.cost).sum();
    report.tokens = attempts.iter().flat_map(|a| a.tokens.iter().cloned()).collect();
    report
}
