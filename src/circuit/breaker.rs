use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::audit::{self, LOCK_MARKER};
use super::labels::{
    ATTEMPTED_LABEL, CircuitPhase, FAILED_LABEL, HopState, SUCCESS_LABEL, TRIPPED_LABEL,
    hop_label, is_hop_label, label_catalog, lock_label,
};
use crate::clock::SharedClock;
use crate::config::CircuitBreakerConfig;
use crate::error::Result;
use crate::tracker::{IssueTracker, LabelUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockRefusal {
    AlreadyLocked,
    CircuitBreakerTripped,
    ExistingPr,
    RaceCondition,
}

impl LockRefusal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyLocked => "already_locked",
            Self::CircuitBreakerTripped => "circuit_breaker_tripped",
            Self::ExistingPr => "existing_pr",
            Self::RaceCondition => "race_condition",
        }
    }
}

impl fmt::Display for LockRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMetadata {
    pub trace: String,
    pub reason: String,
}

impl LockMetadata {
    pub fn new(trace: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            trace: trace.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    pub acquired: bool,
    pub current_hop: Option<u32>,
    pub reason: Option<LockRefusal>,
}

impl LockResult {
    fn acquired(hop: u32) -> Self {
        Self {
            acquired: true,
            current_hop: Some(hop),
            reason: None,
        }
    }

    fn refused(reason: LockRefusal, hop: Option<u32>) -> Self {
        Self {
            acquired: false,
            current_hop: hop,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
    pub allowed: bool,
    pub reason: Option<String>,
    pub current_hop: u32,
    pub max_hops: u32,
    pub phase: CircuitPhase,
}

/// Distributed lock and hop-counted breaker kept entirely in issue labels.
///
/// The only write that establishes ownership is the conditional label
/// update in [`acquire_lock_and_increment_hop`](Self::acquire_lock_and_increment_hop).
/// A stale token there means another process won; that refusal is never
/// retried here.
pub struct CircuitBreaker {
    tracker: Arc<dyn IssueTracker>,
    clock: SharedClock,
    config: CircuitBreakerConfig,
    lock: String,
}

impl CircuitBreaker {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        clock: SharedClock,
        config: CircuitBreakerConfig,
    ) -> Self {
        let lock = lock_label(&config.lock_owner);
        Self {
            tracker,
            clock,
            config,
            lock,
        }
    }

    pub fn max_hops(&self) -> u32 {
        self.config.max_hops
    }

    pub fn lock_label(&self) -> &str {
        &self.lock
    }

    /// Age of the newest lock audit comment; zero when there is none.
    async fn lock_age(&self, number: u64) -> Result<Duration> {
        let comments = self.tracker.list_comments(number).await?;
        let newest = comments
            .iter()
            .filter(|c| c.body.contains(LOCK_MARKER))
            .map(|c| c.created_at)
            .max();
        Ok(newest
            .map(|at| self.clock.now() - at)
            .unwrap_or_else(Duration::zero))
    }

    async fn has_open_pull(&self, number: u64) -> Result<bool> {
        let pulls = self.tracker.list_open_pulls().await?;
        Ok(pulls.iter().any(|p| p.references_issue(number)))
    }

    pub async fn acquire_lock_and_increment_hop(
        &self,
        number: u64,
        metadata: &LockMetadata,
    ) -> Result<LockResult> {
        let read = self.tracker.get_issue(number).await?;
        let state = HopState::from_labels(&read.issue.labels, &self.lock);

        if state.locked {
            let age = self.lock_age(number).await?;
            if age < Duration::minutes(self.config.stale_lock_minutes) {
                debug!(issue = number, age_secs = age.num_seconds(), "Issue already locked");
                return Ok(LockResult::refused(LockRefusal::AlreadyLocked, Some(state.hop)));
            }
            warn!(
                issue = number,
                age_minutes = age.num_minutes(),
                "Overriding stale lock"
            );
        }

        if state.phase == CircuitPhase::Tripped {
            info!(issue = number, hop = state.hop, "Circuit breaker tripped");
            return Ok(LockResult::refused(
                LockRefusal::CircuitBreakerTripped,
                Some(state.hop),
            ));
        }

        if state.hop >= self.config.max_hops {
            info!(
                issue = number,
                hop = state.hop,
                max_hops = self.config.max_hops,
                "Hop ceiling reached"
            );
            return Ok(LockResult::refused(
                LockRefusal::CircuitBreakerTripped,
                Some(state.hop),
            ));
        }

        if self.has_open_pull(number).await? {
            debug!(issue = number, "Open pull request already references issue");
            return Ok(LockResult::refused(LockRefusal::ExistingPr, Some(state.hop)));
        }

        let next_hop = state.hop + 1;
        let labels =
            HopState::acquire_labels(&read.issue.labels, &self.lock, next_hop, self.config.max_hops);

        match self
            .tracker
            .set_labels(number, &labels, &read.version)
            .await?
        {
            LabelUpdate::Conflict => {
                info!(issue = number, "Lost lock race");
                return Ok(LockResult::refused(LockRefusal::RaceCondition, None));
            }
            LabelUpdate::Applied { .. } => {}
        }

        info!(issue = number, hop = next_hop, trace = %metadata.trace, "Lock acquired");

        let comment = audit::lock_comment(
            &self.config.signature_secret,
            next_hop,
            self.config.max_hops,
            &metadata.trace,
            &metadata.reason,
            self.clock.now(),
        )?;
        if let Err(e) = self.tracker.add_comment(number, &comment).await {
            warn!(issue = number, error = %e, "Failed to post lock audit comment");
        }

        if next_hop >= self.config.max_hops {
            let body = audit::trip_comment(self.config.max_hops, &metadata.reason);
            if let Err(e) = self.tracker.add_comment(number, &body).await {
                warn!(issue = number, error = %e, "Failed to post trip comment");
            }
        }

        Ok(LockResult::acquired(next_hop))
    }

    /// Remove the soft lock. Already gone is fine.
    pub async fn release_lock(&self, number: u64) -> Result<()> {
        match self.tracker.remove_label(number, &self.lock).await {
            Ok(()) => {
                debug!(issue = number, "Lock released");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(issue = number, "Lock already released");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn mark_success(&self, number: u64) -> Result<()> {
        let read = self.tracker.get_issue(number).await?;
        for label in read
            .issue
            .labels
            .iter()
            .filter(|l| is_hop_label(l) || l.as_str() == TRIPPED_LABEL)
        {
            if let Err(e) = self.tracker.remove_label(number, label).await {
                warn!(issue = number, label = %label, error = %e, "Failed to remove label");
            }
        }
        self.tracker
            .add_labels(number, &[SUCCESS_LABEL.to_string()])
            .await?;
        info!(issue = number, "Marked fix successful");
        Ok(())
    }

    pub async fn mark_failure(&self, number: u64) -> Result<()> {
        self.tracker
            .add_labels(number, &[FAILED_LABEL.to_string()])
            .await?;
        info!(issue = number, "Marked fix failed");
        Ok(())
    }

    /// Manual reset out of the tripped state back to `hop:0`.
    pub async fn reset(&self, number: u64) -> Result<()> {
        let read = self.tracker.get_issue(number).await?;
        for label in read.issue.labels.iter().filter(|l| {
            is_hop_label(l)
                || matches!(l.as_str(), TRIPPED_LABEL | ATTEMPTED_LABEL | FAILED_LABEL)
        }) {
            if let Err(e) = self.tracker.remove_label(number, label).await
                && !e.is_not_found()
            {
                return Err(e.into());
            }
        }
        self.tracker.add_labels(number, &[hop_label(0)]).await?;
        self.tracker
            .add_comment(number, &audit::reset_comment(self.clock.now()))
            .await?;
        info!(issue = number, "Circuit breaker reset");
        Ok(())
    }

    pub async fn trip(&self, number: u64, reason: &str) -> Result<()> {
        self.tracker
            .add_labels(number, &[TRIPPED_LABEL.to_string()])
            .await?;
        self.tracker
            .add_comment(number, &audit::trip_comment(self.config.max_hops, reason))
            .await?;
        warn!(issue = number, reason, "Circuit breaker tripped");
        Ok(())
    }

    /// Advisory read-only check. Does not look at the soft lock.
    pub async fn can_attempt(&self, number: u64) -> Result<CircuitState> {
        let read = self.tracker.get_issue(number).await?;
        let state = HopState::from_labels(&read.issue.labels, &self.lock);

        let reason = if state.phase == CircuitPhase::Tripped {
            Some(LockRefusal::CircuitBreakerTripped.as_str().to_string())
        } else if state.hop >= self.config.max_hops {
            Some("max_hops_reached".to_string())
        } else if self.has_open_pull(number).await? {
            Some(LockRefusal::ExistingPr.as_str().to_string())
        } else {
            None
        };

        Ok(CircuitState {
            allowed: reason.is_none(),
            reason,
            current_hop: state.hop,
            max_hops: self.config.max_hops,
            phase: state.phase,
        })
    }

    /// Create the label vocabulary. Labels that already exist are left alone.
    pub async fn ensure_labels(&self) -> Result<usize> {
        let mut created = 0;
        for spec in label_catalog(self.config.max_hops, &self.config.lock_owner) {
            match self.tracker.create_label(&spec).await {
                Ok(()) => created += 1,
                Err(e) if e.status == Some(422) => {
                    debug!(label = %spec.name, "Label already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(created, "Circuit breaker labels ensured");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TrackerError;
    use crate::tracker::{InMemoryTracker, Issue, PullRequest, TrackerOp};

    const ISSUE: u64 = 42;

    fn setup() -> (CircuitBreaker, Arc<InMemoryTracker>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap());
        let tracker = Arc::new(InMemoryTracker::with_clock(Arc::new(clock.clone())));
        tracker.add_issue(Issue::new(ISSUE, "TypeError in app", "").with_labels(["robot"]));
        let breaker = CircuitBreaker::new(
            tracker.clone(),
            Arc::new(clock.clone()),
            CircuitBreakerConfig::default(),
        );
        (breaker, tracker, clock)
    }

    fn meta() -> LockMetadata {
        LockMetadata::new("run-1", "automated fix")
    }

    fn has(tracker: &InMemoryTracker, label: &str) -> bool {
        tracker.labels(ISSUE).iter().any(|l| l == label)
    }

    #[tokio::test]
    async fn test_hop_progression_trips_on_third_acquisition() {
        let (breaker, tracker, _clock) = setup();

        for expected in 1..=3 {
            let result = breaker
                .acquire_lock_and_increment_hop(ISSUE, &meta())
                .await
                .unwrap();
            assert!(result.acquired);
            assert_eq!(result.current_hop, Some(expected));
            assert!(has(&tracker, &format!("hop:{expected}")));
            assert!(!has(&tracker, &format!("hop:{}", expected - 1)));
            assert_eq!(has(&tracker, TRIPPED_LABEL), expected == 3);
            breaker.release_lock(ISSUE).await.unwrap();
        }

        let fourth = breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        assert!(!fourth.acquired);
        assert_eq!(fourth.reason, Some(LockRefusal::CircuitBreakerTripped));
        assert!(
            tracker
                .comments(ISSUE)
                .iter()
                .any(|c| c.body.contains("Circuit Breaker Tripped"))
        );
    }

    #[tokio::test]
    async fn test_hop_ceiling_without_trip_label() {
        let (breaker, tracker, _clock) = setup();
        tracker.add_issue(Issue::new(ISSUE, "t", "").with_labels(["hop:3"]));
        let result = breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        assert_eq!(result.reason, Some(LockRefusal::CircuitBreakerTripped));
    }

    #[tokio::test]
    async fn test_fresh_lock_refused_and_stale_lock_overridden() {
        let (breaker, tracker, clock) = setup();
        assert!(
            breaker
                .acquire_lock_and_increment_hop(ISSUE, &meta())
                .await
                .unwrap()
                .acquired
        );

        clock.advance(Duration::minutes(10));
        let busy = breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        assert_eq!(busy.reason, Some(LockRefusal::AlreadyLocked));

        clock.advance(Duration::minutes(25));
        let taken = breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        assert!(taken.acquired);
        assert_eq!(taken.current_hop, Some(2));
        assert_eq!(
            tracker
                .labels(ISSUE)
                .iter()
                .filter(|l| l.as_str() == breaker.lock_label())
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_lock_without_audit_comment_counts_as_fresh() {
        let (breaker, tracker, clock) = setup();
        tracker.add_issue(Issue::new(ISSUE, "t", "").with_labels(["processing:autofix"]));
        clock.advance(Duration::days(3));
        let result = breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        assert_eq!(result.reason, Some(LockRefusal::AlreadyLocked));
    }

    #[tokio::test]
    async fn test_existing_pr_refused() {
        let (breaker, tracker, _clock) = setup();
        tracker.add_pull(PullRequest {
            number: 7,
            title: "fix".into(),
            body: format!("Fixes #{ISSUE}"),
            head: format!("fix/issue-{ISSUE}"),
            base: "main".into(),
            state: "open".into(),
            labels: Vec::new(),
        });
        let result = breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        assert_eq!(result.reason, Some(LockRefusal::ExistingPr));
        assert!(!has(&tracker, "hop:1"));
    }

    #[tokio::test]
    async fn test_concurrent_acquisitions_exactly_one_wins() {
        let (breaker, tracker, _clock) = setup();
        let (first, second) = (meta(), meta());
        let (a, b) = tokio::join!(
            breaker.acquire_lock_and_increment_hop(ISSUE, &first),
            breaker.acquire_lock_and_increment_hop(ISSUE, &second),
        );
        let results = [a.unwrap(), b.unwrap()];
        assert_eq!(results.iter().filter(|r| r.acquired).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| r.reason == Some(LockRefusal::RaceCondition))
        );
        assert!(has(&tracker, "hop:1"));
        assert!(!has(&tracker, "hop:2"));
    }

    #[tokio::test]
    async fn test_comment_failure_keeps_lock() {
        let (breaker, tracker, _clock) = setup();
        tracker.inject_failure(TrackerOp::AddComment, TrackerError::new(Some(502), "bad gateway"));
        let result = breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        assert!(result.acquired);
        assert!(has(&tracker, "processing:autofix"));
        assert!(tracker.comments(ISSUE).is_empty());
    }

    #[tokio::test]
    async fn test_audit_comment_is_signed() {
        let (breaker, tracker, _clock) = setup();
        breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        let comments = tracker.comments(ISSUE);
        let record = audit::parse_metadata(&comments[0].body).unwrap();
        assert_eq!(record.hop, 1);
        assert!(audit::verify(&CircuitBreakerConfig::default().signature_secret, &record).unwrap());
        assert!(comments[0].body.contains(LOCK_MARKER));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (breaker, tracker, _clock) = setup();
        breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        breaker.release_lock(ISSUE).await.unwrap();
        breaker.release_lock(ISSUE).await.unwrap();
        assert!(!has(&tracker, "processing:autofix"));

        tracker.inject_failure(TrackerOp::RemoveLabel, TrackerError::new(Some(500), "boom"));
        assert!(breaker.release_lock(ISSUE).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_success_clears_hops() {
        let (breaker, tracker, _clock) = setup();
        breaker
            .acquire_lock_and_increment_hop(ISSUE, &meta())
            .await
            .unwrap();
        breaker.release_lock(ISSUE).await.unwrap();
        breaker.mark_success(ISSUE).await.unwrap();
        assert!(!has(&tracker, "hop:1"));
        assert!(has(&tracker, SUCCESS_LABEL));
        assert!(has(&tracker, ATTEMPTED_LABEL));
    }

    #[tokio::test]
    async fn test_reset_restores_hop_zero() {
        let (breaker, tracker, _clock) = setup();
        tracker.add_issue(
            Issue::new(ISSUE, "t", "")
                .with_labels(["robot", "hop:3", "circuit-breaker", "autofix:attempted", "autofix:failed"]),
        );
        breaker.reset(ISSUE).await.unwrap();
        assert_eq!(tracker.labels(ISSUE), vec!["robot", "hop:0"]);
        assert!(
            tracker
                .comments(ISSUE)
                .iter()
                .any(|c| c.body.contains("Circuit Breaker Reset"))
        );

        let state = breaker.can_attempt(ISSUE).await.unwrap();
        assert!(state.allowed);
        assert_eq!(state.phase, CircuitPhase::Idle);
    }

    #[tokio::test]
    async fn test_can_attempt_reports_reason() {
        let (breaker, tracker, _clock) = setup();
        breaker.trip(ISSUE, "manual stop").await.unwrap();
        let state = breaker.can_attempt(ISSUE).await.unwrap();
        assert!(!state.allowed);
        assert_eq!(state.reason.as_deref(), Some("circuit_breaker_tripped"));

        tracker.add_issue(Issue::new(ISSUE, "t", "").with_labels(["hop:3"]));
        let state = breaker.can_attempt(ISSUE).await.unwrap();
        assert_eq!(state.reason.as_deref(), Some("max_hops_reached"));
    }

    #[tokio::test]
    async fn test_ensure_labels_ignores_existing() {
        let (breaker, tracker, _clock) = setup();
        assert_eq!(breaker.ensure_labels().await.unwrap(), 9);
        assert_eq!(breaker.ensure_labels().await.unwrap(), 0);
        assert_eq!(tracker.repo_labels().len(), 9);
    }
}
