use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    Comment, Issue, IssueTracker, LabelSpec, LabelUpdate, NewPullRequest, PullRequest,
    TrackerResult, VersionToken, VersionedIssue,
};
use crate::clock::{SharedClock, system_clock};
use crate::error::TrackerError;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerOp {
    GetIssue,
    SetLabels,
    AddLabels,
    RemoveLabel,
    AddComment,
    ListComments,
    ListOpenPulls,
    CreatePull,
    UpdatePull,
    AddPullLabels,
    CreateLabel,
}

struct IssueRecord {
    issue: Issue,
    version: u64,
    comments: Vec<Comment>,
}

impl IssueRecord {
    fn token(&self) -> VersionToken {
        VersionToken(format!("W/\"{}\"", self.version))
    }

    fn touch(&mut self) {
        self.version += 1;
    }
}

#[derive(Default)]
struct TrackerState {
    issues: BTreeMap<u64, IssueRecord>,
    pulls: Vec<PullRequest>,
    repo_labels: BTreeSet<String>,
    failures: HashMap<TrackerOp, VecDeque<TrackerError>>,
    next_comment_id: u64,
    next_pull_number: u64,
}

/// In-process tracker with the same conditional-write contract as the real one.
///
/// Every label change bumps the issue version, so a token read before any
/// write goes stale. Each call yields to the scheduler first, which lets
/// concurrent callers interleave the way separate processes would.
pub struct InMemoryTracker {
    state: Mutex<TrackerState>,
    clock: SharedClock,
}

impl Default for InMemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next_comment_id: 1,
                next_pull_number: 1000,
                ..Default::default()
            }),
            clock,
        }
    }

    pub fn add_issue(&self, issue: Issue) {
        let mut state = self.state.lock();
        state.issues.insert(
            issue.number,
            IssueRecord {
                issue,
                version: 1,
                comments: Vec::new(),
            },
        );
    }

    pub fn add_pull(&self, pull: PullRequest) {
        let mut state = self.state.lock();
        state.next_pull_number = state.next_pull_number.max(pull.number + 1);
        state.pulls.push(pull);
    }

    /// Queue an error for the next call of `op`. Multiple injections are
    /// consumed in order.
    pub fn inject_failure(&self, op: TrackerOp, error: TrackerError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn labels(&self, number: u64) -> Vec<String> {
        self.state
            .lock()
            .issues
            .get(&number)
            .map(|r| r.issue.labels.clone())
            .unwrap_or_default()
    }

    pub fn comments(&self, number: u64) -> Vec<Comment> {
        self.state
            .lock()
            .issues
            .get(&number)
            .map(|r| r.comments.clone())
            .unwrap_or_default()
    }

    pub fn pulls(&self) -> Vec<PullRequest> {
        self.state.lock().pulls.clone()
    }

    pub fn repo_labels(&self) -> Vec<String> {
        self.state.lock().repo_labels.iter().cloned().collect()
    }

    fn take_failure(state: &mut TrackerState, op: TrackerOp) -> TrackerResult<()> {
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record_mut(state: &mut TrackerState, number: u64) -> TrackerResult<&mut IssueRecord> {
        state
            .issues
            .get_mut(&number)
            .ok_or_else(|| TrackerError::not_found(format!("Issue #{number} not found")))
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    async fn get_issue(&self, number: u64) -> TrackerResult<VersionedIssue> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::GetIssue)?;
        let record = Self::record_mut(&mut state, number)?;
        Ok(VersionedIssue {
            issue: record.issue.clone(),
            version: record.token(),
        })
    }

    async fn set_labels(
        &self,
        number: u64,
        labels: &[String],
        expected: &VersionToken,
    ) -> TrackerResult<LabelUpdate> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::SetLabels)?;
        let record = Self::record_mut(&mut state, number)?;
        if record.token() != *expected {
            return Ok(LabelUpdate::Conflict);
        }
        record.issue.labels = labels.to_vec();
        record.touch();
        Ok(LabelUpdate::Applied {
            version: record.token(),
        })
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> TrackerResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::AddLabels)?;
        let record = Self::record_mut(&mut state, number)?;
        for label in labels {
            if !record.issue.has_label(label) {
                record.issue.labels.push(label.clone());
            }
        }
        record.touch();
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> TrackerResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::RemoveLabel)?;
        let record = Self::record_mut(&mut state, number)?;
        let before = record.issue.labels.len();
        record.issue.labels.retain(|l| l != label);
        if record.issue.labels.len() == before {
            return Err(TrackerError::not_found(format!("Label does not exist: {label}")));
        }
        record.touch();
        Ok(())
    }

    async fn add_comment(&self, number: u64, body: &str) -> TrackerResult<Comment> {
        tokio::task::yield_now().await;
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::AddComment)?;
        let id = state.next_comment_id;
        let record = Self::record_mut(&mut state, number)?;
        let comment = Comment {
            id,
            body: body.to_string(),
            created_at: now,
        };
        record.comments.push(comment.clone());
        state.next_comment_id += 1;
        Ok(comment)
    }

    async fn list_comments(&self, number: u64) -> TrackerResult<Vec<Comment>> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::ListComments)?;
        Ok(Self::record_mut(&mut state, number)?.comments.clone())
    }

    async fn list_open_pulls(&self) -> TrackerResult<Vec<PullRequest>> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::ListOpenPulls)?;
        Ok(state
            .pulls
            .iter()
            .filter(|p| p.state == "open")
            .cloned()
            .collect())
    }

    async fn create_pull(&self, request: &NewPullRequest) -> TrackerResult<PullRequest> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::CreatePull)?;
        if state
            .pulls
            .iter()
            .any(|p| p.state == "open" && p.head == request.head)
        {
            return Err(TrackerError::new(
                Some(422),
                format!("A pull request already exists for {}", request.head),
            ));
        }
        let pull = PullRequest {
            number: state.next_pull_number,
            title: request.title.clone(),
            body: request.body.clone(),
            head: request.head.clone(),
            base: request.base.clone(),
            state: "open".to_string(),
            labels: Vec::new(),
        };
        state.next_pull_number += 1;
        state.pulls.push(pull.clone());
        Ok(pull)
    }

    async fn update_pull(
        &self,
        number: u64,
        title: &str,
        body: &str,
    ) -> TrackerResult<PullRequest> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::UpdatePull)?;
        let pull = state
            .pulls
            .iter_mut()
            .find(|p| p.number == number)
            .ok_or_else(|| TrackerError::not_found(format!("Pull request #{number} not found")))?;
        pull.title = title.to_string();
        pull.body = body.to_string();
        Ok(pull.clone())
    }

    async fn add_pull_labels(&self, number: u64, labels: &[String]) -> TrackerResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::AddPullLabels)?;
        let pull = state
            .pulls
            .iter_mut()
            .find(|p| p.number == number)
            .ok_or_else(|| TrackerError::not_found(format!("Pull request #{number} not found")))?;
        for label in labels {
            if !pull.labels.contains(label) {
                pull.labels.push(label.clone());
            }
        }
        Ok(())
    }

    async fn create_label(&self, spec: &LabelSpec) -> TrackerResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::take_failure(&mut state, TrackerOp::CreateLabel)?;
        if !state.repo_labels.insert(spec.name.clone()) {
            return Err(TrackerError::new(
                Some(422),
                format!("Label {} already exists", spec.name),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> InMemoryTracker {
        let tracker = InMemoryTracker::new();
        tracker.add_issue(Issue::new(7, "crash", "body").with_labels(["robot"]));
        tracker
    }

    #[tokio::test]
    async fn test_stale_token_conflicts() {
        let tracker = tracker();
        let read = tracker.get_issue(7).await.unwrap();

        let first = tracker
            .set_labels(7, &["robot".into(), "hop:1".into()], &read.version)
            .await
            .unwrap();
        assert!(matches!(first, LabelUpdate::Applied { .. }));

        let second = tracker
            .set_labels(7, &["robot".into()], &read.version)
            .await
            .unwrap();
        assert_eq!(second, LabelUpdate::Conflict);
        assert_eq!(tracker.labels(7), vec!["robot", "hop:1"]);
    }

    #[tokio::test]
    async fn test_any_label_change_bumps_version() {
        let tracker = tracker();
        let before = tracker.get_issue(7).await.unwrap().version;
        tracker.add_labels(7, &["autofix:failed".into()]).await.unwrap();
        let after = tracker.get_issue(7).await.unwrap().version;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_remove_missing_label_is_not_found() {
        let tracker = tracker();
        let err = tracker.remove_label(7, "processing:autofix").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(tracker.get_issue(99).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let tracker = tracker();
        tracker.inject_failure(TrackerOp::AddComment, TrackerError::new(Some(502), "bad gateway"));
        assert_eq!(
            tracker.add_comment(7, "hi").await.unwrap_err().status,
            Some(502)
        );
        let comment = tracker.add_comment(7, "hi").await.unwrap();
        assert_eq!(tracker.comments(7), vec![comment]);
    }

    #[tokio::test]
    async fn test_create_label_twice_is_422() {
        let tracker = tracker();
        let spec = LabelSpec::new("hop:0", "0E8A16", "idle");
        tracker.create_label(&spec).await.unwrap();
        assert_eq!(tracker.create_label(&spec).await.unwrap_err().status, Some(422));
    }

    #[tokio::test]
    async fn test_duplicate_open_pull_for_head_rejected() {
        let tracker = tracker();
        let request = NewPullRequest {
            title: "fix".into(),
            body: "Fixes #7".into(),
            head: "fix/issue-7".into(),
            base: "main".into(),
        };
        let pr = tracker.create_pull(&request).await.unwrap();
        assert_eq!(tracker.list_open_pulls().await.unwrap(), vec![pr]);
        assert_eq!(tracker.create_pull(&request).await.unwrap_err().status, Some(422));
    }

    #[tokio::test]
    async fn test_pull_labels_are_merged() {
        let tracker = tracker();
        let pr = tracker
            .create_pull(&NewPullRequest {
                title: "fix".into(),
                body: "Fixes #7".into(),
                head: "fix/issue-7".into(),
                base: "main".into(),
            })
            .await
            .unwrap();

        tracker.add_pull_labels(pr.number, &["autofix".into()]).await.unwrap();
        tracker
            .add_pull_labels(pr.number, &["autofix".into(), "bot".into()])
            .await
            .unwrap();
        assert_eq!(tracker.pulls()[0].labels, vec!["autofix", "bot"]);
        assert!(tracker.add_pull_labels(1, &[]).await.unwrap_err().is_not_found());
    }
}
