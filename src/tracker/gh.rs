use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    Comment, Issue, IssueTracker, LabelSpec, LabelUpdate, NewPullRequest, PullRequest,
    TrackerResult, VersionToken, VersionedIssue,
};
use crate::error::TrackerError;

static HTTP_STATUS: OnceLock<Regex> = OnceLock::new();

fn http_status() -> &'static Regex {
    HTTP_STATUS.get_or_init(|| Regex::new(r"\(HTTP (\d{3})\)").unwrap())
}

/// Extract the status from gh's `... (HTTP 404)` error line.
fn parse_status(stderr: &str) -> Option<u16> {
    http_status()
        .captures(stderr)
        .and_then(|c| c[1].parse().ok())
}

/// Split `gh api -i` output into the ETag header value and the body.
fn split_response(raw: &str) -> (Option<String>, &str) {
    let (head, body) = raw
        .split_once("\r\n\r\n")
        .or_else(|| raw.split_once("\n\n"))
        .unwrap_or(("", raw));
    let etag = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("etag")
            .then(|| value.trim().to_string())
    });
    (etag, body)
}

/// `gh api --paginate` prints each page's JSON array back to back.
fn parse_pages<T: DeserializeOwned>(raw: &str) -> TrackerResult<Vec<T>> {
    let mut items = Vec::new();
    for page in serde_json::Deserializer::from_str(raw).into_iter::<Vec<T>>() {
        let page =
            page.map_err(|e| TrackerError::new(None, format!("Unexpected gh response: {e}")))?;
        items.extend(page);
    }
    Ok(items)
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[derive(Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Deserialize)]
struct RawIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RawLabel>,
    state: String,
}

impl From<RawIssue> for Issue {
    fn from(raw: RawIssue) -> Self {
        Self {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
            state: raw.state,
        }
    }
}

#[derive(Deserialize)]
struct RawComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<RawComment> for Comment {
    fn from(raw: RawComment) -> Self {
        Self {
            id: raw.id,
            body: raw.body.unwrap_or_default(),
            created_at: raw.created_at,
        }
    }
}

#[derive(Deserialize)]
struct RawRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Deserialize)]
struct RawPull {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    head: RawRef,
    base: RawRef,
    state: String,
    #[serde(default)]
    labels: Vec<RawLabel>,
}

impl From<RawPull> for PullRequest {
    fn from(raw: RawPull) -> Self {
        Self {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            head: raw.head.name,
            base: raw.base.name,
            state: raw.state,
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

/// GitHub adapter that shells out to `gh api`.
///
/// Authentication is whatever `gh` is logged in as. Conditional label
/// writes send the issue's ETag as `If-Match`; a 412 is reported as a
/// conflict rather than an error.
pub struct GhTracker {
    repo: String,
    program: String,
}

impl GhTracker {
    /// `repo` is `owner/name`.
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            program: "gh".to_string(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn path(&self, rest: &str) -> String {
        format!("repos/{}/{}", self.repo, rest)
    }

    async fn run(&self, args: &[String], input: Option<serde_json::Value>) -> TrackerResult<String> {
        debug!(args = ?args, "Running gh api");

        let mut command = Command::new(&self.program);
        command
            .arg("api")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if input.is_some() {
            command.args(["--input", "-"]).stdin(Stdio::piped());
        }

        let mut child = command
            .spawn()
            .map_err(|e| TrackerError::new(None, format!("Failed to run gh: {e}")))?;

        if let Some(value) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            let payload = serde_json::to_vec(&value)
                .map_err(|e| TrackerError::new(None, format!("Failed to encode request: {e}")))?;
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| TrackerError::new(None, format!("Failed to write to gh: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TrackerError::new(None, format!("Failed to wait for gh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let status = parse_status(&stderr);
            warn!(args = ?args, ?status, stderr = %stderr, "gh api failed");
            return Err(TrackerError::new(status, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        path: String,
        input: Option<serde_json::Value>,
    ) -> TrackerResult<T> {
        let args = vec!["-X".to_string(), method.to_string(), path];
        let body = self.run(&args, input).await?;
        serde_json::from_str(&body)
            .map_err(|e| TrackerError::new(None, format!("Unexpected gh response: {e}")))
    }

    /// GET every page of a list endpoint.
    async fn list_all<T: DeserializeOwned>(&self, path: String) -> TrackerResult<Vec<T>> {
        let args = vec![
            "--paginate".to_string(),
            "-X".to_string(),
            "GET".to_string(),
            path,
        ];
        let body = self.run(&args, None).await?;
        parse_pages(&body)
    }
}

#[async_trait]
impl IssueTracker for GhTracker {
    async fn get_issue(&self, number: u64) -> TrackerResult<VersionedIssue> {
        let args = vec!["-i".to_string(), self.path(&format!("issues/{number}"))];
        let raw = self.run(&args, None).await?;
        let (etag, body) = split_response(&raw);
        let issue: RawIssue = serde_json::from_str(body)
            .map_err(|e| TrackerError::new(None, format!("Unexpected gh response: {e}")))?;
        let etag = etag
            .ok_or_else(|| TrackerError::new(None, format!("Issue #{number} returned no ETag")))?;
        Ok(VersionedIssue {
            issue: issue.into(),
            version: VersionToken(etag),
        })
    }

    async fn set_labels(
        &self,
        number: u64,
        labels: &[String],
        expected: &VersionToken,
    ) -> TrackerResult<LabelUpdate> {
        let args = vec![
            "-i".to_string(),
            "-X".to_string(),
            "PATCH".to_string(),
            "-H".to_string(),
            format!("If-Match: {expected}"),
            self.path(&format!("issues/{number}")),
        ];
        match self.run(&args, Some(json!({ "labels": labels }))).await {
            Ok(raw) => {
                let (etag, _) = split_response(&raw);
                Ok(LabelUpdate::Applied {
                    version: VersionToken(etag.unwrap_or_default()),
                })
            }
            Err(e) if e.is_precondition_failed() => Ok(LabelUpdate::Conflict),
            Err(e) => Err(e),
        }
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> TrackerResult<()> {
        let _: serde_json::Value = self
            .call(
                "POST",
                self.path(&format!("issues/{number}/labels")),
                Some(json!({ "labels": labels })),
            )
            .await?;
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> TrackerResult<()> {
        let args = vec![
            "-X".to_string(),
            "DELETE".to_string(),
            self.path(&format!("issues/{number}/labels/{}", encode_segment(label))),
        ];
        self.run(&args, None).await?;
        Ok(())
    }

    async fn add_comment(&self, number: u64, body: &str) -> TrackerResult<Comment> {
        let raw: RawComment = self
            .call(
                "POST",
                self.path(&format!("issues/{number}/comments")),
                Some(json!({ "body": body })),
            )
            .await?;
        Ok(raw.into())
    }

    async fn list_comments(&self, number: u64) -> TrackerResult<Vec<Comment>> {
        let raw: Vec<RawComment> = self
            .list_all(self.path(&format!("issues/{number}/comments?per_page=100")))
            .await?;
        Ok(raw.into_iter().map(Into::into).collect())
    }

    async fn list_open_pulls(&self) -> TrackerResult<Vec<PullRequest>> {
        let raw: Vec<RawPull> = self
            .list_all(self.path("pulls?state=open&per_page=100"))
            .await?;
        Ok(raw.into_iter().map(Into::into).collect())
    }

    async fn create_pull(&self, request: &NewPullRequest) -> TrackerResult<PullRequest> {
        let raw: RawPull = self
            .call(
                "POST",
                self.path("pulls"),
                Some(json!({
                    "title": request.title,
                    "body": request.body,
                    "head": request.head,
                    "base": request.base,
                })),
            )
            .await?;
        Ok(raw.into())
    }

    async fn update_pull(
        &self,
        number: u64,
        title: &str,
        body: &str,
    ) -> TrackerResult<PullRequest> {
        let raw: RawPull = self
            .call(
                "PATCH",
                self.path(&format!("pulls/{number}")),
                Some(json!({ "title": title, "body": body })),
            )
            .await?;
        Ok(raw.into())
    }

    /// Pull requests share the issue label endpoint.
    async fn add_pull_labels(&self, number: u64, labels: &[String]) -> TrackerResult<()> {
        self.add_labels(number, labels).await
    }

    async fn create_label(&self, spec: &LabelSpec) -> TrackerResult<()> {
        let _: serde_json::Value = self
            .call(
                "POST",
                self.path("labels"),
                Some(json!({
                    "name": spec.name,
                    "color": spec.color,
                    "description": spec.description,
                })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_from_stderr() {
        assert_eq!(parse_status("gh: Not Found (HTTP 404)"), Some(404));
        assert_eq!(
            parse_status("gh: Precondition Failed (HTTP 412)\n"),
            Some(412)
        );
        assert_eq!(parse_status("error connecting to api.github.com"), None);
    }

    #[test]
    fn test_split_response_reads_etag() {
        let raw = "HTTP/2.0 200 OK\r\nContent-Type: application/json\r\nEtag: W/\"abc\"\r\n\r\n{\"number\":1}";
        let (etag, body) = split_response(raw);
        assert_eq!(etag.as_deref(), Some("W/\"abc\""));
        assert_eq!(body, "{\"number\":1}");
    }

    #[test]
    fn test_raw_issue_maps_label_names() {
        let raw: RawIssue = serde_json::from_str(
            r#"{"number": 3, "title": "t", "body": null, "state": "open",
                "labels": [{"name": "robot", "color": "fff"}, {"name": "hop:1"}]}"#,
        )
        .unwrap();
        let issue: Issue = raw.into();
        assert_eq!(issue.labels, vec!["robot", "hop:1"]);
        assert_eq!(issue.body, "");
    }

    #[test]
    fn test_parse_pages_concatenates_arrays() {
        let raw = concat!(
            r#"[{"id": 1, "body": "first", "created_at": "2025-03-01T09:00:00Z"}]"#,
            "\n",
            r#"[{"id": 2, "body": "Lock acquired at 2025-03-02T09:00:00Z", "created_at": "2025-03-02T09:00:00Z"}]"#,
        );
        let comments: Vec<RawComment> = parse_pages(raw).unwrap();
        let ids: Vec<u64> = comments.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);

        assert!(parse_pages::<RawComment>("[]").unwrap().is_empty());
        assert!(parse_pages::<RawComment>("[{\"id\": 1}] oops").is_err());
    }

    #[test]
    fn test_raw_pull_maps_labels() {
        let raw: RawPull = serde_json::from_str(
            r#"{"number": 12, "title": "fix", "body": null, "state": "open",
                "head": {"ref": "fix/issue-3"}, "base": {"ref": "main"},
                "labels": [{"name": "autofix"}]}"#,
        )
        .unwrap();
        let pull: PullRequest = raw.into();
        assert_eq!(pull.head, "fix/issue-3");
        assert_eq!(pull.labels, vec!["autofix"]);
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("processing:autofix"), "processing:autofix");
        assert_eq!(encode_segment("needs review"), "needs%20review");
    }

    #[tokio::test]
    async fn test_missing_program_is_transport_error() {
        let tracker = GhTracker::new("acme/ext").with_program("definitely-not-gh-binary");
        let err = tracker.get_issue(1).await.unwrap_err();
        assert_eq!(err.status, None);
        assert!(err.is_transient());
    }
}
