use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTotals {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
}

impl TokenTotals {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }
}

/// One line per batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub timestamp: DateTime<Utc>,
    pub repo: String,
    #[serde(default)]
    pub fingerprints_processed: Vec<String>,
    #[serde(default)]
    pub prs_created: u32,
    #[serde(default)]
    pub prs_updated: u32,
    #[serde(default)]
    pub cooldowns: u32,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: TokenTotals,
    /// Milliseconds.
    #[serde(default)]
    pub latency: u64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub patterns_used: u32,
    #[serde(default)]
    pub zero_cost_fixes: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetrics {
    pub runs: usize,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_prs: u64,
    pub avg_latency: f64,
    pub error_rate: f64,
}

pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, run: &RunMetrics) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let line = serde_json::to_string(run)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.flush().await?;

        debug!(path = %self.path.display(), repo = %run.repo, "Appended run metrics");
        Ok(())
    }

    pub async fn load_since(&self, since: DateTime<Utc>) -> Result<Vec<RunMetrics>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<RunMetrics>(line) {
                Ok(run) if run.timestamp >= since => Some(run),
                Ok(_) => None,
                Err(e) => {
                    warn!(line = %line, error = %e, "Skipping invalid run log line");
                    None
                }
            })
            .collect())
    }

    pub async fn aggregate(&self, since: DateTime<Utc>) -> Result<AggregateMetrics> {
        let runs = self.load_since(since).await?;
        if runs.is_empty() {
            return Ok(AggregateMetrics::default());
        }

        let count = runs.len();
        let errored = runs.iter().filter(|r| !r.errors.is_empty()).count();
        Ok(AggregateMetrics {
            runs: count,
            total_cost: runs.iter().map(|r| r.cost).sum(),
            total_tokens: runs.iter().map(|r| r.tokens.total()).sum(),
            total_prs: runs
                .iter()
                .map(|r| u64::from(r.prs_created + r.prs_updated))
                .sum(),
            avg_latency: runs.iter().map(|r| r.latency as f64).sum::<f64>() / count as f64,
            error_rate: errored as f64 / count as f64,
        })
    }
}
