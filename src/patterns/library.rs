use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::SharedClock;
use crate::error::Result;
use crate::storage::StateStore;

pub const LIBRARY_VERSION: u32 = 1;

/// A cached fix keyed by the fingerprint it was learned from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub id: String,
    pub fingerprint_id: String,
    pub error_type: String,
    pub file_path: String,
    pub patch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<u32>,
}

impl Pattern {
    /// Effective confidence used for matching.
    ///
    /// Explicit confidence wins when non-zero, else the observed success rate.
    /// Each use adds 0.05, up to +0.2. Capped at 1.0.
    pub fn resolved_confidence(&self) -> f64 {
        let explicit = self.confidence.unwrap_or(0.0);
        let success_rate = self.success_rate.unwrap_or(0.0);
        let uses = self.uses.unwrap_or(0);

        if explicit == 0.0 && success_rate == 0.0 {
            return 0.0;
        }

        let weighted = if explicit != 0.0 { explicit } else { success_rate };
        if uses == 0 {
            return weighted;
        }

        let adjustment = (0.05 * f64::from(uses)).min(0.2);
        (weighted + adjustment).min(1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_patterns: Option<usize>,
    /// Caller-supplied keys are kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternLibrary {
    pub version: u32,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub metadata: LibraryMetadata,
}

impl Default for PatternLibrary {
    fn default() -> Self {
        Self {
            version: LIBRARY_VERSION,
            patterns: Vec::new(),
            metadata: LibraryMetadata::default(),
        }
    }
}

impl PatternLibrary {
    pub fn find_by_fingerprint(&self, fingerprint_id: &str) -> Option<&Pattern> {
        self.patterns
            .iter()
            .find(|p| p.fingerprint_id == fingerprint_id)
    }

    pub fn find_mut(&mut self, pattern_id: &str) -> Option<&mut Pattern> {
        self.patterns.iter_mut().find(|p| p.id == pattern_id)
    }

    pub fn remove(&mut self, pattern_id: &str) -> bool {
        let before = self.patterns.len();
        self.patterns.retain(|p| p.id != pattern_id);
        self.patterns.len() != before
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.metadata.last_updated = Some(now);
        self.metadata.total_patterns = Some(self.patterns.len());
    }
}

/// Serialized access to the persisted library shared by extractor and learner.
pub struct PatternLibraryStore {
    store: Arc<dyn StateStore<PatternLibrary>>,
    clock: SharedClock,
    guard: Mutex<()>,
}

impl PatternLibraryStore {
    pub fn new(store: Arc<dyn StateStore<PatternLibrary>>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            guard: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<PatternLibrary> {
        Ok(self.store.load().await?.unwrap_or_default())
    }

    /// Load, apply `f`, and persist only when `f` returns `Some`.
    /// Metadata (`last_updated`, `total_patterns`) is refreshed on every write.
    pub async fn modify<F, R>(&self, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut PatternLibrary) -> Option<R> + Send,
        R: Send,
    {
        let _guard = self.guard.lock().await;
        let mut library = self.load().await?;

        let Some(result) = f(&mut library) else {
            return Ok(None);
        };

        library.touch(self.clock.now());
        self.store.save(&library).await?;
        debug!(total = library.patterns.len(), "Pattern library saved");
        Ok(Some(result))
    }
}
