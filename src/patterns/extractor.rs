use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::library::{Pattern, PatternLibraryStore};
use crate::error::Result;
use crate::fingerprint::Fingerprint;

const INITIAL_CONFIDENCE: f64 = 0.9;
const INITIAL_SUCCESS_RATE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct ExtractInput {
    pub fingerprint: Fingerprint,
    pub patch: String,
    pub description: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ExtractInput {
    pub fn new(fingerprint: Fingerprint, patch: impl Into<String>) -> Self {
        Self {
            fingerprint,
            patch: patch.into(),
            description: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Turns a verified fix into a reusable pattern.
pub struct PatternExtractor {
    library: Arc<PatternLibraryStore>,
    enabled: bool,
}

impl PatternExtractor {
    pub fn new(library: Arc<PatternLibraryStore>, enabled: bool) -> Self {
        Self { library, enabled }
    }

    /// Returns `None` outside learning mode. A fingerprint already in the
    /// library returns the existing pattern untouched.
    pub async fn extract(&self, input: ExtractInput) -> Result<Option<Pattern>> {
        if !self.enabled {
            return Ok(None);
        }

        if let Some(existing) = self
            .library
            .load()
            .await?
            .find_by_fingerprint(&input.fingerprint.id)
        {
            return Ok(Some(existing.clone()));
        }

        let ExtractInput {
            fingerprint,
            patch,
            description,
            metadata,
        } = input;

        self.library
            .modify(move |library| {
                if let Some(existing) = library.find_by_fingerprint(&fingerprint.id) {
                    return Some(existing.clone());
                }

                let pattern = Pattern {
                    id: Uuid::new_v4().to_string(),
                    fingerprint_id: fingerprint.id.clone(),
                    error_type: fingerprint.error_type.clone(),
                    file_path: fingerprint.file_path.clone(),
                    patch,
                    description,
                    confidence: Some(INITIAL_CONFIDENCE),
                    success_rate: Some(INITIAL_SUCCESS_RATE),
                    uses: Some(0),
                };
                library.patterns.push(pattern.clone());
                library.metadata.extra.extend(metadata);

                info!(pattern = %pattern.id, fingerprint = %fingerprint.id, "Extracted new pattern");
                Some(pattern)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::fingerprint::{RawError, fingerprint};
    use crate::patterns::PatternLibrary;
    use crate::storage::MemoryStore;

    fn setup(enabled: bool) -> (PatternExtractor, MemoryStore<PatternLibrary>) {
        let mem = MemoryStore::new();
        let library = Arc::new(PatternLibraryStore::new(Arc::new(mem.clone()), system_clock()));
        (PatternExtractor::new(library, enabled), mem)
    }

    fn fp() -> Fingerprint {
        fingerprint(&RawError::new(
            "TypeError",
            "x is undefined",
            "at main (/app/src/main.ts:3:1)",
        ))
    }

    #[tokio::test]
    async fn test_disabled_outside_learning_mode() {
        let (extractor, mem) = setup(false);
        let out = extractor.extract(ExtractInput::new(fp(), "patch")).await.unwrap();
        assert!(out.is_none());
        assert!(mem.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_extracts_with_initial_scores() {
        let (extractor, mem) = setup(true);
        let pattern = extractor
            .extract(ExtractInput::new(fp(), "patch").with_description("fix main"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pattern.confidence, Some(0.9));
        assert_eq!(pattern.success_rate, Some(1.0));
        assert_eq!(pattern.uses, Some(0));
        assert_eq!(pattern.file_path, "/app/src/main.ts");

        let stored = mem.snapshot().unwrap();
        assert_eq!(stored.metadata.total_patterns, Some(1));
        assert!(stored.metadata.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_dedupes_by_fingerprint() {
        let (extractor, mem) = setup(true);
        let first = extractor.extract(ExtractInput::new(fp(), "a")).await.unwrap().unwrap();
        let second = extractor.extract(ExtractInput::new(fp(), "b")).await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.patch, "a");
        assert_eq!(mem.snapshot().unwrap().patterns.len(), 1);
    }
}
