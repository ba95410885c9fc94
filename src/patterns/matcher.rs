use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::library::{Pattern, PatternLibrary};
use crate::config::PatternConfig;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    Exact,
    Fuzzy,
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Fuzzy => write!(f, "fuzzy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub pattern: Pattern,
    pub strategy: MatchStrategy,
    pub confidence: f64,
}

/// Read-only lookup over a library snapshot.
pub struct PatternMatcher {
    library: PatternLibrary,
    threshold: f64,
    fuzzy_penalty: f64,
}

impl PatternMatcher {
    pub fn new(library: PatternLibrary, config: &PatternConfig) -> Self {
        Self {
            library,
            threshold: config.confidence_threshold,
            fuzzy_penalty: config.fuzzy_penalty,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn len(&self) -> usize {
        self.library.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.library.patterns.is_empty()
    }

    /// Exact fingerprint hit first; otherwise the best same-type, same-file
    /// candidate after the fuzzy penalty. Either must clear the threshold.
    pub fn find(&self, fingerprint: &Fingerprint) -> Option<PatternMatch> {
        if self.library.patterns.is_empty() {
            return None;
        }

        if let Some(hit) = self.find_exact(fingerprint) {
            debug!(pattern = %hit.pattern.id, confidence = hit.confidence, "Exact pattern match");
            return Some(hit);
        }

        let hit = self.find_fuzzy(fingerprint)?;
        debug!(pattern = %hit.pattern.id, confidence = hit.confidence, "Fuzzy pattern match");
        Some(hit)
    }

    fn find_exact(&self, fingerprint: &Fingerprint) -> Option<PatternMatch> {
        let candidate = self.library.find_by_fingerprint(&fingerprint.id)?;
        let confidence = candidate.resolved_confidence();
        (confidence >= self.threshold).then(|| PatternMatch {
            pattern: candidate.clone(),
            strategy: MatchStrategy::Exact,
            confidence,
        })
    }

    fn find_fuzzy(&self, fingerprint: &Fingerprint) -> Option<PatternMatch> {
        self.library
            .patterns
            .iter()
            .filter(|p| p.error_type == fingerprint.error_type && p.file_path == fingerprint.file_path)
            .map(|p| (p, p.resolved_confidence() * self.fuzzy_penalty))
            .filter(|(_, confidence)| *confidence >= self.threshold)
            // first of equals wins
            .min_by(|a, b| b.1.total_cmp(&a.1))
            .map(|(p, confidence)| PatternMatch {
                pattern: p.clone(),
                strategy: MatchStrategy::Fuzzy,
                confidence,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{RawError, fingerprint};

    fn fp() -> Fingerprint {
        fingerprint(&RawError::new(
            "TypeError",
            "Cannot read properties of undefined",
            "Error\n    at render (/app/src/view.ts:10:4)",
        ))
    }

    fn entry(id: &str, fingerprint_id: &str, confidence: f64) -> Pattern {
        Pattern {
            id: id.into(),
            fingerprint_id: fingerprint_id.into(),
            error_type: "TypeError".into(),
            file_path: "/app/src/view.ts".into(),
            patch: format!("patch-{id}"),
            description: None,
            confidence: Some(confidence),
            success_rate: None,
            uses: None,
        }
    }

    fn matcher(patterns: Vec<Pattern>) -> PatternMatcher {
        PatternMatcher::new(
            PatternLibrary {
                patterns,
                ..Default::default()
            },
            &PatternConfig::default(),
        )
    }

    #[test]
    fn test_empty_library_never_matches() {
        assert!(matcher(vec![]).find(&fp()).is_none());
    }

    #[test]
    fn test_exact_match_preferred() {
        let fp = fp();
        let m = matcher(vec![entry("fuzzy", "other", 1.0), entry("exact", &fp.id, 0.85)]);
        let hit = m.find(&fp).unwrap();
        assert_eq!(hit.strategy, MatchStrategy::Exact);
        assert_eq!(hit.pattern.id, "exact");
        assert_eq!(hit.confidence, 0.85);
    }

    #[test]
    fn test_low_confidence_exact_falls_through_to_fuzzy() {
        let fp = fp();
        let m = matcher(vec![entry("weak", &fp.id, 0.5), entry("strong", "other", 1.0)]);
        let hit = m.find(&fp).unwrap();
        assert_eq!(hit.strategy, MatchStrategy::Fuzzy);
        assert_eq!(hit.pattern.id, "strong");
        assert!((hit.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_fuzzy_penalty_can_drop_below_threshold() {
        let fp = fp();
        // 0.85 * 0.9 = 0.765 < 0.8
        let m = matcher(vec![entry("near", "other", 0.85)]);
        assert!(m.find(&fp).is_none());
    }

    #[test]
    fn test_fuzzy_requires_same_type_and_file() {
        let fp = fp();
        let mut wrong_file = entry("wrong", "other", 1.0);
        wrong_file.file_path = "/app/src/other.ts".into();
        assert!(matcher(vec![wrong_file]).find(&fp).is_none());
    }

    #[test]
    fn test_fuzzy_picks_highest_confidence() {
        let fp = fp();
        let m = matcher(vec![entry("a", "x", 0.95), entry("b", "y", 1.0)]);
        assert_eq!(m.find(&fp).unwrap().pattern.id, "b");
    }
}
