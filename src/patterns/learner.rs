use std::sync::Arc;

use tracing::{debug, info};

use super::library::PatternLibraryStore;
use crate::config::PatternConfig;
use crate::error::Result;

const DEFAULT_PRIOR: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct LearningEvent {
    pub pattern_id: String,
    pub success: bool,
}

impl LearningEvent {
    pub fn new(pattern_id: impl Into<String>, success: bool) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            success,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LearnOutcome {
    /// Learning mode is off.
    Disabled,
    /// No pattern with that id.
    Unknown,
    Updated { success_rate: f64, uses: u32 },
    /// Too many uses with a poor success rate; removed from the library.
    Retired { success_rate: f64, uses: u32 },
}

/// Exponential moving average over pattern outcomes.
pub struct PatternLearner {
    library: Arc<PatternLibraryStore>,
    enabled: bool,
    alpha: f64,
    min_uses_for_retirement: u32,
    retirement_threshold: f64,
}

impl PatternLearner {
    pub fn new(library: Arc<PatternLibraryStore>, config: &PatternConfig) -> Self {
        Self {
            library,
            enabled: config.learning_enabled,
            alpha: config.learning_rate,
            min_uses_for_retirement: config.min_uses_for_retirement,
            retirement_threshold: config.retirement_threshold,
        }
    }

    /// Next success rate. The first observation replaces the prior unless
    /// it is a failure, in which case the prior is kept.
    pub fn next_success_rate(&self, previous: Option<f64>, uses: u32, success: bool) -> f64 {
        let previous = previous.unwrap_or(DEFAULT_PRIOR);
        let outcome = if success { 1.0 } else { 0.0 };
        let updated = if uses > 0 {
            (1.0 - self.alpha) * previous + self.alpha * outcome
        } else if outcome > 0.0 {
            outcome
        } else {
            previous
        };
        (updated * 10_000.0).round() / 10_000.0
    }

    pub async fn learn(&self, event: LearningEvent) -> Result<LearnOutcome> {
        if !self.enabled {
            return Ok(LearnOutcome::Disabled);
        }

        let outcome = self
            .library
            .modify(|library| {
                let pattern = library.find_mut(&event.pattern_id)?;
                let uses = pattern.uses.unwrap_or(0);
                let success_rate = self.next_success_rate(pattern.success_rate, uses, event.success);
                let uses = uses + 1;
                pattern.success_rate = Some(success_rate);
                pattern.uses = Some(uses);

                if uses >= self.min_uses_for_retirement && success_rate < self.retirement_threshold {
                    library.remove(&event.pattern_id);
                    return Some(LearnOutcome::Retired { success_rate, uses });
                }
                Some(LearnOutcome::Updated { success_rate, uses })
            })
            .await?
            .unwrap_or(LearnOutcome::Unknown);

        match &outcome {
            LearnOutcome::Retired { success_rate, uses } => {
                info!(pattern = %event.pattern_id, success_rate, uses, "Retired underperforming pattern");
            }
            LearnOutcome::Updated { success_rate, uses } => {
                debug!(pattern = %event.pattern_id, success_rate, uses, "Pattern updated");
            }
            _ => debug!(pattern = %event.pattern_id, "Learning event for unknown pattern"),
        }
        Ok(outcome)
    }
}
