//! Token pricing and per-run cost accounting.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GovernorError, Result};
use crate::routing::Tier;

pub const DEFAULT_FIXES_PER_YEAR: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Deepseek,
    Gpt5,
}

impl ModelFamily {
    /// USD per token: (input, output).
    pub fn pricing(&self) -> (f64, f64) {
        match self {
            Self::Deepseek => (0.00027 / 1000.0, 0.0011 / 1000.0),
            Self::Gpt5 => (0.01 / 1000.0, 0.03 / 1000.0),
        }
    }

    pub fn from_model(model: &str) -> Option<Self> {
        let lower = model.to_ascii_lowercase();
        if lower.starts_with("deepseek") {
            Some(Self::Deepseek)
        } else if lower.starts_with("gpt-5") || lower.starts_with("gpt5") {
            Some(Self::Gpt5)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub model: ModelFamily,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub issue_number: u64,
    pub tier: Tier,
}

impl TokenUsage {
    pub fn cost(&self) -> f64 {
        let (input, output) = self.model.pricing();
        self.input_tokens as f64 * input + self.output_tokens as f64 * output
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostReport {
    pub total_fixes: usize,
    pub total_cost: f64,
    pub projected_annual_cost: f64,
    pub breakdown: BTreeMap<Tier, f64>,
    pub tier_distribution: BTreeMap<Tier, usize>,
}

/// Records model usage and refuses any single usage above the per-fix cap.
pub struct CostTracker {
    per_fix_limit: f64,
    usage: RwLock<Vec<TokenUsage>>,
}

impl CostTracker {
    pub fn new(per_fix_limit: f64) -> Self {
        Self {
            per_fix_limit,
            usage: RwLock::new(Vec::new()),
        }
    }

    /// Returns the cost of `usage`, or `CostLimit` without recording it.
    pub fn track_usage(&self, usage: TokenUsage) -> Result<f64> {
        let cost = usage.cost();
        if cost > self.per_fix_limit {
            warn!(cost, limit = self.per_fix_limit, issue = usage.issue_number, "Fix exceeded budget");
            return Err(GovernorError::CostLimit(format!(
                "Fix exceeded budget: ${cost:.4} > ${}",
                self.per_fix_limit
            )));
        }
        self.usage.write().push(usage);
        Ok(cost)
    }

    pub fn total_cost(&self) -> f64 {
        self.usage.read().iter().map(TokenUsage::cost).sum()
    }

    pub fn cost_for_issue(&self, issue_number: u64) -> f64 {
        self.usage
            .read()
            .iter()
            .filter(|u| u.issue_number == issue_number)
            .map(TokenUsage::cost)
            .sum()
    }

    pub fn project_annual_cost(&self, fixes_per_year: u32) -> f64 {
        let usage = self.usage.read();
        if usage.is_empty() {
            return 0.0;
        }
        let total: f64 = usage.iter().map(TokenUsage::cost).sum();
        total / usage.len() as f64 * f64::from(fixes_per_year)
    }

    pub fn report(&self) -> CostReport {
        let usage = self.usage.read();
        let mut breakdown: BTreeMap<Tier, f64> = Tier::ALL.iter().map(|t| (*t, 0.0)).collect();
        let mut distribution: BTreeMap<Tier, usize> = Tier::ALL.iter().map(|t| (*t, 0)).collect();
        for u in usage.iter() {
            *breakdown.entry(u.tier).or_default() += u.cost();
            *distribution.entry(u.tier).or_default() += 1;
        }
        let total_cost: f64 = breakdown.values().sum();
        let total_fixes = usage.len();
        drop(usage);

        CostReport {
            total_fixes,
            total_cost,
            projected_annual_cost: self.project_annual_cost(DEFAULT_FIXES_PER_YEAR),
            breakdown,
            tier_distribution: distribution,
        }
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new(0.01)
    }
}
