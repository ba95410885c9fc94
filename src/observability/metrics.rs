use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::routing::Tier;

/// Fix, retry, cost and redaction counters for one process.
///
/// Constructed once and passed to the orchestrator; nothing here is global.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    fixes_total: AtomicU64,
    fixes_successful: AtomicU64,
    fixes_failed: AtomicU64,
    retries_total: AtomicU64,
    escalations: AtomicU64,
    redactions_total: AtomicU64,
    fixes_by_tier: RwLock<HashMap<Tier, u64>>,
    cost_by_tier: RwLock<HashMap<Tier, f64>>,
    cost_total: RwLock<f64>,
    redactions_by_type: RwLock<HashMap<String, u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `tier` is `None` for pattern replays, which only count toward totals.
    pub fn record_fix(&self, tier: Option<Tier>, success: bool, cost: f64) {
        self.fixes_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.fixes_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fixes_failed.fetch_add(1, Ordering::Relaxed);
        }

        *self.cost_total.write() += cost;
        if let Some(tier) = tier {
            *self.fixes_by_tier.write().entry(tier).or_insert(0) += 1;
            *self.cost_by_tier.write().entry(tier).or_insert(0.0) += cost;
        }
    }

    pub fn record_retry(&self, escalated: bool) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
        if escalated {
            self.escalations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_redaction(&self, kind: &str) {
        self.redactions_total.fetch_add(1, Ordering::Relaxed);
        *self
            .redactions_by_type
            .write()
            .entry(kind.to_string())
            .or_insert(0) += 1;
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.fixes_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.fixes_successful.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let fixes_by_tier = self.fixes_by_tier.read();
        let cost_by_tier = self.cost_by_tier.read();

        MetricsSnapshot {
            fixes: FixSnapshot {
                total: self.fixes_total.load(Ordering::Relaxed),
                successful: self.fixes_successful.load(Ordering::Relaxed),
                failed: self.fixes_failed.load(Ordering::Relaxed),
                by_tier: Tier::ALL
                    .iter()
                    .map(|t| (t.to_string(), fixes_by_tier.get(t).copied().unwrap_or(0)))
                    .collect(),
            },
            retries: RetrySnapshot {
                total: self.retries_total.load(Ordering::Relaxed),
                escalations: self.escalations.load(Ordering::Relaxed),
            },
            sanitization: SanitizationSnapshot {
                total_redactions: self.redactions_total.load(Ordering::Relaxed),
                by_type: self
                    .redactions_by_type
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
            },
            cost: CostSnapshot {
                total: *self.cost_total.read(),
                by_tier: Tier::ALL
                    .iter()
                    .map(|t| (t.to_string(), cost_by_tier.get(t).copied().unwrap_or(0.0)))
                    .collect(),
            },
            success_rate: self.success_rate(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.fixes_total,
            &self.fixes_successful,
            &self.fixes_failed,
            &self.retries_total,
            &self.escalations,
            &self.redactions_total,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.fixes_by_tier.write().clear();
        self.cost_by_tier.write().clear();
        *self.cost_total.write() = 0.0;
        self.redactions_by_type.write().clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub fixes: FixSnapshot,
    pub retries: RetrySnapshot,
    pub sanitization: SanitizationSnapshot,
    pub cost: CostSnapshot,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub by_tier: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrySnapshot {
    pub total: u64,
    pub escalations: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizationSnapshot {
    pub total_redactions: u64,
    pub by_type: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSnapshot {
    pub total: f64,
    pub by_tier: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_fix_by_tier() {
        let metrics = MetricsCollector::new();
        metrics.record_fix(Some(Tier::One), true, 0.002);
        metrics.record_fix(Some(Tier::Three), false, 0.008);
        metrics.record_fix(None, true, 0.0);

        let snap = metrics.snapshot();
        assert_eq!(snap.fixes.total, 3);
        assert_eq!(snap.fixes.successful, 2);
        assert_eq!(snap.fixes.by_tier["tier1"], 1);
        assert_eq!(snap.fixes.by_tier["tier2"], 0);
        assert!((snap.cost.total - 0.01).abs() < 1e-12);
        assert!((snap.success_rate - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_retries_and_redactions() {
        let metrics = MetricsCollector::new();
        metrics.record_retry(false);
        metrics.record_retry(true);
        metrics.record_redaction("email");
        metrics.record_redaction("email");

        let snap = metrics.snapshot();
        assert_eq!(snap.retries.total, 2);
        assert_eq!(snap.retries.escalations, 1);
        assert_eq!(snap.sanitization.by_type["email"], 2);

        metrics.reset();
        assert_eq!(metrics.snapshot().retries.total, 0);
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert!(json.get("successRate").is_some());
        assert!(json["sanitization"].get("totalRedactions").is_some());
    }
}
