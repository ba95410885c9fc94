use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error};

use super::metrics::MetricsSnapshot;
use crate::budget::ThresholdAlert;
use crate::clock::SharedClock;
use crate::config::AlertConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metrics: Value,
}

impl Alert {
    fn key(&self) -> String {
        format!("{}:{}", self.severity, self.title)
    }
}

impl From<&ThresholdAlert> for Alert {
    fn from(t: &ThresholdAlert) -> Self {
        let severity = if t.level >= 100.0 {
            Severity::Critical
        } else if t.level >= 90.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        Self {
            severity,
            title: format!("{} budget at {}%", t.period, t.level),
            description: format!(
                "{} spend ${:.4} of ${:.4} ({:.1}%)",
                t.period, t.spent, t.cap, t.usage_percent
            ),
            metrics: json!({ "spent": t.spent, "cap": t.cap, "usagePercent": t.usage_percent }),
        }
    }
}

/// Deduplicating alert sink. The same severity and title is suppressed for
/// the configured cooldown after it was last sent.
pub struct AlertManager {
    clock: SharedClock,
    config: AlertConfig,
    history: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl AlertManager {
    pub fn new(clock: SharedClock, config: AlertConfig) -> Self {
        Self {
            clock,
            config,
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Returns whether the alert was emitted.
    pub fn send(&self, alert: &Alert) -> bool {
        let key = alert.key();
        let now = self.clock.now();
        {
            let mut history = self.history.write();
            if let Some(last) = history.get(&key)
                && now - *last < Duration::hours(self.config.cooldown_hours)
            {
                debug!(alert = %key, "Alert suppressed (cooldown)");
                return false;
            }
            history.insert(key, now);
        }

        error!(
            severity = %alert.severity,
            title = %alert.title,
            description = %alert.description,
            metrics = %alert.metrics,
            "ALERT"
        );
        true
    }

    /// Cost and success-rate objectives. No success-rate alert before the
    /// first recorded fix.
    pub fn check_slos(&self, metrics: &MetricsSnapshot, projected_annual_cost: f64) -> Vec<Alert> {
        let mut alerts = Vec::new();

        if projected_annual_cost > self.config.max_annual_cost {
            alerts.push(Alert {
                severity: Severity::Critical,
                title: "Cost SLO Breach".into(),
                description: format!(
                    "Projected annual cost (${projected_annual_cost:.2}) exceeds budget (${:.2})",
                    self.config.max_annual_cost
                ),
                metrics: json!({
                    "projectedAnnualCost": projected_annual_cost,
                    "currentCost": metrics.cost.total,
                }),
            });
        }

        if metrics.fixes.total > 0 && metrics.success_rate < self.config.min_success_rate {
            alerts.push(Alert {
                severity: Severity::High,
                title: "Success Rate SLO Breach".into(),
                description: format!(
                    "Overall success rate ({:.1}%) below target ({:.0}%)",
                    metrics.success_rate * 100.0,
                    self.config.min_success_rate * 100.0
                ),
                metrics: json!({
                    "successRate": metrics.success_rate,
                    "totalFixes": metrics.fixes.total,
                }),
            });
        }

        alerts
    }

    pub fn send_all(&self, alerts: &[Alert]) -> usize {
        alerts.iter().filter(|a| self.send(a)).count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::budget::PeriodKind;
    use crate::clock::ManualClock;
    use crate::observability::MetricsCollector;
    use crate::routing::Tier;

    fn manager() -> (AlertManager, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap());
        (
            AlertManager::new(Arc::new(clock.clone()), AlertConfig::default()),
            clock,
        )
    }

    fn alert() -> Alert {
        Alert {
            severity: Severity::High,
            title: "t".into(),
            description: "d".into(),
            metrics: Value::Null,
        }
    }

    #[test]
    fn test_cooldown_suppresses_repeats() {
        let (manager, clock) = manager();
        assert!(manager.send(&alert()));
        clock.advance(Duration::hours(23));
        assert!(!manager.send(&alert()));
        clock.advance(Duration::hours(2));
        assert!(manager.send(&alert()));
    }

    #[test]
    fn test_slo_checks() {
        let (manager, _clock) = manager();
        let metrics = MetricsCollector::new();
        assert!(manager.check_slos(&metrics.snapshot(), 1.0).is_empty());

        metrics.record_fix(Some(Tier::One), false, 0.001);
        let alerts = manager.check_slos(&metrics.snapshot(), 12.0);
        let titles: Vec<_> = alerts.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Cost SLO Breach", "Success Rate SLO Breach"]);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn test_threshold_alert_conversion() {
        let alert = Alert::from(&ThresholdAlert {
            level: 90.0,
            period: PeriodKind::Daily,
            usage_percent: 92.0,
            spent: 0.0607,
            cap: 0.066,
        });
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.title, "daily budget at 90%");
    }
}
