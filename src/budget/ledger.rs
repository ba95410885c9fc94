use std::fmt;

use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{BudgetCaps, BudgetConfig, BudgetThresholds, TierReservations};

pub const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Daily,
    Weekly,
    Monthly,
}

impl PeriodKind {
    pub const ALL: [PeriodKind; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    /// First reset boundary strictly after `now`.
    pub fn first_reset_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN));
        match self {
            Self::Daily => midnight + Duration::days(1),
            Self::Weekly => {
                let days = 7 - i64::from(now.weekday().num_days_from_monday());
                midnight + Duration::days(days)
            }
            Self::Monthly => {
                let first = midnight - Duration::days(i64::from(now.day0()));
                first
                    .checked_add_months(Months::new(1))
                    .unwrap_or(first + Duration::days(31))
            }
        }
    }

    /// Advance a boundary by one period width.
    pub fn advance(&self, reset_at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Daily => reset_at + Duration::days(1),
            Self::Weekly => reset_at + Duration::days(7),
            Self::Monthly => reset_at
                .checked_add_months(Months::new(1))
                .unwrap_or(reset_at + Duration::days(31)),
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetPeriod {
    pub spent: f64,
    pub cap: f64,
    pub remaining: f64,
    pub reserved: f64,
    pub reset_at: DateTime<Utc>,
}

impl BudgetPeriod {
    pub fn new(cap: f64, reset_at: DateTime<Utc>) -> Self {
        Self {
            spent: 0.0,
            cap,
            remaining: cap,
            reserved: 0.0,
            reset_at,
        }
    }

    /// Keeps `remaining = cap - spent - reserved`.
    pub fn recompute(&mut self) {
        self.remaining = self.cap - self.spent - self.reserved;
    }

    pub fn usage_percent(&self) -> f64 {
        if self.cap <= 0.0 {
            return if self.spent > 0.0 { f64::INFINITY } else { 0.0 };
        }
        self.spent / self.cap * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetPeriods {
    pub daily: BudgetPeriod,
    pub weekly: BudgetPeriod,
    pub monthly: BudgetPeriod,
}

impl BudgetPeriods {
    pub fn get(&self, kind: PeriodKind) -> &BudgetPeriod {
        match kind {
            PeriodKind::Daily => &self.daily,
            PeriodKind::Weekly => &self.weekly,
            PeriodKind::Monthly => &self.monthly,
        }
    }

    pub fn get_mut(&mut self, kind: PeriodKind) -> &mut BudgetPeriod {
        match kind {
            PeriodKind::Daily => &mut self.daily,
            PeriodKind::Weekly => &mut self.weekly,
            PeriodKind::Monthly => &mut self.monthly,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeriodKind, &BudgetPeriod)> {
        PeriodKind::ALL.into_iter().map(|k| (k, self.get(k)))
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(PeriodKind, &mut BudgetPeriod)) {
        for kind in PeriodKind::ALL {
            f(kind, self.get_mut(kind));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    pub version: u32,
    pub currency: String,
    pub caps: BudgetCaps,
    pub thresholds: BudgetThresholds,
    pub reservation: TierReservations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLedger {
    pub version: u32,
    pub currency: String,
    pub config: LedgerConfig,
    pub periods: BudgetPeriods,
    pub last_updated: DateTime<Utc>,
}

impl BudgetLedger {
    pub fn new(config: &BudgetConfig, now: DateTime<Utc>) -> Self {
        let caps = config.caps;
        Self {
            version: LEDGER_VERSION,
            currency: config.currency.clone(),
            config: LedgerConfig {
                version: LEDGER_VERSION,
                currency: config.currency.clone(),
                caps,
                thresholds: config.thresholds,
                reservation: config.reservation,
            },
            periods: BudgetPeriods {
                daily: BudgetPeriod::new(caps.daily, PeriodKind::Daily.first_reset_after(now)),
                weekly: BudgetPeriod::new(caps.weekly, PeriodKind::Weekly.first_reset_after(now)),
                monthly: BudgetPeriod::new(
                    caps.monthly,
                    PeriodKind::Monthly.first_reset_after(now),
                ),
            },
            last_updated: now,
        }
    }

    /// Zero every period whose boundary has passed and move the boundary
    /// forward. Boundaries stay aligned: a ledger idle for several periods
    /// lands on the first boundary after `now`. Returns the periods reset.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> Vec<PeriodKind> {
        let mut reset = Vec::new();
        self.periods.for_each_mut(|kind, period| {
            if now < period.reset_at {
                return;
            }
            period.spent = 0.0;
            period.reserved = 0.0;
            period.remaining = period.cap;
            while period.reset_at <= now {
                period.reset_at = kind.advance(period.reset_at);
            }
            reset.push(kind);
        });
        reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_first_reset_boundaries() {
        // 2025-01-15 is a Wednesday
        let now = at(2025, 1, 15, 13);
        assert_eq!(PeriodKind::Daily.first_reset_after(now), at(2025, 1, 16, 0));
        assert_eq!(PeriodKind::Weekly.first_reset_after(now), at(2025, 1, 20, 0));
        assert_eq!(PeriodKind::Monthly.first_reset_after(now), at(2025, 2, 1, 0));
    }

    #[test]
    fn test_weekly_boundary_from_monday_is_next_monday() {
        let monday = at(2025, 1, 20, 0);
        assert_eq!(PeriodKind::Weekly.first_reset_after(monday), at(2025, 1, 27, 0));
    }

    #[test]
    fn test_monthly_boundary_rolls_year() {
        let now = at(2025, 12, 31, 23);
        assert_eq!(PeriodKind::Monthly.first_reset_after(now), at(2026, 1, 1, 0));
    }

    #[test]
    fn test_roll_over_resets_only_crossed_periods() {
        let start = at(2025, 1, 15, 13);
        let mut ledger = BudgetLedger::new(&BudgetConfig::default(), start);
        ledger.periods.for_each_mut(|_, p| {
            p.spent = 0.01;
            p.recompute();
        });

        let reset = ledger.roll_over(at(2025, 1, 16, 0));
        assert_eq!(reset, vec![PeriodKind::Daily]);
        assert_eq!(ledger.periods.daily.spent, 0.0);
        assert_eq!(ledger.periods.daily.reset_at, at(2025, 1, 17, 0));
        assert_eq!(ledger.periods.weekly.spent, 0.01);
    }

    #[test]
    fn test_roll_over_after_long_idle_stays_aligned() {
        let start = at(2025, 1, 15, 13);
        let mut ledger = BudgetLedger::new(&BudgetConfig::default(), start);
        ledger.roll_over(at(2025, 1, 19, 6));
        assert_eq!(ledger.periods.daily.reset_at, at(2025, 1, 20, 0));
    }
}
