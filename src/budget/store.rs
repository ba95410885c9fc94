use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ledger::{BudgetLedger, PeriodKind};
use crate::clock::SharedClock;
use crate::config::BudgetConfig;
use crate::error::{GovernorError, Result};
use crate::routing::Tier;
use crate::storage::StateStore;

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRequest {
    pub amount: f64,
    pub purpose: String,
}

impl ReservationRequest {
    pub fn new(amount: f64, purpose: impl Into<String>) -> Self {
        Self {
            amount,
            purpose: purpose.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationResult {
    pub reservation_id: Option<String>,
    /// Daily remaining on success; remaining in the breached period otherwise.
    pub remaining: f64,
    pub breached_period: Option<PeriodKind>,
    pub reason: Option<String>,
}

impl ReservationResult {
    pub fn is_granted(&self) -> bool {
        self.reservation_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundRequest {
    pub reservation_id: String,
    pub actual_amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodRemaining {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheck {
    pub available: bool,
    pub remaining: PeriodRemaining,
    pub breached_period: Option<PeriodKind>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdAlert {
    pub level: f64,
    pub period: PeriodKind,
    pub usage_percent: f64,
    pub spent: f64,
    pub cap: f64,
}

#[derive(Debug, Clone)]
struct LiveReservation {
    amount: f64,
    purpose: String,
}

/// Reservation/refund ledger across daily, weekly and monthly periods.
///
/// Live reservations are held by this instance; the persisted ledger only
/// carries their aggregate in `reserved`.
pub struct BudgetStore {
    store: Arc<dyn StateStore<BudgetLedger>>,
    clock: SharedClock,
    config: BudgetConfig,
    reservations: Mutex<HashMap<String, LiveReservation>>,
}

impl BudgetStore {
    pub fn new(
        store: Arc<dyn StateStore<BudgetLedger>>,
        clock: SharedClock,
        config: BudgetConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Up-front reservation for a routing tier.
    pub fn reservation_for(&self, tier: Tier) -> f64 {
        let r = &self.config.reservation;
        match tier {
            Tier::One => r.tier1,
            Tier::Two => r.tier2,
            Tier::Three => r.tier3,
        }
    }

    async fn load_ledger(&self) -> Result<BudgetLedger> {
        let now = self.clock.now();
        let mut ledger = match self.store.load().await? {
            Some(ledger) => ledger,
            None => BudgetLedger::new(&self.config, now),
        };
        let reset = ledger.roll_over(now);
        if !reset.is_empty() {
            info!(periods = ?reset, "Budget periods reset");
        }
        Ok(ledger)
    }

    async fn save_ledger(&self, ledger: &mut BudgetLedger) -> Result<()> {
        ledger.last_updated = self.clock.now();
        self.store.save(ledger).await
    }

    /// Current ledger after applying any due period resets.
    pub async fn status(&self) -> Result<BudgetLedger> {
        let _live = self.reservations.lock().await;
        self.load_ledger().await
    }

    pub async fn live_reservations(&self) -> usize {
        self.reservations.lock().await.len()
    }

    pub async fn reserve(&self, req: ReservationRequest) -> Result<ReservationResult> {
        if !req.amount.is_finite() || req.amount < 0.0 {
            return Err(GovernorError::Budget(format!(
                "Invalid reservation amount: {}",
                req.amount
            )));
        }

        let mut live = self.reservations.lock().await;
        let mut ledger = self.load_ledger().await?;
        let total_live: f64 = live.values().map(|r| r.amount).sum();

        for (kind, period) in ledger.periods.iter() {
            if period.spent + total_live + req.amount > period.cap {
                let remaining = period.cap - period.spent - total_live;
                warn!(
                    period = %kind,
                    amount = req.amount,
                    remaining,
                    purpose = %req.purpose,
                    "Reservation refused"
                );
                return Ok(ReservationResult {
                    reservation_id: None,
                    remaining,
                    breached_period: Some(kind),
                    reason: Some(format!(
                        "Reservation would exceed {kind} budget cap (${})",
                        period.cap
                    )),
                });
            }
        }

        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("res_{}_{}", self.clock.now().timestamp_millis(), &suffix[..9]);
        ledger.periods.for_each_mut(|_, period| {
            period.reserved += req.amount;
            period.recompute();
        });
        self.save_ledger(&mut ledger).await?;

        live.insert(
            id.clone(),
            LiveReservation {
                amount: req.amount,
                purpose: req.purpose.clone(),
            },
        );

        debug!(reservation = %id, amount = req.amount, purpose = %req.purpose, "Budget reserved");
        Ok(ReservationResult {
            reservation_id: Some(id),
            remaining: ledger.periods.daily.remaining,
            breached_period: None,
            reason: None,
        })
    }

    /// Settle a reservation at its actual cost. The actual cost may not
    /// exceed the reserved amount; use [`record_overrun`](Self::record_overrun)
    /// for the excess.
    pub async fn refund(&self, req: RefundRequest) -> Result<()> {
        let mut live = self.reservations.lock().await;
        let reservation = live
            .get(&req.reservation_id)
            .cloned()
            .ok_or_else(|| GovernorError::ReservationNotFound(req.reservation_id.clone()))?;

        if !req.actual_amount.is_finite() || req.actual_amount < 0.0 {
            return Err(GovernorError::Budget(format!(
                "Invalid actual amount: {}",
                req.actual_amount
            )));
        }
        if req.actual_amount > reservation.amount {
            return Err(GovernorError::Budget(format!(
                "Actual amount (${}) exceeds reservation (${})",
                req.actual_amount, reservation.amount
            )));
        }

        let mut ledger = self.load_ledger().await?;
        ledger.periods.for_each_mut(|_, period| {
            // A period reset while the reservation was live already zeroed it.
            period.reserved = (period.reserved - reservation.amount).max(0.0);
            period.spent += req.actual_amount;
            period.recompute();
        });
        self.save_ledger(&mut ledger).await?;
        live.remove(&req.reservation_id);

        debug!(
            reservation = %req.reservation_id,
            purpose = %reservation.purpose,
            actual = req.actual_amount,
            refunded = reservation.amount - req.actual_amount,
            "Reservation settled"
        );
        Ok(())
    }

    /// Book spend that was not covered by a reservation. May push a period
    /// past its cap; later reservations will then be refused.
    pub async fn record_overrun(&self, amount: f64, purpose: &str) -> Result<()> {
        if !amount.is_finite() || amount <= 0.0 {
            return Ok(());
        }
        let _live = self.reservations.lock().await;
        let mut ledger = self.load_ledger().await?;
        ledger.periods.for_each_mut(|_, period| {
            period.spent += amount;
            period.recompute();
        });
        self.save_ledger(&mut ledger).await?;
        warn!(amount, purpose, "Recorded spend beyond reservation");
        Ok(())
    }

    /// Operator reset: zero `spent` in the listed periods. Boundaries are
    /// untouched and `reserved` is rebuilt from this instance's live
    /// reservations so pending refunds still balance.
    pub async fn reset(&self, periods: &[PeriodKind]) -> Result<BudgetLedger> {
        let live = self.reservations.lock().await;
        let mut ledger = self.load_ledger().await?;
        let total_live: f64 = live.values().map(|r| r.amount).sum();

        ledger.periods.for_each_mut(|kind, period| {
            if periods.contains(&kind) {
                period.spent = 0.0;
                period.reserved = total_live;
                period.recompute();
            }
        });
        self.save_ledger(&mut ledger).await?;

        warn!(periods = ?periods, live = live.len(), "Budget reset by operator");
        Ok(ledger)
    }

    /// Read-only availability check.
    pub async fn check_available(&self, amount: f64) -> Result<BudgetCheck> {
        let live = self.reservations.lock().await;
        let ledger = self.load_ledger().await?;
        let total_live: f64 = live.values().map(|r| r.amount).sum();

        let breached = ledger
            .periods
            .iter()
            .find(|(_, p)| p.spent + total_live + amount > p.cap);

        let Some((kind, period)) = breached else {
            return Ok(BudgetCheck {
                available: true,
                remaining: PeriodRemaining {
                    daily: ledger.periods.daily.remaining,
                    weekly: ledger.periods.weekly.remaining,
                    monthly: ledger.periods.monthly.remaining,
                },
                breached_period: None,
                reason: None,
            });
        };

        let left = |k: PeriodKind| {
            let p = ledger.periods.get(k);
            p.cap - p.spent - total_live
        };
        Ok(BudgetCheck {
            available: false,
            remaining: PeriodRemaining {
                daily: left(PeriodKind::Daily),
                weekly: left(PeriodKind::Weekly),
                monthly: left(PeriodKind::Monthly),
            },
            breached_period: Some(kind),
            reason: Some(format!("Would exceed {kind} budget cap (${})", period.cap)),
        })
    }

    /// One alert per crossed threshold per period. Not deduplicated.
    pub async fn check_thresholds(&self) -> Result<Vec<ThresholdAlert>> {
        let ledger = self.status().await?;
        let t = ledger.config.thresholds;
        let levels = [t.warning, t.critical, t.exceeded];

        let mut alerts = Vec::new();
        for (kind, period) in ledger.periods.iter() {
            let usage = period.usage_percent();
            for level in levels {
                if usage >= level {
                    alerts.push(ThresholdAlert {
                        level,
                        period: kind,
                        usage_percent: usage,
                        spent: period.spent,
                        cap: period.cap,
                    });
                }
            }
        }
        Ok(alerts)
    }
}
