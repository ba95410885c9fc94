//! Dual sliding-window throttle: a per-minute burst window and a per-day
//! throughput window. Both must have room before an attempt proceeds.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::storage::StateStore;

pub const RATE_LIMIT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub max: usize,
    #[serde(default)]
    pub timestamps: Vec<DateTime<Utc>>,
}

impl RateLimitWindow {
    fn new(max: usize) -> Self {
        Self {
            max,
            timestamps: Vec::new(),
        }
    }

    /// Drop entries at or before `now - width`.
    fn prune(&mut self, now: DateTime<Utc>, width: Duration) {
        let cutoff = now - width;
        self.timestamps.retain(|ts| *ts > cutoff);
    }

    fn oldest(&self) -> Option<DateTime<Utc>> {
        self.timestamps.iter().min().copied()
    }

    fn is_full(&self) -> bool {
        self.timestamps.len() >= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindows {
    pub per_minute: RateLimitWindow,
    pub per_day: RateLimitWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub version: u32,
    pub windows: RateLimitWindows,
    pub last_pruned_at: DateTime<Utc>,
}

impl RateLimitState {
    pub fn new(config: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            version: RATE_LIMIT_VERSION,
            windows: RateLimitWindows {
                per_minute: RateLimitWindow::new(config.per_minute),
                per_day: RateLimitWindow::new(config.per_day),
            },
            last_pruned_at: now,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        self.windows.per_minute.prune(now, RateLimiter::minute_window());
        self.windows.per_day.prune(now, RateLimiter::day_window());
        self.last_pruned_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowCounts {
    pub per_minute: usize,
    pub per_day: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowResets {
    pub per_minute: DateTime<Utc>,
    pub per_day: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitCheck {
    pub allowed: bool,
    pub current: WindowCounts,
    pub limits: WindowCounts,
    pub resets_at: WindowResets,
    pub reason: Option<String>,
}

pub struct RateLimiter {
    store: Arc<dyn StateStore<RateLimitState>>,
    clock: SharedClock,
    config: RateLimitConfig,
    guard: Mutex<()>,
}

impl RateLimiter {
    pub fn minute_window() -> Duration {
        Duration::seconds(60)
    }

    pub fn day_window() -> Duration {
        Duration::hours(24)
    }

    pub fn new(
        store: Arc<dyn StateStore<RateLimitState>>,
        clock: SharedClock,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            guard: Mutex::new(()),
        }
    }

    async fn load_pruned(&self, now: DateTime<Utc>) -> Result<RateLimitState> {
        let mut state = self
            .store
            .load()
            .await?
            .unwrap_or_else(|| RateLimitState::new(&self.config, now));
        state.prune(now);
        Ok(state)
    }

    /// Pruned view of the persisted windows.
    pub async fn status(&self) -> Result<RateLimitState> {
        let _guard = self.guard.lock().await;
        self.load_pruned(self.clock.now()).await
    }

    /// Check both windows, per-minute first. Does not consume a slot.
    pub async fn can_proceed(&self) -> Result<RateLimitCheck> {
        let _guard = self.guard.lock().await;
        let now = self.clock.now();
        let state = self.load_pruned(now).await?;
        let minute = &state.windows.per_minute;
        let day = &state.windows.per_day;

        let current = WindowCounts {
            per_minute: minute.timestamps.len(),
            per_day: day.timestamps.len(),
        };
        let limits = WindowCounts {
            per_minute: minute.max,
            per_day: day.max,
        };
        let day_reset = day.oldest().unwrap_or(now) + Self::day_window();

        if minute.is_full() {
            let reason = format!(
                "Per-minute rate limit exceeded ({}/{} in last minute)",
                current.per_minute, limits.per_minute
            );
            warn!(%reason, "Rate limited");
            return Ok(RateLimitCheck {
                allowed: false,
                current,
                limits,
                resets_at: WindowResets {
                    per_minute: minute.oldest().unwrap_or(now) + Self::minute_window(),
                    per_day: day_reset,
                },
                reason: Some(reason),
            });
        }

        let resets_at = WindowResets {
            per_minute: now + Self::minute_window(),
            per_day: day_reset,
        };

        if day.is_full() {
            let reason = format!(
                "Per-day rate limit exceeded ({}/{} in last 24h)",
                current.per_day, limits.per_day
            );
            warn!(%reason, "Rate limited");
            return Ok(RateLimitCheck {
                allowed: false,
                current,
                limits,
                resets_at,
                reason: Some(reason),
            });
        }

        Ok(RateLimitCheck {
            allowed: true,
            current,
            limits,
            resets_at,
            reason: None,
        })
    }

    /// Append `now` to both windows and persist. Unconditional: callers check
    /// [`can_proceed`](Self::can_proceed) first.
    pub async fn record_attempt(&self) -> Result<()> {
        let _guard = self.guard.lock().await;
        let now = self.clock.now();
        let mut state = self.load_pruned(now).await?;
        state.windows.per_minute.timestamps.push(now);
        state.windows.per_day.timestamps.push(now);
        self.store.save(&state).await?;

        debug!(
            per_minute = state.windows.per_minute.timestamps.len(),
            per_day = state.windows.per_day.timestamps.len(),
            "Recorded rate limit attempt"
        );
        Ok(())
    }

    /// Operator reset: empty both windows. Limits come from the current
    /// configuration.
    pub async fn reset(&self) -> Result<RateLimitState> {
        let _guard = self.guard.lock().await;
        let state = RateLimitState::new(&self.config, self.clock.now());
        self.store.save(&state).await?;
        warn!("Rate limit windows reset by operator");
        Ok(state)
    }
}
