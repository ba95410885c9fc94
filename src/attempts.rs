//! Per-fingerprint attempt accounting with exponential cooldown.
//!
//! Each failed attempt pushes the next allowed attempt out by
//! `base × 2^(attempts-1)` hours (capped). After `max_attempts` failures the
//! fingerprint is exhausted until a success resets it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::AttemptConfig;
use crate::error::Result;
use crate::storage::StateStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptState {
    pub fingerprint: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exhausted: bool,
    #[serde(default)]
    pub history: Vec<AttemptHistoryEntry>,
}

impl AttemptState {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            attempts: 0,
            cooldown_until: None,
            last_attempt: None,
            exhausted: false,
            history: Vec::new(),
        }
    }
}

pub type AttemptDocument = Vec<AttemptState>;

pub struct AttemptStore {
    store: Arc<dyn StateStore<AttemptDocument>>,
    clock: SharedClock,
    config: AttemptConfig,
    guard: Mutex<()>,
}

impl AttemptStore {
    pub fn new(
        store: Arc<dyn StateStore<AttemptDocument>>,
        clock: SharedClock,
        config: AttemptConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            guard: Mutex::new(()),
        }
    }

    /// Longest cooldown ever applied, whatever the configuration.
    pub fn max_cooldown() -> Duration {
        Duration::days(3650)
    }

    /// Cooldown after the given number of consecutive failures. Saturates at
    /// [`max_cooldown`](Self::max_cooldown).
    pub fn cooldown_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(self.config.max_attempts.saturating_sub(1));
        2_i64
            .checked_pow(exponent)
            .and_then(|factor| self.config.base_cooldown_hours.checked_mul(factor))
            .and_then(Duration::try_hours)
            .map_or_else(Self::max_cooldown, |cooldown| cooldown.min(Self::max_cooldown()))
    }

    pub async fn get_state(&self, fingerprint: &str) -> Result<AttemptState> {
        let doc = self.store.load().await?.unwrap_or_default();
        Ok(doc
            .into_iter()
            .find(|s| s.fingerprint == fingerprint)
            .unwrap_or_else(|| AttemptState::new(fingerprint)))
    }

    /// Whether a new attempt is allowed now. Marks the state exhausted (and
    /// persists that) the first time the attempt ceiling is observed.
    pub async fn can_attempt(&self, fingerprint: &str) -> Result<bool> {
        let _guard = self.guard.lock().await;
        let mut doc = self.store.load().await?.unwrap_or_default();

        let Some(state) = doc.iter_mut().find(|s| s.fingerprint == fingerprint) else {
            return Ok(true);
        };

        if state.exhausted {
            debug!(fingerprint, "Fingerprint exhausted");
            return Ok(false);
        }

        if state.attempts >= self.config.max_attempts {
            state.exhausted = true;
            self.store.save(&doc).await?;
            info!(fingerprint, "Fingerprint reached attempt ceiling, marking exhausted");
            return Ok(false);
        }

        Ok(match state.cooldown_until {
            Some(until) => until <= self.clock.now(),
            None => true,
        })
    }

    pub async fn record_attempt(&self, fingerprint: &str, success: bool) -> Result<AttemptState> {
        let _guard = self.guard.lock().await;
        let mut doc = self.store.load().await?.unwrap_or_default();
        let now = self.clock.now();

        let idx = match doc.iter().position(|s| s.fingerprint == fingerprint) {
            Some(idx) => idx,
            None => {
                doc.push(AttemptState::new(fingerprint));
                doc.len() - 1
            }
        };

        let cooldown = self.cooldown_for(doc[idx].attempts.saturating_add(1));
        let state = &mut doc[idx];
        state.last_attempt = Some(now);
        state.history.push(AttemptHistoryEntry {
            timestamp: now,
            success,
        });

        if success {
            state.attempts = 0;
            state.cooldown_until = None;
            state.exhausted = false;
        } else {
            state.attempts = state.attempts.saturating_add(1);
            let until = now.checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.cooldown_until = Some(until);
            state.exhausted = state.attempts >= self.config.max_attempts;
        }

        let updated = state.clone();
        self.store.save(&doc).await?;

        debug!(
            fingerprint,
            success,
            attempts = updated.attempts,
            exhausted = updated.exhausted,
            "Recorded attempt"
        );
        Ok(updated)
    }
}
