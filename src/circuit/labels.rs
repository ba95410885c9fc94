//! Label vocabulary and the per-issue hop state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tracker::LabelSpec;

pub const HOP_PREFIX: &str = "hop:";
pub const TRIPPED_LABEL: &str = "circuit-breaker";
pub const ATTEMPTED_LABEL: &str = "autofix:attempted";
pub const SUCCESS_LABEL: &str = "autofix:success";
pub const FAILED_LABEL: &str = "autofix:failed";

pub fn hop_label(hop: u32) -> String {
    format!("{HOP_PREFIX}{hop}")
}

pub fn lock_label(owner: &str) -> String {
    format!("processing:{owner}")
}

pub fn is_hop_label(label: &str) -> bool {
    label.starts_with(HOP_PREFIX)
}

/// Hop from the first well-formed `hop:<n>` label, 0 when there is none.
pub fn current_hop(labels: &[String]) -> u32 {
    labels
        .iter()
        .filter_map(|l| l.strip_prefix(HOP_PREFIX))
        .find_map(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Labels the breaker relies on, with colors for bootstrap.
pub fn label_catalog(max_hops: u32, owner: &str) -> Vec<LabelSpec> {
    let mut specs: Vec<LabelSpec> = (0..=max_hops)
        .map(|hop| {
            let color = match hop {
                0 => "0E8A16",
                1 => "FBCA04",
                2 => "FFA500",
                _ => "D93F0B",
            };
            let description = if hop == 0 {
                "No automated fix attempts yet".to_string()
            } else {
                format!("Automated fix attempt {hop} of {max_hops}")
            };
            LabelSpec::new(hop_label(hop), color, description)
        })
        .collect();

    specs.extend([
        LabelSpec::new(
            TRIPPED_LABEL,
            "B60205",
            "Automated fixing disabled after repeated attempts",
        ),
        LabelSpec::new(
            lock_label(owner),
            "FBCA04",
            "An automated fix attempt is in progress",
        ),
        LabelSpec::new(ATTEMPTED_LABEL, "5319E7", "An automated fix was attempted"),
        LabelSpec::new(SUCCESS_LABEL, "0E8A16", "Automated fix succeeded"),
        LabelSpec::new(FAILED_LABEL, "D93F0B", "Automated fix failed"),
    ]);
    specs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Idle,
    Processing,
    Tripped,
}

impl CircuitPhase {
    pub fn allowed_transitions(&self) -> &'static [CircuitPhase] {
        use CircuitPhase::*;
        match self {
            Idle => &[Processing],
            Processing => &[Idle, Tripped],
            // only a manual reset leaves the tripped state
            Tripped => &[Idle],
        }
    }

    pub fn can_transition_to(&self, target: CircuitPhase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn requires_manual_reset(&self) -> bool {
        matches!(self, CircuitPhase::Tripped)
    }
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Processing => "Processing",
            Self::Tripped => "Tripped",
        };
        write!(f, "{}", s)
    }
}

/// Breaker state decoded from an issue's labels.
///
/// The trip label takes precedence over the lock label: an attempt that
/// reaches the hop ceiling carries both until its lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopState {
    pub phase: CircuitPhase,
    pub hop: u32,
    pub locked: bool,
}

impl HopState {
    pub fn from_labels(labels: &[String], lock: &str) -> Self {
        let hop = current_hop(labels);
        let locked = labels.iter().any(|l| l == lock);
        let phase = if labels.iter().any(|l| l == TRIPPED_LABEL) {
            CircuitPhase::Tripped
        } else if locked {
            CircuitPhase::Processing
        } else {
            CircuitPhase::Idle
        };
        Self { phase, hop, locked }
    }

    /// Labels after a successful acquisition: hop and lock labels swapped,
    /// `autofix:attempted` added, and the trip label once `max_hops` is reached.
    pub fn acquire_labels(current: &[String], lock: &str, next_hop: u32, max_hops: u32) -> Vec<String> {
        let mut labels: Vec<String> = current
            .iter()
            .filter(|l| !is_hop_label(l) && l.as_str() != lock)
            .cloned()
            .collect();
        let mut push = |label: String| {
            if !labels.contains(&label) {
                labels.push(label);
            }
        };
        push(hop_label(next_hop));
        push(lock.to_string());
        push(ATTEMPTED_LABEL.to_string());
        if next_hop >= max_hops {
            push(TRIPPED_LABEL.to_string());
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_current_hop() {
        assert_eq!(current_hop(&labels(&["robot"])), 0);
        assert_eq!(current_hop(&labels(&["robot", "hop:2"])), 2);
        assert_eq!(current_hop(&labels(&["hop:x", "hop:1"])), 1);
    }

    #[test]
    fn test_transitions() {
        assert!(CircuitPhase::Idle.can_transition_to(CircuitPhase::Processing));
        assert!(CircuitPhase::Processing.can_transition_to(CircuitPhase::Tripped));
        assert!(CircuitPhase::Processing.can_transition_to(CircuitPhase::Idle));
        assert!(CircuitPhase::Tripped.can_transition_to(CircuitPhase::Idle));
        assert!(!CircuitPhase::Tripped.can_transition_to(CircuitPhase::Processing));
        assert!(!CircuitPhase::Idle.can_transition_to(CircuitPhase::Tripped));
        assert!(CircuitPhase::Tripped.requires_manual_reset());
    }

    #[test]
    fn test_hop_state_from_labels() {
        let lock = lock_label("autofix");
        let idle = HopState::from_labels(&labels(&["robot", "hop:1"]), &lock);
        assert_eq!(idle.phase, CircuitPhase::Idle);
        assert_eq!(idle.hop, 1);

        let busy = HopState::from_labels(&labels(&["hop:2", "processing:autofix"]), &lock);
        assert_eq!(busy.phase, CircuitPhase::Processing);
        assert!(busy.locked);

        let tripped = HopState::from_labels(
            &labels(&["hop:3", "processing:autofix", "circuit-breaker"]),
            &lock,
        );
        assert_eq!(tripped.phase, CircuitPhase::Tripped);
        assert!(tripped.locked);
    }

    #[test]
    fn test_acquire_labels() {
        let lock = lock_label("autofix");
        let next = HopState::acquire_labels(&labels(&["robot", "hop:1", "autofix:attempted"]), &lock, 2, 3);
        assert_eq!(next, labels(&["robot", "autofix:attempted", "hop:2", "processing:autofix"]));

        let last = HopState::acquire_labels(&labels(&["robot", "hop:2"]), &lock, 3, 3);
        assert!(last.contains(&TRIPPED_LABEL.to_string()));
        assert!(last.contains(&"hop:3".to_string()));
    }

    #[test]
    fn test_catalog() {
        let catalog = label_catalog(3, "autofix");
        let names: Vec<_> = catalog.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "hop:0",
                "hop:1",
                "hop:2",
                "hop:3",
                "circuit-breaker",
                "processing:autofix",
                "autofix:attempted",
                "autofix:success",
                "autofix:failed"
            ]
        );
        assert_eq!(catalog[4].color, "B60205");
    }
}
