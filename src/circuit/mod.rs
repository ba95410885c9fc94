//! Label-encoded distributed lock and hop-counted circuit breaker.
//!
//! - Labels: vocabulary, hop parsing and the [`CircuitPhase`] state machine
//! - Audit: HMAC-signed attempt comments
//! - Breaker: [`CircuitBreaker`] acquire/release and terminal bookkeeping

pub mod audit;
mod breaker;
mod labels;

pub use breaker::{CircuitBreaker, CircuitState, LockMetadata, LockRefusal, LockResult};
pub use labels::{
    ATTEMPTED_LABEL, CircuitPhase, FAILED_LABEL, HopState, SUCCESS_LABEL, TRIPPED_LABEL,
    current_hop, hop_label, label_catalog, lock_label,
};
