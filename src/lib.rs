pub mod attempts;
pub mod budget;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod cost;
pub mod error;
pub mod fingerprint;
pub mod guardrails;
pub mod observability;
pub mod orchestrator;
pub mod patterns;
pub mod rate_limit;
pub mod retry;
pub mod routing;
pub mod storage;
pub mod tracker;

pub use attempts::{AttemptState, AttemptStore};
pub use budget::{BudgetStore, ReservationRequest, ReservationResult};
pub use circuit::{CircuitBreaker, LockMetadata, LockRefusal};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::GovernorConfig;
pub use error::{GovernorError, Result, TrackerError};
pub use fingerprint::{Fingerprint, RawError, fingerprint};
pub use guardrails::{GuardrailViolation, Guardrails};
pub use observability::{MetricsCollector, init_logging};
pub use orchestrator::{
    Disposition, IssueParser, Orchestrator, OrchestratorBuilder, ProcessOutcome, RunContext,
    Sanitizer,
};
pub use rate_limit::RateLimiter;
pub use retry::{AttemptContext, AttemptReport, RetryHandler, TierExecutor};
pub use routing::{Route, Router, Tier};
pub use storage::{JsonFileStore, MemoryStore, StateStore};
pub use tracker::{GhTracker, InMemoryTracker, IssueTracker};
