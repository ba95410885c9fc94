//! Per-issue remediation pipeline.
//!
//! - [`Orchestrator`]: composes fingerprinting, cooldowns, the circuit
//!   breaker, rate limiting, budget reservations, pattern replay, tier
//!   execution, guardrails and pull request publication
//! - [`OrchestratorBuilder`]: wires the components from a [`GovernorConfig`](crate::config::GovernorConfig)
//! - [`IssueParser`] / [`Sanitizer`]: intake seams supplied by the embedder
//! - [`RunContext`]: counters for one batch, owned by the caller

mod builder;
mod intake;
mod outcome;
mod pipeline;

pub use builder::OrchestratorBuilder;
pub use intake::{IssueParser, ParseOutcome, ParsedIssue, Sanitized, Sanitizer};
pub use outcome::{Disposition, ProcessOutcome, RunContext};
pub use pipeline::Orchestrator;
