//! Configuration types and loading.
//!
//! - `GovernorConfig`: top-level configuration with TOML loading, environment
//!   overrides and validation
//! - Per-component sections: attempts, patterns, rate limit, budget, circuit
//!   breaker, retry, routing, guardrails, alerts

mod settings;

pub use settings::{
    AlertConfig, AttemptConfig, BudgetCaps, BudgetConfig, BudgetThresholds, CONFIG_FILE,
    CircuitBreakerConfig, GovernorConfig, GuardrailConfig, MAX_ATTEMPTS_LIMIT,
    OrchestratorConfig, PathFilters, PatternConfig, RateLimitConfig, ResolvedPaths, RetryConfig,
    RoutingConfig, StatePaths, TierReservations,
};
