//! Metrics, alerts, run history and logging setup.
//!
//! - [`MetricsCollector`]: per-process fix/retry/cost counters
//! - [`AlertManager`]: cooldown-deduplicated alerts and SLO checks
//! - [`RunLog`]: JSONL record of batch runs

mod alerts;
mod metrics;
mod run_log;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub use alerts::{Alert, AlertManager, Severity};
pub use metrics::{
    CostSnapshot, FixSnapshot, MetricsCollector, MetricsSnapshot, RetrySnapshot,
    SanitizationSnapshot,
};
pub use run_log::{AggregateMetrics, RunLog, RunMetrics, TokenTotals};

/// Install the default subscriber for an embedding binary.
pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("autofix_governor=debug")
    } else {
        EnvFilter::new("autofix_governor=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
