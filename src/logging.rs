//! Tracing setup shared by the audit binaries.

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` wins over `default_directives`.
pub fn init_tracing(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    // A second init (tests, repeated calls) is not an error worth surfacing.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Log the outcome of one reconciliation stage.
pub fn log_check(item_id: u32, stage: &str, passed: bool, detail: &str) {
    if passed {
        info!(item_id, stage, "✅ {} - {}", stage, detail);
    } else {
        warn!(item_id, stage, "❌ {} - {}", stage, detail);
    }
}
