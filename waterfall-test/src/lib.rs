//! Fixtures and a mock API client shared by the integration tests.

pub mod fixtures;
pub mod mock;

use std::sync::Once;
use tracing_subscriber::EnvFilter;
use waterfall_core::Config;

static TRACING: Once = Once::new();

/// Installs a `fmt` subscriber once per process. `RUST_LOG` wins over the
/// level from `WATERFALL_CONFIG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Config::load().logging.level));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
