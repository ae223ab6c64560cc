//! Tracing subscriber setup for the binary and integration tests.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_DIRECTIVES: &str = "oidc_server=info,tower_http=info,hyper=warn";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Installs the global subscriber. `RUST_LOG` overrides [`DEFAULT_DIRECTIVES`].
pub fn init_tracing() {
    let layer = fmt::layer().with_target(true).with_level(true);
    tracing_subscriber::registry()
        .with(env_filter())
        .with(layer)
        .init();
}

/// Like [`init_tracing`] but writes through the test harness and tolerates repeated calls.
pub fn init_test_tracing() {
    let layer = fmt::layer().with_test_writer().with_target(true);
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(layer)
        .try_init();
}
