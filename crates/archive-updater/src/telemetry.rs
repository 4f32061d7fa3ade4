use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{UpdaterConfig, DEFAULT_LOG_FILTER};

/// Installs the global subscriber filtered by `config.log_filter`, falling back to
/// `info` when the directives do not parse.
pub fn init_tracing(config: &UpdaterConfig) {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    Registry::default()
        .with(env_filter(config))
        .with(fmt_layer)
        .init();
}

/// Like [`init_tracing`] but tolerates an already installed subscriber, for tests
/// and embedders that may initialise more than once.
pub fn try_init_tracing(config: &UpdaterConfig) -> bool {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_test_writer();
    Registry::default()
        .with(env_filter(config))
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

fn env_filter(config: &UpdaterConfig) -> EnvFilter {
    EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}
