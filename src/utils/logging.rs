use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::core::config::Config;

/// Install the global fmt subscriber filtered to this crate at `level`.
///
/// Safe to call more than once; later calls are ignored so tests and embedding
/// services can both initialize logging.
pub fn init_tracing(level: Level) {
    let filter = EnvFilter::new(format!("ocr_workflow={}", level_name(level)));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// [`init_tracing`] at the configured `LOG_LEVEL`.
pub fn init_from_config(config: &Config) {
    init_tracing(config.log_level);
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}
