//! Thin wrapper around `tracing` so call sites use `log::info!(...)` etc.
//! instead of reaching for the `tracing` crate directly.

pub use tracing::{debug, error, info, trace, warn};

use tracing_subscriber::{EnvFilter, fmt};

/// Distinguishes the handful of ways the binary and its tests initialize
/// logging. `Test` disables ANSI colour codes (most CI runners don't want
/// them) and tolerates being called more than once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Proxy,
    Test,
}

/// Installs a global `tracing` subscriber. `level` is a standard
/// `EnvFilter` directive (e.g. `"debug"`, `"info"`); `RUST_LOG` overrides it
/// when set.
pub fn setup_logging(level: &str, log_type: LogType) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_ansi(log_type != LogType::Test)
        .with_target(false);

    match log_type {
        LogType::Test => {
            // Tests across modules may call this repeatedly; a global
            // subscriber can only be installed once per process.
            let _ = subscriber.try_init();
        }
        LogType::Proxy => {
            subscriber.init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_logging_is_reentrant_in_test_mode() {
        setup_logging("debug", LogType::Test);
        setup_logging("debug", LogType::Test);
    }
}
