//! Building blocks of the yamc agent: logging setup and configuration loading.

use env_logger::Env;

pub mod config;

/// Initializes the global logger.
///
/// The log level is read from the `RUST_LOG` environment variable, and defaults to `info`.
/// Call this first!
pub fn init_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
}
