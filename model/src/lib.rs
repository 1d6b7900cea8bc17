//! Data model, feeds and background worker for the SubMind signal monitor.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod db;
pub mod feeds;
pub mod state;
pub mod stats;
pub mod worker;

/// The version reported by the API and shown on the index page.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a global `tracing` subscriber.
///
/// The filter is taken from `RUST_LOG`, falling back to `info`. Calling this more than once is
/// harmless; only the first call installs a subscriber.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init();
}
