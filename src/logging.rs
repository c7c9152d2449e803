// src/logging.rs
//
// Tracing subscriber setup. The level argument is the fallback when
// RUST_LOG is unset; repeated initialization is ignored so tests and
// embedding applications can both call this freely.
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}
