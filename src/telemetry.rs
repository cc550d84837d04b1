//! Tracing initialization (fmt subscriber + env filter).
//!
//! Log verbosity is controlled by `RUST_LOG`, falling back to the
//! `log_level` configuration field, falling back to `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the tracing subscriber.
///
/// `default_directive` comes from configuration and is only used when
/// `RUST_LOG` is not set. Safe to call once per process; repeated calls in
/// tests fail quietly through `try_init`.
pub fn init_telemetry(default_directive: &str) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
