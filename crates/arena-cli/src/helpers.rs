//! Shared helpers for the `arena` binary.

use anyhow::Result;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies. Logs go to
/// stderr so stdout stays clean for JSON output.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Print `value` as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print `value` as one compact JSON line, for streaming output.
pub fn print_json_line<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
