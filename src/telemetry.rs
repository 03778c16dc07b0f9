//! Structured logging setup (spec AMBIENT STACK: logging).
//!
//! `tracing-subscriber` with an `EnvFilter` and the crate's own
//! target-first formatter (`log_format::TargetFirstFormat`), same
//! registration shape the teacher uses — this crate has no OpenTelemetry
//! exporter (dropped per DESIGN.md), so there is nothing else to wire up.

use crate::log_format::TargetFirstFormat;
use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Initialize global tracing with an `EnvFilter` sourced from `RUST_LOG`,
/// defaulting to `info` for this crate and `warn` for dependencies.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("terrane=info,warn"));

    let fmt_layer = fmt::layer().event_format(TargetFirstFormat).with_ansi(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_does_not_panic_when_called_once() {
        // `try_init` would be idempotent; `init_tracing` itself is only
        // meant to run once per process, so this just smoke-tests
        // construction rather than global installation.
        let filter = EnvFilter::new("terrane=info");
        assert!(filter.to_string().contains("terrane"));
    }
}
