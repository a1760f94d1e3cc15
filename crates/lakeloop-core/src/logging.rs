//! Shared logging initialization for lakeloop binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level() -> tracing::Level {
    match std::env::var("LAKELOOP_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output.
///
/// The level comes from `LAKELOOP_LOG` unless `verbose` is set, which forces
/// DEBUG. Safe to call multiple times; only the first call initializes the
/// subscriber. Intentionally best-effort and never returns an error.
pub fn init(verbose: bool) {
    if INIT.get().is_some() {
        return;
    }
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        parse_level()
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
    let _ = INIT.set(());
}
