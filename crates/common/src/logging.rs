//! Tracing setup for hosts and tests.
//!
//! Work is spread over named threads (`overlaykit-main`, `overlaykit-worker`,
//! encoder feeds), so thread names are always part of the output.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const CRATE_TARGETS: &[&str] = &[
    "overlaykit_common",
    "overlaykit_overlay_model",
    "overlaykit_platform",
    "overlaykit_render_engine",
];

/// Expand a configured level into filter directives.
///
/// A bare level such as `"debug"` applies to OverlayKit crates only and
/// keeps everything else at `warn`. Anything containing `=` or `,` is taken
/// as a full directive string.
fn filter_directives(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    let level = if level.is_empty() { "info" } else { level };
    std::iter::once("warn".to_string())
        .chain(CRATE_TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}
