//! Logging setup.
//!
//! Structured logging via `tracing` with noisy library modules filtered to
//! `warn` so gateway/WS internals do not drown out bot activity.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Library modules filtered to `warn` level by default.
const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "tokio_util",
    "tungstenite",
    "tokio_tungstenite",
];

/// Build the default filter with noise suppression.
///
/// `RUST_LOG` takes precedence when set.
fn build_filter(log_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{module}=warn"));
    }

    EnvFilter::new(&directives)
}

/// Initialize logging.
///
/// * `log_level` - base level (trace, debug, info, warn, error)
/// * `log_format` - "json" for structured JSON, anything else for pretty
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = build_filter(log_level);
    let subscriber = tracing_subscriber::registry().with(filter);

    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true);
        let _ = subscriber.with(fmt_layer).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_includes_noise_suppression() {
        let filter = build_filter("debug");
        let rendered = filter.to_string();
        assert!(rendered.contains("debug"));
        assert!(rendered.contains("tungstenite=warn"));
    }
}
