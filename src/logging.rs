//! Diagnostic tracing for the orchestrator.
//!
//! Diagnostics go to stderr through `tracing`. Run artifacts (metadata,
//! events, summaries) are product output written by the artifact store and
//! do not depend on the filter configured here.
//!
//! Filter priority:
//! 1. `ORCHESTRATE_LOG` (e.g. `orchestrate=debug`)
//! 2. `RUST_LOG`
//! 3. `debug` with `--verbose`, otherwise `warn`

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "ORCHESTRATE_LOG";

/// Install the global subscriber. Later calls are ignored.
pub fn init(verbose: bool) {
    let filter = filter_from(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        verbose,
    );

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

fn filter_from(primary: Option<String>, fallback: Option<String>, verbose: bool) -> EnvFilter {
    primary
        .into_iter()
        .chain(fallback)
        .filter(|s| !s.trim().is_empty())
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(if verbose { "debug" } else { "warn" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_wins_over_rust_log() {
        let filter = filter_from(Some("info".into()), Some("trace".into()), false);
        assert_eq!(filter.to_string(), "info");
    }

    #[test]
    fn falls_back_to_rust_log_then_default() {
        let filter = filter_from(None, Some("error".into()), false);
        assert_eq!(filter.to_string(), "error");

        assert_eq!(filter_from(None, None, false).to_string(), "warn");
        assert_eq!(filter_from(None, None, true).to_string(), "debug");
    }

    #[test]
    fn blank_values_are_ignored() {
        assert_eq!(filter_from(Some("  ".into()), None, false).to_string(), "warn");
    }
}
