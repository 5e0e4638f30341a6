//! Log output setup
//!
//! Everything logs through `tracing`; the binary installs a fmt
//! subscriber on stderr so stdout stays clean for JSON output.

use tracing_subscriber::EnvFilter;

/// Levels accepted in configuration
pub const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence; otherwise `verbose` selects debug and
/// `level` applies. A subscriber that is already installed is kept.
pub fn init(level: &str, verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level, verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn filter(level: &str, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level, verbose)))
}

fn default_directive(level: &str, verbose: bool) -> &str {
    if verbose { "debug" } else { level }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive("info", false), "info");
        assert_eq!(default_directive("warn", true), "debug");
    }

    #[test]
    fn test_scoped_subscriber() {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter("debug", true))
            .with_writer(std::io::sink)
            .with_target(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("still logging");
        });
    }
}
