//! Subscriber setup
//!
//! Logs never go to stdout: in `--stdio` mode stdout is the transport.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Level implied by the command-line flags
pub fn level(debug: bool, quiet: bool, verbose: u8) -> &'static str {
    match (debug, quiet, verbose) {
        (true, _, _) => "debug",
        (false, true, _) => "error",
        (false, false, 0) => "warn",
        (false, false, 1) => "info",
        (false, false, 2) => "debug",
        (false, false, _) => "trace",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `level`. With `log_file`, events are appended there
/// instead of stderr.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| level.into()));
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            registry
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
        }
        None => {
            registry
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .try_init()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_wins() {
        assert_eq!(level(true, true, 0), "debug");
        assert_eq!(level(true, false, 3), "debug");
    }

    #[test]
    fn test_verbosity_ladder() {
        assert_eq!(level(false, false, 0), "warn");
        assert_eq!(level(false, false, 1), "info");
        assert_eq!(level(false, false, 2), "debug");
        assert_eq!(level(false, false, 5), "trace");
        assert_eq!(level(false, true, 2), "error");
    }
}
