//! Tracing initialisation for the devbox binaries.
//!
//! Devbox crates log at the requested level; the cluster, HTTP and S3
//! stacks underneath stay at `warn` unless `RUST_LOG` says otherwise.
//! JSON output carries the enclosing `devbox.session` span on every line.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Target prefix shared by `devbox`, `devbox_core` and `devbox_interceptor`.
const DEVBOX_TARGET: &str = "devbox";

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_directives(level: Level) -> String {
    format!("warn,{DEVBOX_TARGET}={}", level.as_str().to_ascii_lowercase())
}

/// Install the global subscriber. Only the first call in a process wins.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).compact())
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_stay_quiet_by_default() {
        assert_eq!(default_directives(Level::DEBUG), "warn,devbox=debug");
    }

    #[test]
    fn default_directives_parse() {
        for level in [Level::INFO, Level::DEBUG, Level::TRACE] {
            assert!(EnvFilter::try_new(default_directives(level)).is_ok());
        }
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}
