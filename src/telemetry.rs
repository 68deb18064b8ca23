//! Diagnostic logging initialization.
//!
//! Controlled by two environment variables:
//! - `FORKED_LOG`: an `EnvFilter` directive (default `warn`), e.g.
//!   `forked=debug,forked_git=trace`.
//! - `FORKED_LOG_FORMAT`: `json` for one JSON object per event, anything
//!   else (or unset) for a compact human format.
//!
//! Output always goes to stderr; stdout carries command results only.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "FORKED_LOG";

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "FORKED_LOG_FORMAT";

/// Install the global subscriber. Calling it twice is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    // Already installed (tests, embedding callers).
    drop(result);
}
