//! Structured logging setup
//!
//! Every Courier process logs through `tracing`. Output format is chosen at
//! startup:
//! - `LOG_FORMAT=json`: one JSON object per event, span fields flattened in
//! - anything else: compact human-readable text
//!
//! `RUST_LOG` filters as usual (default `info`), e.g.
//! `RUST_LOG=courier_dispatch=debug,courier_scheduler=trace`.
//!
//! Per-envelope work is wrapped in spans so the message id rides along on
//! every nested event:
//!
//! ```rust,ignore
//! use tracing::{info_span, Instrument};
//!
//! let span = info_span!("deliver", message_id = %envelope.id, channel = %envelope.channel);
//! consume(envelope).instrument(span).await;
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber for `service_name`.
///
/// Calling it twice is harmless; the second call leaves the first subscriber
/// in place.
pub fn init_logging(service_name: &str) {
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let installed = if json {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .flatten_event(true)
                    .with_span_events(FmtSpan::NONE),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_target(true).with_ansi(true))
            .try_init()
    };

    if installed.is_ok() {
        tracing::info!(service = %service_name, json, "Logging initialized");
    }
}

/// Subscriber for tests: writes through the test harness capture.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_test_writer())
        .try_init();
}
