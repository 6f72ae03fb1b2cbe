//! Structured logging init (spec §6 "Logging"). Grounded on the
//! `tracing_subscriber` registry/fmt-layer pattern rather than a bespoke
//! in-memory collector, since this agent's logs are meant to leave the
//! process (stdout, journald, a log aggregator).

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global `tracing` subscriber. `default_level` seeds
/// `EnvFilter` when `RUST_LOG` isn't set; `json` switches the output
/// format for deployments that ship logs to a structured sink.
pub fn init(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().with_target(true).flatten_event(true).boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
