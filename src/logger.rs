use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Installs the global subscriber:
///
/// - a stderr layer filtered by `RUST_LOG`, or `log_level` when unset
/// - a plain-text daily rolling log in `log_dir/log_file`
/// - a JSON daily rolling log in `log_dir/event_file` that only receives
///   `target: "call"` events, one line per finished gateway call
pub fn init_tracing(log_dir: &Path, log_file: &str, event_file: &str, log_level: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let txt_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(log_file)
        .build(log_dir)?;
    let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false);

    let json_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(event_file)
        .build(log_dir)?;
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("call=info"));

    // stderr, so a broker hosted over stdio keeps stdout for frames
    let console_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()?;
    Ok(())
}

/// Gateway call counters. Backed by whatever meter provider the host installed
/// globally; the default provider discards everything.
#[derive(Clone)]
pub struct CallTelemetry {
    calls_started: Counter<u64>,
    calls_succeeded: Counter<u64>,
    calls_failed: Counter<u64>,
    call_latency_ms: Histogram<f64>,
}

impl Default for CallTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallTelemetry {
    pub fn new() -> Self {
        let meter = global::meter("railhost");
        Self {
            calls_started: meter
                .u64_counter("calls_started")
                .with_description("Gateway calls started")
                .build(),
            calls_succeeded: meter.u64_counter("calls_succeeded").build(),
            calls_failed: meter.u64_counter("calls_failed").build(),
            call_latency_ms: meter
                .f64_histogram("call_latency_ms")
                .with_description("Latency per gateway call in ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Runs `handler`, recording counters, latency and one JSON `call` event.
    pub async fn instrument_call<F, Fut, T, E>(&self, function: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attrs = [KeyValue::new("function", function.to_string())];
        self.calls_started.add(1, &attrs);
        let start = Instant::now();

        let result = handler().await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.call_latency_ms.record(elapsed, &attrs);

        match &result {
            Ok(_) => {
                self.calls_succeeded.add(1, &attrs);
                info!("call `{}` succeeded in {:.1} ms", function, elapsed);
            }
            Err(err) => {
                self.calls_failed.add(1, &attrs);
                error!(error = %err, "call `{}` failed in {:.1} ms", function, elapsed);
            }
        }

        tracing::event!(
            target: "call",
            tracing::Level::INFO,
            function = function,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );

        result
    }
}
