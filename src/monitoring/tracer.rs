/*!
 * Lock Tracing
 * Structured tracing for lock waits using the tracing crate
 *
 * Features:
 * - Trace ID per wait for correlating the start and end events
 * - JSON-formatted logs for structured parsing
 * - Slow-wait warnings with the lock file and operation attached
 */

use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - KVLOCK_TRACE_JSON: Enable JSON output (default: false)
///
/// A second call keeps the subscriber installed by the first.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("KVLOCK_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init()
    };

    if installed.is_ok() {
        info!(json = use_json, "lock tracing initialized");
    }
}

/// Generate a unique trace ID for correlating one wait
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Timed span around a blocking lock wait
pub struct LockSpan {
    span: tracing::Span,
    start: Instant,
    op: &'static str,
    threshold: Duration,
    trace_id: String,
}

impl LockSpan {
    pub fn new(op: &'static str, path: &Path, threshold: Duration) -> Self {
        let trace_id = generate_trace_id();
        let span = span!(
            Level::DEBUG,
            "lock_wait",
            trace_id = %trace_id,
            op = op,
            path = %path.display(),
            duration_us = tracing::field::Empty,
            result = tracing::field::Empty,
        );

        let entered = span.enter();
        debug!(op, path = %path.display(), "waiting for lock");
        drop(entered);

        Self {
            span,
            start: Instant::now(),
            op,
            threshold,
            trace_id,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn record_result(&self, acquired: bool) {
        self.span
            .record("result", if acquired { "acquired" } else { "failed" });
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LockSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("duration_us", duration.as_micros() as u64);

        if duration > self.threshold {
            warn!(
                trace_id = %self.trace_id,
                op = self.op,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow lock wait"
            );
        } else {
            debug!(
                trace_id = %self.trace_id,
                op = self.op,
                duration_us = duration.as_micros() as u64,
                "lock wait completed"
            );
        }
    }
}

/// Helper to create a lock-wait span
#[inline]
pub fn span_lock_wait(op: &'static str, path: &Path, threshold: Duration) -> LockSpan {
    LockSpan::new(op, path, threshold)
}
