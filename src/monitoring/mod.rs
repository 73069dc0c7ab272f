/*!
 * Lock Monitoring
 * Tracing setup and timed lock-wait spans
 */

mod tracer;

pub use tracer::{generate_trace_id, init_tracing, span_lock_wait, LockSpan};
