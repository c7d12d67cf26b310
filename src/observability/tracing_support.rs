//! Tracing integration for structured logging and spans.

use crate::handoff::Pid;
use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create spans for control-device requests.
    pub request_spans: bool,
    /// Whether to create spans for reclaim passes.
    pub reclaim_spans: bool,
    /// Default span level.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            request_spans: true,
            reclaim_spans: true,
            level: Level::DEBUG,
        }
    }
}

impl TracingConfig {
    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            request_spans: false,
            reclaim_spans: false,
            level: Level::INFO,
        }
    }
}

/// Create a span for one control-device request, or a disabled span if
/// `config` turns request spans off.
///
/// # Example
///
/// ```rust
/// use ashfile::handoff::Pid;
/// use ashfile::observability::{TracingConfig, span_request};
///
/// let span = span_request(&TracingConfig::default(), Pid::from_raw(7), "pin");
/// let _guard = span.enter();
/// ```
pub fn span_request(config: &TracingConfig, pid: Pid, command: &'static str) -> Span {
    if !config.request_spans {
        return Span::none();
    }
    // Span levels are part of the static callsite, hence one arm per level.
    match config.level {
        Level::ERROR => span!(Level::ERROR, "request", pid = %pid, command),
        Level::WARN => span!(Level::WARN, "request", pid = %pid, command),
        Level::INFO => span!(Level::INFO, "request", pid = %pid, command),
        Level::DEBUG => span!(Level::DEBUG, "request", pid = %pid, command),
        _ => span!(Level::TRACE, "request", pid = %pid, command),
    }
}

/// Create a span for a reclaim pass.
pub fn span_reclaim(config: &TracingConfig, target_pages: usize) -> Span {
    if !config.reclaim_spans {
        return Span::none();
    }
    match config.level {
        Level::ERROR => span!(Level::ERROR, "reclaim", target_pages),
        Level::WARN => span!(Level::WARN, "reclaim", target_pages),
        Level::INFO => span!(Level::INFO, "reclaim", target_pages),
        Level::DEBUG => span!(Level::DEBUG, "reclaim", target_pages),
        _ => span!(Level::TRACE, "reclaim", target_pages),
    }
}

/// Log a rejected request.
#[inline]
pub fn trace_rejected(pid: Pid, command: &'static str, error: &crate::Error) {
    tracing::debug!(pid = %pid, command, errno = error.errno(), error = %error, "request rejected");
}
