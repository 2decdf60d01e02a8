//! Console sink port.
//!
//! The root tier renders job log entries to an injected sink rather than a
//! process-wide renderer, so tests and embedders can substitute their own.

use crate::domain::models::severity::Severity;

pub trait ConsoleSink: Send + Sync {
    /// Render one log entry. `timestamp` is unix seconds.
    fn render(&self, timestamp: i64, severity: Severity, message: &str);
}
