//! Per-process job log pipeline.
//!
//! Every captured line lands in the local store (which assigns the uid),
//! bumps the per-severity counters, is forwarded upward as a posted `log`,
//! and is rendered by the console sink when one is attached. Entries
//! crossing a tier boundary keep their original timestamp and severity but
//! get a fresh local uid.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::domain::models::{MetricMap, Severity};
use crate::domain::ports::ConsoleSink;
use crate::infrastructure::database::LogStore;
use crate::infrastructure::protocol::messages::action;
use crate::infrastructure::protocol::WsClient;

pub struct JobLogger {
    store: Arc<LogStore>,
    console: Option<Arc<dyn ConsoleSink>>,
    console_min: Severity,
    upward: OnceLock<Arc<WsClient>>,
    counts: [AtomicI64; 5],
}

impl JobLogger {
    pub fn new(
        store: Arc<LogStore>,
        console: Option<Arc<dyn ConsoleSink>>,
        console_min: Severity,
    ) -> Self {
        Self {
            store,
            console,
            console_min,
            upward: OnceLock::new(),
            counts: Default::default(),
        }
    }

    /// Attach the upward connection once it exists. Messages logged before
    /// this point stay local.
    pub fn attach_upward(&self, client: Arc<WsClient>) {
        let _ = self.upward.set(client);
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// Record a message originated by this process.
    pub async fn log(&self, severity: Severity, message: &str) {
        let timestamp = Utc::now().timestamp();
        self.bump(severity);
        self.persist(timestamp, severity, message).await;
        self.forward(timestamp, severity, message).await;
        self.render(timestamp, severity, message);
    }

    /// Record a message received from a child layer or from the supervised
    /// job itself. The original timestamp and severity are retained.
    /// `count` controls whether the message enters this process's severity
    /// tallies: a wrapper counts what its job posts, while a tier must not
    /// re-count entries its children already tallied.
    pub async fn ingest(&self, timestamp: i64, severity: Severity, message: &str, count: bool) {
        if count {
            self.bump(severity);
        }
        self.persist(timestamp, severity, message).await;
        self.forward(timestamp, severity, message).await;
        self.render(timestamp, severity, message);
    }

    pub async fn debug(&self, message: impl AsRef<str>) {
        self.log(Severity::Debug, message.as_ref()).await;
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.log(Severity::Info, message.as_ref()).await;
    }

    pub async fn warning(&self, message: impl AsRef<str>) {
        self.log(Severity::Warning, message.as_ref()).await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.log(Severity::Error, message.as_ref()).await;
    }

    pub async fn critical(&self, message: impl AsRef<str>) {
        self.log(Severity::Critical, message.as_ref()).await;
    }

    pub fn count(&self, severity: Severity) -> i64 {
        self.counts[Self::index(severity)].load(Ordering::Relaxed)
    }

    /// Messages at or above ERROR recorded by this process.
    pub fn error_count(&self) -> i64 {
        self.count(Severity::Error) + self.count(Severity::Critical)
    }

    /// The `msg_*` counter snapshot.
    pub fn counts_snapshot(&self) -> MetricMap {
        Severity::ALL
            .iter()
            .map(|severity| (severity.counter_name().to_string(), self.count(*severity)))
            .collect()
    }

    fn bump(&self, severity: Severity) {
        self.counts[Self::index(severity)].fetch_add(1, Ordering::Relaxed);
    }

    async fn persist(&self, timestamp: i64, severity: Severity, message: &str) {
        if let Err(err) = self.store.append_log(timestamp, severity, message).await {
            warn!(%err, "failed to persist log entry");
        }
    }

    async fn forward(&self, timestamp: i64, severity: Severity, message: &str) {
        if let Some(client) = self.upward.get() {
            let payload = json!({
                "timestamp": timestamp,
                "severity": severity.as_str(),
                "message": message,
            });
            if let Err(err) = client.post(action::LOG, payload).await {
                warn!(%err, "failed to forward log entry");
            }
        }
    }

    fn render(&self, timestamp: i64, severity: Severity, message: &str) {
        if severity < self.console_min {
            return;
        }
        if let Some(console) = &self.console {
            console.render(timestamp, severity, message);
        }
    }

    fn index(severity: Severity) -> usize {
        match severity {
            Severity::Debug => 0,
            Severity::Info => 1,
            Severity::Warning => 2,
            Severity::Error => 3,
            Severity::Critical => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn logger() -> JobLogger {
        let store = Arc::new(LogStore::open_in_memory().await.unwrap());
        JobLogger::new(store, None, Severity::Info)
    }

    #[tokio::test]
    async fn test_counts_by_severity() {
        let logger = logger().await;
        logger.info("one").await;
        logger.info("two").await;
        logger.error("bad").await;
        assert_eq!(logger.count(Severity::Info), 2);
        assert_eq!(logger.count(Severity::Error), 1);
        assert_eq!(logger.error_count(), 1);

        let snapshot = logger.counts_snapshot();
        assert_eq!(snapshot.get("msg_info"), Some(&2));
        assert_eq!(snapshot.get("msg_debug"), Some(&0));
    }

    #[tokio::test]
    async fn test_ingest_stores_without_counting() {
        let logger = logger().await;
        logger.ingest(42, Severity::Error, "from child", false).await;
        assert_eq!(logger.count(Severity::Error), 0);
        let entries = logger.store().messages_after(0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, 42);
        assert_eq!(entries[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_ingest_counting_for_wrapper_boundary() {
        let logger = logger().await;
        logger.ingest(1, Severity::Critical, "job says", true).await;
        assert_eq!(logger.error_count(), 1);
    }
}
