//! Child output capture.
//!
//! Drains stdout and stderr line by line, assigns the stream's default
//! severity (INFO for stdout, ERROR for stderr), and hands each line to the
//! job logger. Classification rules may re-tag lines by regex before
//! persistence. A partial final line with no trailing newline is still
//! emitted.

use std::sync::Arc;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::domain::models::Severity;
use crate::services::job_logger::JobLogger;

/// A line-classification rule: the first matching pattern re-tags the line.
#[derive(Debug, Clone)]
pub struct LineRule {
    pub pattern: Regex,
    pub severity: Severity,
}

pub struct OutputParser {
    logger: Arc<JobLogger>,
    rules: Vec<LineRule>,
}

impl OutputParser {
    pub fn new(logger: Arc<JobLogger>) -> Self {
        Self {
            logger,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(logger: Arc<JobLogger>, rules: Vec<LineRule>) -> Self {
        Self { logger, rules }
    }

    /// Spawn a drain task for one stream.
    pub fn spawn_drain(
        self: &Arc<Self>,
        stream: impl AsyncRead + Unpin + Send + 'static,
        default_severity: Severity,
    ) -> JoinHandle<()> {
        let parser = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let clean = line.trim_end();
                if clean.is_empty() {
                    continue;
                }
                let severity = parser.classify(clean, default_severity);
                parser.logger.log(severity, clean).await;
            }
        })
    }

    fn classify(&self, line: &str, default_severity: Severity) -> Severity {
        for rule in &self.rules {
            if rule.pattern.is_match(line) {
                return rule.severity;
            }
        }
        default_severity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::LogStore;

    async fn parser(rules: Vec<LineRule>) -> (Arc<OutputParser>, Arc<JobLogger>) {
        let store = Arc::new(LogStore::open_in_memory().await.unwrap());
        let logger = Arc::new(JobLogger::new(store, None, Severity::Info));
        (
            Arc::new(OutputParser::with_rules(Arc::clone(&logger), rules)),
            logger,
        )
    }

    #[tokio::test]
    async fn test_stdout_lines_default_to_info() {
        let (parser, logger) = parser(vec![]).await;
        let stream: &[u8] = b"first\nsecond\n";
        parser
            .spawn_drain(stream, Severity::Info)
            .await
            .unwrap();
        let entries = logger.store().messages_after(0, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.severity == Severity::Info));
    }

    #[tokio::test]
    async fn test_partial_final_line_is_emitted() {
        let (parser, logger) = parser(vec![]).await;
        let stream: &[u8] = b"complete\npartial without newline";
        parser
            .spawn_drain(stream, Severity::Error)
            .await
            .unwrap();
        let entries = logger.store().messages_after(0, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message, "partial without newline");
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let (parser, logger) = parser(vec![]).await;
        let stream: &[u8] = b"one\n\n   \ntwo\n";
        parser
            .spawn_drain(stream, Severity::Info)
            .await
            .unwrap();
        let entries = logger.store().messages_after(0, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_rule_retags_matching_lines() {
        let rules = vec![LineRule {
            pattern: Regex::new(r"(?i)^warning:").unwrap(),
            severity: Severity::Warning,
        }];
        let (parser, logger) = parser(rules).await;
        let stream: &[u8] = b"WARNING: deprecated flag\nplain line\n";
        parser
            .spawn_drain(stream, Severity::Info)
            .await
            .unwrap();
        let entries = logger.store().messages_after(0, 10).await.unwrap();
        assert_eq!(entries[0].severity, Severity::Warning);
        assert_eq!(entries[1].severity, Severity::Info);
    }
}
