//! Colored console rendering of job log entries at the root tier.

use chrono::{DateTime, Local, Utc};
use colored::Colorize;

use crate::domain::models::Severity;
use crate::domain::ports::ConsoleSink;

#[derive(Debug, Default)]
pub struct ColoredConsole;

impl ColoredConsole {
    pub fn new() -> Self {
        Self
    }
}

impl ConsoleSink for ColoredConsole {
    fn render(&self, timestamp: i64, severity: Severity, message: &str) {
        let clock = DateTime::<Utc>::from_timestamp(timestamp, 0)
            .map(|utc| {
                utc.with_timezone(&Local)
                    .format("%H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| "--:--:--".to_string());
        let tag = format!("[{:<8}]", severity.as_str());
        let tag = match severity {
            Severity::Debug => tag.cyan().bold(),
            Severity::Info => tag.bold(),
            Severity::Warning => tag.yellow().bold(),
            Severity::Error => tag.red().bold(),
            Severity::Critical => tag.white().on_red().bold(),
        };
        println!("[{clock}] {tag} {message}");
    }
}
