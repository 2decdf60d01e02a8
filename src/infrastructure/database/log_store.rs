//! Append-only per-job store: log entries, metrics, resource samples, and
//! attributes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::Row;

use crate::domain::errors::{GatorError, GatorResult};
use crate::domain::models::{LogEntry, MetricSample, ResourceSample, Severity};
use crate::infrastructure::database::connection::StoreConnection;

pub struct LogStore {
    conn: StoreConnection,
    path: PathBuf,
    write_timeout: Duration,
}

impl LogStore {
    /// Open and migrate the store at `path`.
    pub async fn open(path: &Path, write_timeout: Duration) -> GatorResult<Self> {
        let conn = StoreConnection::open(path).await?;
        conn.migrate().await?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            write_timeout,
        })
    }

    pub async fn open_in_memory() -> GatorResult<Self> {
        let conn = StoreConnection::open_in_memory().await?;
        conn.migrate().await?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
            write_timeout: Duration::from_secs(5),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a log entry and return its store-assigned uid.
    pub async fn append_log(
        &self,
        timestamp: i64,
        severity: Severity,
        message: &str,
    ) -> GatorResult<i64> {
        let result = self
            .write(
                sqlx::query("INSERT INTO logentry (timestamp, severity, message) VALUES (?, ?, ?)")
                    .bind(timestamp)
                    .bind(severity.value())
                    .bind(message)
                    .execute(self.conn.pool()),
            )
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Record or replace a named metric (last write wins).
    pub async fn upsert_metric(&self, name: &str, value: i64, timestamp: i64) -> GatorResult<()> {
        self.write(
            sqlx::query(
                "INSERT INTO metric (name, value, timestamp) VALUES (?, ?, ?)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value,
                                                 timestamp = excluded.timestamp",
            )
            .bind(name)
            .bind(value)
            .bind(timestamp)
            .execute(self.conn.pool()),
        )
        .await?;
        Ok(())
    }

    pub async fn append_resource(&self, sample: &ResourceSample) -> GatorResult<()> {
        self.write(
            sqlx::query("INSERT INTO resource (timestamp, cpu_percent, rss_bytes) VALUES (?, ?, ?)")
                .bind(sample.timestamp)
                .bind(sample.cpu_percent)
                .bind(sample.rss_bytes)
                .execute(self.conn.pool()),
        )
        .await?;
        Ok(())
    }

    /// Record a free-form attribute (`cmd`, `cwd`, `host`, ...).
    pub async fn push_attribute(&self, name: &str, value: &str) -> GatorResult<()> {
        self.write(
            sqlx::query("INSERT INTO attribute (name, value) VALUES (?, ?)")
                .bind(name)
                .bind(value)
                .execute(self.conn.pool()),
        )
        .await?;
        Ok(())
    }

    /// Page log entries with uid strictly greater than `after`.
    pub async fn messages_after(&self, after: i64, limit: i64) -> GatorResult<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT uid, timestamp, severity, message FROM logentry
             WHERE uid > ? ORDER BY uid LIMIT ?",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(self.conn.pool())
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let severity_value: i64 = row.get("severity");
            let severity = Severity::from_value(severity_value).ok_or_else(|| {
                GatorError::Store(format!("corrupt severity value {severity_value}"))
            })?;
            entries.push(LogEntry {
                uid: row.get("uid"),
                timestamp: row.get("timestamp"),
                severity,
                message: row.get("message"),
            });
        }
        Ok(entries)
    }

    pub async fn message_count(&self) -> GatorResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM logentry")
            .fetch_one(self.conn.pool())
            .await?;
        Ok(row.get("n"))
    }

    pub async fn metrics(&self) -> GatorResult<Vec<MetricSample>> {
        let rows = sqlx::query("SELECT name, value, timestamp FROM metric ORDER BY name")
            .fetch_all(self.conn.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| MetricSample {
                name: row.get("name"),
                value: row.get("value"),
                timestamp: row.get("timestamp"),
            })
            .collect())
    }

    pub async fn attribute(&self, name: &str) -> GatorResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM attribute WHERE name = ? ORDER BY rowid DESC")
            .bind(name)
            .fetch_optional(self.conn.pool())
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Flush and close the store file.
    pub async fn close(&self) {
        self.conn.close().await;
    }

    async fn write<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> GatorResult<T> {
        match tokio::time::timeout(self.write_timeout, fut).await {
            Ok(result) => result.map_err(GatorError::from),
            Err(_) => Err(GatorError::Store("store write timed out".into())),
        }
    }
}
