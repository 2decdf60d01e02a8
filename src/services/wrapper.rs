//! Wrapper: supervises exactly one leaf job.
//!
//! Lifecycle: INIT (store + server) -> CONNECT (register upward) -> EXEC
//! (fetch spec, spawn the process) -> MONITOR (drain output, sample
//! resources, tick updates) -> REPORT (graceful-then-forced shutdown) ->
//! EXIT (send `complete`, mirror the child's exit code).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use sysinfo::System;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::domain::errors::{GatorError, GatorResult};
use crate::domain::models::log::is_reserved_metric;
use crate::domain::models::{
    ChildResult, Job, JobSpec, MetricMap, ResourceSet, Severity,
};
use crate::domain::ports::ActionHandler;
use crate::infrastructure::config::Config;
use crate::infrastructure::database::LogStore;
use crate::infrastructure::protocol::messages::{
    action, ApiMessage, CompletePayload, GetMessagesPayload, GetMessagesReply, LogPayload,
    MetricPayload, SpecReply,
};
use crate::infrastructure::protocol::{WsClient, WsServer};
use crate::infrastructure::specfile;
use crate::services::job_logger::JobLogger;
use crate::services::output_parser::OutputParser;
use crate::services::resource_sampler::ResourceSampler;

/// State shared between the wrapper runtime and its protocol handler.
struct WrapperShared {
    logger: Arc<JobLogger>,
    user_metrics: Mutex<MetricMap>,
    stop_tx: watch::Sender<bool>,
    finished: AtomicBool,
}

struct WrapperHandler {
    shared: Arc<WrapperShared>,
}

#[async_trait]
impl ActionHandler for WrapperHandler {
    async fn handle(&self, name: &str, payload: Value) -> GatorResult<Value> {
        match name {
            action::LOG => {
                let entry: LogPayload = serde_json::from_value(payload)?;
                // The supervised job posts its own entries here; they count
                // toward this job's tallies.
                self.shared
                    .logger
                    .ingest(entry.timestamp, entry.severity, &entry.message, true)
                    .await;
                Ok(json!({}))
            }
            action::METRIC => {
                let metric: MetricPayload = serde_json::from_value(payload)?;
                if is_reserved_metric(&metric.name) {
                    return Err(GatorError::Protocol(format!(
                        "reserved metric name '{}'",
                        metric.name
                    )));
                }
                self.shared
                    .user_metrics
                    .lock()
                    .await
                    .insert(metric.name.clone(), metric.value);
                self.shared
                    .logger
                    .store()
                    .upsert_metric(&metric.name, metric.value, Utc::now().timestamp())
                    .await?;
                Ok(json!({}))
            }
            action::STOP => {
                let _ = self.shared.stop_tx.send(true);
                Ok(json!({}))
            }
            action::GET_MESSAGES => {
                let page: GetMessagesPayload = serde_json::from_value(payload)?;
                let entries = self
                    .shared
                    .logger
                    .store()
                    .messages_after(page.after, page.limit)
                    .await?;
                let total = self.shared.logger.store().message_count().await?;
                let reply = GetMessagesReply {
                    messages: entries
                        .into_iter()
                        .map(|entry| ApiMessage {
                            uid: entry.uid,
                            severity: entry.severity.value(),
                            message: entry.message,
                            timestamp: entry.timestamp,
                        })
                        .collect(),
                    total,
                    live: !self.shared.finished.load(Ordering::Relaxed),
                };
                Ok(serde_json::to_value(reply)?)
            }
            other => Err(GatorError::Protocol(format!("unknown action '{other}'"))),
        }
    }
}

pub struct Wrapper {
    ident: String,
    parent: String,
    tracking: PathBuf,
    config: Config,
}

impl Wrapper {
    pub fn new(ident: String, parent: String, tracking: PathBuf, config: Config) -> Self {
        Self {
            ident,
            parent,
            tracking,
            config,
        }
    }

    /// Run the wrapper to completion and return the process exit code.
    pub async fn run(self) -> GatorResult<i32> {
        // INIT: fresh local store and an ephemeral server.
        let store = Arc::new(
            LogStore::open(
                &self.tracking.join("db.sqlite"),
                self.config.timeouts.store_write(),
            )
            .await?,
        );
        let logger = Arc::new(JobLogger::new(Arc::clone(&store), None, Severity::Critical));

        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(WrapperShared {
            logger: Arc::clone(&logger),
            user_metrics: Mutex::new(MetricMap::new()),
            stop_tx,
            finished: AtomicBool::new(false),
        });
        let handler: Arc<dyn ActionHandler> = Arc::new(WrapperHandler {
            shared: Arc::clone(&shared),
        });

        let server = WsServer::bind(Arc::clone(&handler)).await?;

        // CONNECT: register with the parent, retrying with bounded backoff.
        let client = Arc::new(
            WsClient::connect_with_backoff(
                &self.parent,
                Some(Arc::clone(&handler)),
                self.config.timeouts.connect_attempts,
                self.config.timeouts.connect_initial(),
                self.config.timeouts.connect_cap(),
            )
            .await?,
        );
        logger.attach_upward(Arc::clone(&client));
        client
            .call(
                action::REGISTER,
                json!({"ident": self.ident, "server": server.address()}),
                self.config.timeouts.rpc(),
            )
            .await?;

        // EXEC: fetch and interpret the job spec.
        let spec_reply = client
            .call(
                action::SPEC,
                json!({"ident": self.ident}),
                self.config.timeouts.rpc(),
            )
            .await?;
        let spec_reply: SpecReply = serde_json::from_value(spec_reply)?;
        let spec = specfile::parse_str(&spec_reply.spec)?;
        let JobSpec::Job(job) = spec else {
            return Err(GatorError::Spec(format!(
                "wrapper '{}' was handed a non-leaf spec",
                self.ident
            )));
        };
        std::fs::create_dir_all(&self.tracking)?;
        std::fs::write(
            self.tracking.join("spec.yaml"),
            specfile::to_yaml(&JobSpec::Job(job.clone()))?,
        )?;

        // A supervision failure still produces a terminal report; the job
        // just counts as failed with a synthetic exit code.
        let code = match self
            .supervise(job, &shared, &logger, &client, &server, stop_rx)
            .await
        {
            Ok(code) => code,
            Err(err) => {
                logger.critical(format!("supervision failed: {err}")).await;
                255
            }
        };
        shared.finished.store(true, Ordering::Relaxed);

        // EXIT: report upward, then tear everything down.
        let result = if code == 0 && logger.error_count() == 0 {
            ChildResult::Success
        } else {
            ChildResult::Failure
        };
        let metrics = self.final_metrics(&shared, &logger, result).await;
        let payload = CompletePayload {
            ident: self.ident.clone(),
            result,
            code,
            metrics,
            db_file: Some(store.path().display().to_string()),
        };
        if let Err(err) = client
            .call(
                action::COMPLETE,
                serde_json::to_value(&payload)?,
                self.config.timeouts.rpc(),
            )
            .await
        {
            warn!(%err, "completion was not acknowledged");
        }

        client.close().await;
        server.stop().await;
        store.close().await;
        Ok(code)
    }

    /// EXEC + MONITOR + REPORT: spawn the process and see it through.
    async fn supervise(
        &self,
        job: Job,
        shared: &Arc<WrapperShared>,
        logger: &Arc<JobLogger>,
        client: &Arc<WsClient>,
        server: &WsServer,
        mut stop_rx: watch::Receiver<bool>,
    ) -> GatorResult<i32> {
        if *stop_rx.borrow() {
            logger.warning("stopped before the job could launch").await;
            return Ok(255);
        }

        // Overlay the spec environment onto the inherited one, then inject
        // the runtime variables the job may rely on.
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.extend(job.env.clone());
        env.insert("GATOR_PARENT".to_string(), server.address());
        env.insert("GATOR_IDENT".to_string(), self.ident.clone());

        let command = specfile::expand_vars(&job.command, &env);
        let args: Vec<String> = job
            .args
            .iter()
            .map(|arg| specfile::expand_vars(arg, &env))
            .collect();
        let cwd = specfile::expand_vars(job.cwd.as_deref().unwrap_or("."), &env);

        let limits = ResourceSet::from_requests(&job.resources);
        let store = logger.store();
        store
            .push_attribute("cmd", &format!("{command} {}", args.join(" ")))
            .await?;
        store.push_attribute("cwd", &cwd).await?;
        store
            .push_attribute("host", &System::host_name().unwrap_or_default())
            .await?;
        store
            .push_attribute("started", &Utc::now().timestamp().to_string())
            .await?;
        store
            .push_attribute("req_cores", &limits.cores.to_string())
            .await?;
        store
            .push_attribute("req_memory", &limits.memory_bytes.to_string())
            .await?;

        logger
            .info(format!("launching task: {command} {}", args.join(" ")))
            .await;
        let mut child = Command::new(&command)
            .args(&args)
            .env_clear()
            .envs(&env)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| GatorError::Scheduler(format!("failed to spawn '{command}': {err}")))?;

        let pid = child.id();
        if let Some(pid) = pid {
            store.push_attribute("pid", &pid.to_string()).await?;
        }

        // MONITOR: output drains, the resource sampler, and the update tick
        // all run concurrently with the wait on the child.
        let parser = Arc::new(OutputParser::new(Arc::clone(logger)));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatorError::Scheduler("stdout was not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatorError::Scheduler("stderr was not piped".into()))?;
        let drain_out = parser.spawn_drain(stdout, Severity::Info);
        let drain_err = parser.spawn_drain(stderr, Severity::Error);

        let (sampler_stop_tx, sampler_stop_rx) = watch::channel(false);
        let sampler = Arc::new(ResourceSampler::new(Arc::clone(logger), limits));
        let sampler_task = pid.map(|pid| {
            sampler.spawn(pid, self.config.intervals.sample(), sampler_stop_rx)
        });

        let mut update_tick = interval(self.config.intervals.update());
        update_tick.tick().await; // swallow the immediate first tick

        let mut stopped = false;
        let code = loop {
            // The shutdown ladder needs the child handle, so it runs outside
            // the select that is already waiting on it.
            if stopped {
                logger.warning("stop requested, shutting the job down").await;
                break self.shutdown_ladder(&mut child).await?;
            }
            tokio::select! {
                status = child.wait() => {
                    let status = status
                        .map_err(|err| GatorError::Scheduler(format!("wait failed: {err}")))?;
                    break status.code().unwrap_or(255);
                }
                _ = update_tick.tick() => {
                    self.send_update(shared, logger, client, &sampler).await;
                }
                changed = stop_rx.changed() => {
                    if changed.is_ok() && *stop_rx.borrow() {
                        stopped = true;
                    }
                }
            }
        };

        // Let the drains reach EOF so the tail of the output is captured.
        let _ = drain_out.await;
        let _ = drain_err.await;
        let _ = sampler_stop_tx.send(true);
        if let Some(task) = sampler_task {
            let _ = task.await;
        }

        let final_code = if stopped && code == 0 { 255 } else { code };
        logger
            .info(format!("task completed with return code {final_code}"))
            .await;
        let store = logger.store();
        store
            .push_attribute("stopped", &Utc::now().timestamp().to_string())
            .await?;
        store.push_attribute("exit", &final_code.to_string()).await?;

        let (cpu_max, rss_max) = sampler.peaks().await;
        store
            .upsert_metric("cpu_percent_max", cpu_max, Utc::now().timestamp())
            .await?;
        store
            .upsert_metric("rss_bytes_max", rss_max, Utc::now().timestamp())
            .await?;

        Ok(final_code)
    }

    /// REPORT: close stdin, wait for natural termination, then escalate
    /// SIGTERM and finally SIGKILL.
    async fn shutdown_ladder(&self, child: &mut Child) -> GatorResult<i32> {
        drop(child.stdin.take());
        if let Ok(Ok(status)) =
            tokio::time::timeout(self.config.timeouts.term_grace(), child.wait()).await
        {
            return Ok(status.code().unwrap_or(255));
        }

        if let Some(pid) = child.id() {
            debug!(pid, "escalating to SIGTERM");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        if let Ok(Ok(status)) =
            tokio::time::timeout(self.config.timeouts.kill_grace(), child.wait()).await
        {
            return Ok(status.code().unwrap_or(255));
        }

        debug!("escalating to SIGKILL");
        let _ = child.start_kill();
        let status = child
            .wait()
            .await
            .map_err(|err| GatorError::Scheduler(format!("wait failed: {err}")))?;
        Ok(status.code().unwrap_or(255))
    }

    async fn send_update(
        &self,
        shared: &Arc<WrapperShared>,
        logger: &Arc<JobLogger>,
        client: &Arc<WsClient>,
        sampler: &Arc<ResourceSampler>,
    ) {
        let mut metrics = logger.counts_snapshot();
        metrics.insert("sub_total".into(), 1);
        metrics.insert("sub_active".into(), 1);
        metrics.insert("sub_passed".into(), 0);
        metrics.insert("sub_failed".into(), 0);
        let (cpu_max, rss_max) = sampler.peaks().await;
        metrics.insert("cpu_percent_max".into(), cpu_max);
        metrics.insert("rss_bytes_max".into(), rss_max);
        for (name, value) in shared.user_metrics.lock().await.iter() {
            metrics.insert(name.clone(), *value);
        }

        let payload = json!({"ident": self.ident, "metrics": metrics});
        if let Err(err) = client
            .call(action::UPDATE, payload, self.config.timeouts.rpc())
            .await
        {
            warn!(%err, "periodic update failed");
        }
    }

    async fn final_metrics(
        &self,
        shared: &Arc<WrapperShared>,
        logger: &Arc<JobLogger>,
        result: ChildResult,
    ) -> MetricMap {
        let mut metrics = logger.counts_snapshot();
        let passed = result == ChildResult::Success;
        metrics.insert("sub_total".into(), 1);
        metrics.insert("sub_active".into(), 0);
        metrics.insert("sub_passed".into(), i64::from(passed));
        metrics.insert("sub_failed".into(), i64::from(!passed));
        for (name, value) in shared.user_metrics.lock().await.iter() {
            metrics.insert(name.clone(), *value);
        }
        if let Ok(samples) = logger.store().metrics().await {
            for sample in samples {
                metrics.entry(sample.name).or_insert(sample.value);
            }
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn shared() -> (Arc<WrapperShared>, watch::Receiver<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let store = LogStore::open_in_memory().await.unwrap();
        let logger = Arc::new(JobLogger::new(Arc::new(store), None, Severity::Critical));
        (
            Arc::new(WrapperShared {
                logger,
                user_metrics: Mutex::new(MetricMap::new()),
                stop_tx,
                finished: AtomicBool::new(false),
            }),
            stop_rx,
        )
    }

    #[tokio::test]
    async fn test_metric_action_records_value() {
        let (shared, _rx) = shared().await;
        let handler = WrapperHandler {
            shared: Arc::clone(&shared),
        };
        handler
            .handle(action::METRIC, json!({"name": "lint_warnings", "value": 4}))
            .await
            .unwrap();
        assert_eq!(
            shared.user_metrics.lock().await.get("lint_warnings"),
            Some(&4)
        );
    }

    #[tokio::test]
    async fn test_metric_action_rejects_reserved_names() {
        let (shared, _rx) = shared().await;
        let handler = WrapperHandler { shared };
        for name in ["sub_total", "sub_passed", "msg_error"] {
            let err = handler
                .handle(action::METRIC, json!({"name": name, "value": 1}))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("reserved"));
        }
    }

    #[tokio::test]
    async fn test_stop_action_raises_the_flag() {
        let (shared, stop_rx) = shared().await;
        let handler = WrapperHandler { shared };
        handler.handle(action::STOP, json!({})).await.unwrap();
        assert!(*stop_rx.borrow());
    }

    #[tokio::test]
    async fn test_log_action_counts_toward_job_result() {
        let (shared, _rx) = shared().await;
        let handler = WrapperHandler {
            shared: Arc::clone(&shared),
        };
        handler
            .handle(
                action::LOG,
                json!({"timestamp": 5, "severity": "ERROR", "message": "bad"}),
            )
            .await
            .unwrap();
        assert_eq!(shared.logger.error_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_action_rejected() {
        let (shared, _rx) = shared().await;
        let handler = WrapperHandler { shared };
        assert!(handler.handle("bogus", json!({})).await.is_err());
    }
}
