//! Tier: supervises the children of one JobGroup or JobArray instance.
//!
//! Lifecycle: INIT (store + server) -> CONNECT (register upward; the root
//! loads its spec from disk instead) -> EXPAND (array expansion + cycle
//! rejection) -> LAUNCH (initial eligible set) -> SUPERVISE (protocol
//! traffic, resolver passes, periodic updates) -> REPORT/EXIT.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::domain::errors::{GatorError, GatorResult};
use crate::domain::models::log::merge_metrics;
use crate::domain::models::{
    ChildRecord, ChildResult, ChildState, JobSpec, MetricMap, ResourceSet, Severity,
};
use crate::domain::ports::{ActionHandler, ConsoleSink, LaunchMode, LaunchRequest, Scheduler};
use crate::infrastructure::config::Config;
use crate::infrastructure::database::LogStore;
use crate::infrastructure::protocol::client::{post_once, request_once};
use crate::infrastructure::protocol::messages::{
    action, ApiMessage, ChildSummary, ChildrenReply, CompletePayload, GetMessagesPayload,
    GetMessagesReply, LogPayload, RegisterPayload, SpecPayload, SpecReply, UpdatePayload,
};
use crate::infrastructure::protocol::{WsClient, WsServer};
use crate::infrastructure::specfile;
use crate::services::dependency_resolver::DependencyResolver;
use crate::services::job_logger::JobLogger;

/// Synthetic exit code recorded for children that never ran or vanished.
const ABORT_EXIT_CODE: i32 = 255;

/// State shared between the tier runtime and its protocol handler.
struct TierShared {
    ident: String,
    logger: Arc<JobLogger>,
    children: Mutex<BTreeMap<String, ChildRecord>>,
    /// Signals for forcing a launched child's process down.
    terminators: Mutex<HashMap<String, oneshot::Sender<()>>>,
    /// Wakes the supervise loop for another resolver pass.
    kick: Notify,
    stop_tx: watch::Sender<bool>,
    finished: AtomicBool,
    config: Config,
}

impl TierShared {
    fn stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Mark local state as stopping, abort everything still PENDING, and
    /// forward `stop` to every STARTED child. Returns once forwarding is
    /// done; children may still be terminating.
    async fn initiate_stop(&self) {
        if self.stop_tx.send_replace(true) {
            return;
        }
        self.logger.warning("stopping all jobs").await;

        let mut started = Vec::new();
        {
            let mut children = self.children.lock().await;
            let now = Utc::now().timestamp();
            for record in children.values_mut() {
                match record.state {
                    ChildState::Pending => {
                        if let Err(err) = record.mark_aborted(ABORT_EXIT_CODE, now) {
                            debug!(%err, "abort on stop failed");
                        }
                    }
                    ChildState::Started => {
                        if let Some(server) = &record.server_url {
                            started.push(server.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        for server in started {
            if let Err(err) = post_once(&server, action::STOP, json!({})).await {
                warn!(%err, %server, "failed to forward stop");
            }
        }
        self.kick.notify_one();
    }
}

struct TierHandler {
    shared: Arc<TierShared>,
}

#[async_trait]
impl ActionHandler for TierHandler {
    async fn handle(&self, name: &str, payload: Value) -> GatorResult<Value> {
        match name {
            action::LOG => {
                let entry: LogPayload = serde_json::from_value(payload)?;
                // Children already tallied their own entries; store and pass
                // through without re-counting.
                self.shared
                    .logger
                    .ingest(entry.timestamp, entry.severity, &entry.message, false)
                    .await;
                Ok(json!({}))
            }
            action::SPEC => {
                let request: SpecPayload = serde_json::from_value(payload)?;
                let children = self.shared.children.lock().await;
                let record = children
                    .get(&request.ident)
                    .ok_or_else(|| bad_ident(&request.ident))?;
                if !matches!(record.state, ChildState::Launched | ChildState::Started) {
                    return Err(GatorError::Protocol(format!(
                        "spec requested for '{}' in state {}",
                        request.ident,
                        record.state.as_str()
                    )));
                }
                let reply = SpecReply {
                    spec: specfile::to_yaml(&record.spec)?,
                };
                Ok(serde_json::to_value(reply)?)
            }
            action::REGISTER => {
                let request: RegisterPayload = serde_json::from_value(payload)?;
                let mut children = self.shared.children.lock().await;
                let record = children
                    .get_mut(&request.ident)
                    .ok_or_else(|| bad_ident(&request.ident))?;
                record
                    .mark_started(request.server, Utc::now().timestamp())
                    .map_err(GatorError::Protocol)?;
                self.shared
                    .logger
                    .debug(format!("child '{}' has started", request.ident))
                    .await;
                Ok(json!({}))
            }
            action::UPDATE => {
                let request: UpdatePayload = serde_json::from_value(payload)?;
                let mut children = self.shared.children.lock().await;
                let record = children
                    .get_mut(&request.ident)
                    .ok_or_else(|| bad_ident(&request.ident))?;
                if record.state != ChildState::Started {
                    return Err(GatorError::Protocol(format!(
                        "update from '{}' in state {}",
                        request.ident,
                        record.state.as_str()
                    )));
                }
                record.metrics = request.metrics;
                record.updated_ts = Some(Utc::now().timestamp());
                Ok(json!({}))
            }
            action::COMPLETE => {
                let request: CompletePayload = serde_json::from_value(payload)?;
                {
                    let mut children = self.shared.children.lock().await;
                    let record = children
                        .get_mut(&request.ident)
                        .ok_or_else(|| bad_ident(&request.ident))?;
                    if record.state != ChildState::Started {
                        return Err(GatorError::Protocol(format!(
                            "complete from '{}' in state {}",
                            request.ident,
                            record.state.as_str()
                        )));
                    }
                    record
                        .mark_complete(request.result, request.code, Utc::now().timestamp())
                        .map_err(GatorError::Protocol)?;
                    record.metrics = request.metrics;
                    record.db_file = request.db_file;
                }
                self.shared
                    .logger
                    .debug(format!(
                        "child '{}' completed with {}",
                        request.ident,
                        request.result.as_str()
                    ))
                    .await;
                self.shared.kick.notify_one();
                Ok(json!({}))
            }
            action::CHILDREN => {
                let children = self.shared.children.lock().await;
                let reply: ChildrenReply = children
                    .iter()
                    .map(|(ident, record)| {
                        (
                            ident.clone(),
                            ChildSummary {
                                state: record.state,
                                result: record.result,
                                server: record.server_url.clone(),
                                metrics: record.metrics.clone(),
                                exitcode: record.exit_code,
                                started: record.started_ts,
                                updated: record.updated_ts,
                                completed: record.completed_ts,
                            },
                        )
                    })
                    .collect();
                Ok(serde_json::to_value(reply)?)
            }
            action::GET_TREE => {
                let snapshot: Vec<(String, String, Option<String>, bool)> = {
                    let children = self.shared.children.lock().await;
                    children
                        .values()
                        .map(|record| {
                            (
                                record.ident.clone(),
                                record.state.as_str().to_string(),
                                record.server_url.clone(),
                                record.spec.is_leaf(),
                            )
                        })
                        .collect()
                };
                // Fan out to sub-tiers in parallel; any failure or timeout
                // degrades to the child's state string.
                let rpc = self.shared.config.timeouts.rpc();
                let lookups = snapshot.into_iter().map(|(ident, state, server, leaf)| {
                    async move {
                        let subtree = match (&server, leaf) {
                            (Some(server), false) => {
                                request_once(server, action::GET_TREE, json!({}), rpc)
                                    .await
                                    .ok()
                            }
                            _ => None,
                        };
                        (ident, subtree.unwrap_or(Value::String(state)))
                    }
                });
                let tree: serde_json::Map<String, Value> =
                    futures::future::join_all(lookups).await.into_iter().collect();
                Ok(Value::Object(tree))
            }
            action::STOP => {
                self.shared.initiate_stop().await;
                Ok(json!({}))
            }
            action::GET_MESSAGES => {
                let page: GetMessagesPayload = serde_json::from_value(payload)?;
                let store = self.shared.logger.store();
                let entries = store.messages_after(page.after, page.limit).await?;
                let total = store.message_count().await?;
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

fn bad_ident(ident: &str) -> GatorError {
    GatorError::Protocol(format!("unknown child ident '{ident}'"))
}

pub struct Tier {
    ident: String,
    parent: Option<String>,
    spec: Option<JobSpec>,
    tracking: PathBuf,
    config: Config,
    scheduler: Arc<dyn Scheduler>,
    console: Option<Arc<dyn ConsoleSink>>,
}

impl Tier {
    /// A tier launched by a parent; the spec is fetched over the wire.
    pub fn child(
        ident: String,
        parent: String,
        tracking: PathBuf,
        config: Config,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            ident,
            parent: Some(parent),
            spec: None,
            tracking,
            config,
            scheduler,
            console: None,
        }
    }

    /// The root tier; the spec comes from disk and log entries render to
    /// the injected console sink.
    pub fn root(
        spec: JobSpec,
        tracking: PathBuf,
        config: Config,
        scheduler: Arc<dyn Scheduler>,
        console: Option<Arc<dyn ConsoleSink>>,
    ) -> Self {
        Self {
            ident: spec.ident().to_string(),
            parent: None,
            spec: Some(spec),
            tracking,
            config,
            scheduler,
            console,
        }
    }

    /// Run the tier to completion and return the process exit code.
    pub async fn run(self) -> GatorResult<i32> {
        // INIT
        let store = Arc::new(
            LogStore::open(
                &self.tracking.join("db.sqlite"),
                self.config.timeouts.store_write(),
            )
            .await?,
        );
        let console_min = Severity::from_str(&self.config.console.severity)
            .unwrap_or(Severity::Info);
        let logger = Arc::new(JobLogger::new(
            Arc::clone(&store),
            self.console.clone(),
            console_min,
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(TierShared {
            ident: self.ident.clone(),
            logger: Arc::clone(&logger),
            children: Mutex::new(BTreeMap::new()),
            terminators: Mutex::new(HashMap::new()),
            kick: Notify::new(),
            stop_tx,
            finished: AtomicBool::new(false),
            config: self.config.clone(),
        });
        let handler: Arc<dyn ActionHandler> = Arc::new(TierHandler {
            shared: Arc::clone(&shared),
        });
        let server = WsServer::bind(Arc::clone(&handler)).await?;

        // CONNECT (skipped by the root, which owns its spec already).
        let client = match &self.parent {
            Some(parent) => {
                let client = Arc::new(
                    WsClient::connect_with_backoff(
                        parent,
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
                Some(client)
            }
            None => None,
        };

        let spec = match (&self.spec, &client) {
            (Some(spec), _) => spec.clone(),
            (None, Some(client)) => {
                let reply = client
                    .call(
                        action::SPEC,
                        json!({"ident": self.ident}),
                        self.config.timeouts.rpc(),
                    )
                    .await?;
                let reply: SpecReply = serde_json::from_value(reply)?;
                specfile::parse_str(&reply.spec)?
            }
            (None, None) => {
                return Err(GatorError::Spec("tier has neither a spec nor a parent".into()))
            }
        };

        std::fs::create_dir_all(&self.tracking)?;
        std::fs::write(self.tracking.join("spec.yaml"), specfile::to_yaml(&spec)?)?;
        store
            .push_attribute("ident", &self.ident)
            .await?;
        store
            .push_attribute("started", &Utc::now().timestamp().to_string())
            .await?;

        // EXPAND
        let expected_leaves = spec.expected_leaves();
        if let Err(err) = self.expand(&spec, &shared).await {
            logger.critical(format!("{err}")).await;
            if let Some(client) = &client {
                self.report(&shared, client, &store, ChildResult::Failure, expected_leaves)
                    .await;
            }
            server.stop().await;
            store.close().await;
            return Err(err);
        }

        // LAUNCH + SUPERVISE
        logger
            .info(format!("tier '{}' launching sub-jobs", self.ident))
            .await;
        let result = self
            .supervise(&shared, &server, client.as_ref(), stop_rx, expected_leaves)
            .await?;
        shared.finished.store(true, Ordering::Relaxed);

        // REPORT / EXIT
        let metrics = aggregate(&shared, expected_leaves).await;
        logger
            .info(format!(
                "complete - T: {}, A: {}, P: {}, F: {}",
                metrics.get("sub_total").copied().unwrap_or(0),
                metrics.get("sub_active").copied().unwrap_or(0),
                metrics.get("sub_passed").copied().unwrap_or(0),
                metrics.get("sub_failed").copied().unwrap_or(0),
            ))
            .await;
        store
            .push_attribute("stopped", &Utc::now().timestamp().to_string())
            .await?;
        if let Some(client) = &client {
            self.report(&shared, client, &store, result, expected_leaves).await;
            client.close().await;
        }
        server.stop().await;
        store.close().await;
        Ok(if result == ChildResult::Success { 0 } else { 1 })
    }

    /// EXPAND: build the child table, rejecting bad dependency graphs
    /// before anything launches.
    async fn expand(&self, spec: &JobSpec, shared: &Arc<TierShared>) -> GatorResult<()> {
        let expanded = spec.expand_children()?;
        let mut children = BTreeMap::new();
        for child in expanded {
            children.insert(
                child.ident.clone(),
                ChildRecord::new(child.ident, child.spec),
            );
        }
        if let Some(cycle) = DependencyResolver::new().detect_cycle(&children) {
            return Err(GatorError::Spec(format!(
                "dependency cycle among: {}",
                cycle.join(" -> ")
            )));
        }
        *shared.children.lock().await = children;
        Ok(())
    }

    /// LAUNCH + SUPERVISE: resolver passes interleaved with protocol
    /// traffic until every child is terminal.
    async fn supervise(
        &self,
        shared: &Arc<TierShared>,
        server: &WsServer,
        client: Option<&Arc<WsClient>>,
        mut stop_rx: watch::Receiver<bool>,
        expected_leaves: u64,
    ) -> GatorResult<ChildResult> {
        let resolver = DependencyResolver::new();
        let mut update_tick = interval(self.config.intervals.update());
        update_tick.tick().await;
        let mut stop_escalated = false;

        loop {
            // Resolver pass: runs strictly after completions are recorded
            // and before any new launch, serialized on this task.
            let (to_launch, aborted_any) = {
                let mut children = shared.children.lock().await;
                let partition = resolver.partition(&children);
                let now = Utc::now().timestamp();
                for ident in &partition.abort {
                    shared
                        .logger
                        .warning(format!("'{ident}' will never run, discarding"))
                        .await;
                    if let Some(record) = children.get_mut(ident) {
                        if let Err(err) = record.mark_aborted(ABORT_EXIT_CODE, now) {
                            debug!(%err, "abort failed");
                        }
                    }
                }
                let mut aborted_any = !partition.abort.is_empty();
                let to_launch = if shared.stopping() {
                    for ident in &partition.launch_now {
                        if let Some(record) = children.get_mut(ident) {
                            let _ = record.mark_aborted(ABORT_EXIT_CODE, now);
                        }
                    }
                    aborted_any |= !partition.launch_now.is_empty();
                    Vec::new()
                } else {
                    for ident in &partition.launch_now {
                        if let Some(record) = children.get_mut(ident) {
                            if let Err(err) = record.mark_launched(now) {
                                debug!(%err, "launch transition failed");
                            }
                        }
                    }
                    partition.launch_now
                };
                (to_launch, aborted_any)
            };

            for ident in to_launch {
                self.launch_child(&ident, shared, server).await;
            }

            // An abort is a terminal transition: siblings waiting on the
            // aborted child must be re-evaluated before going back to sleep.
            if aborted_any {
                continue;
            }

            if all_terminal(shared).await {
                break;
            }

            tokio::select! {
                _ = shared.kick.notified() => {}
                _ = update_tick.tick() => {
                    if let Some(client) = client {
                        self.send_update(shared, client, expected_leaves).await;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_ok() && *stop_rx.borrow() && !stop_escalated {
                        stop_escalated = true;
                        self.arm_stop_escalation(shared);
                    }
                }
            }
        }

        let children = shared.children.lock().await;
        let result = if children
            .values()
            .all(|record| record.result == ChildResult::Success)
        {
            ChildResult::Success
        } else {
            ChildResult::Failure
        };
        Ok(result)
    }

    /// Hand one LAUNCHED child to the scheduler and arm its watchdogs.
    async fn launch_child(&self, ident: &str, shared: &Arc<TierShared>, server: &WsServer) {
        let (mode, resources, leaves) = {
            let children = shared.children.lock().await;
            let Some(record) = children.get(ident) else {
                return;
            };
            let mode = if record.spec.is_leaf() {
                LaunchMode::Wrapper
            } else {
                LaunchMode::Tier
            };
            let resources = match &record.spec {
                JobSpec::Job(job) => ResourceSet::from_requests(&job.resources),
                _ => ResourceSet::default(),
            };
            (mode, resources, record.spec.expected_leaves())
        };

        let request = LaunchRequest {
            ident: ident.to_string(),
            parent_url: server.address(),
            mode,
            tracking: self.tracking.join(ident),
            resources,
            expected_leaves: leaves,
        };
        let launched = tokio::time::timeout(
            self.config.timeouts.scheduler(),
            self.scheduler.launch(request),
        )
        .await;

        let mut handle = match launched {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                shared
                    .logger
                    .error(format!("failed to launch '{ident}': {err}"))
                    .await;
                abort_child(shared, ident, ABORT_EXIT_CODE).await;
                return;
            }
            Err(_) => {
                shared
                    .logger
                    .error(format!("scheduler timed out launching '{ident}'"))
                    .await;
                abort_child(shared, ident, ABORT_EXIT_CODE).await;
                return;
            }
        };

        // Watchdog 1: the child must register within the grace period.
        {
            let shared = Arc::clone(shared);
            let ident = ident.to_string();
            let grace = self.config.timeouts.register_grace();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let launched = {
                    let children = shared.children.lock().await;
                    children
                        .get(&ident)
                        .map(|record| record.state == ChildState::Launched)
                        .unwrap_or(false)
                };
                if launched {
                    shared
                        .logger
                        .error(format!("'{ident}' never connected back, discarding"))
                        .await;
                    abort_child(&shared, &ident, ABORT_EXIT_CODE).await;
                }
            });
        }

        // Watchdog 2: notice the process dying without having reported.
        let (terminate_tx, mut terminate_rx) = oneshot::channel();
        shared
            .terminators
            .lock()
            .await
            .insert(ident.to_string(), terminate_tx);
        let shared_exit = Arc::clone(shared);
        let ident_exit = ident.to_string();
        tokio::spawn(async move {
            let mut force = false;
            let code = loop {
                // Termination touches the handle, so it happens outside the
                // select that is already waiting on it.
                if force {
                    if let Err(err) = handle.terminate().await {
                        warn!(%err, "terminate failed");
                    }
                    break handle.wait_for_exit().await.unwrap_or(ABORT_EXIT_CODE);
                }
                tokio::select! {
                    code = handle.wait_for_exit() => break code.unwrap_or(ABORT_EXIT_CODE),
                    _ = &mut terminate_rx => force = true,
                }
            };
            shared_exit.terminators.lock().await.remove(&ident_exit);
            // Give an in-flight `complete` a moment to land.
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            let terminal = {
                let children = shared_exit.children.lock().await;
                children
                    .get(&ident_exit)
                    .map(ChildRecord::is_terminal)
                    .unwrap_or(true)
            };
            if !terminal {
                shared_exit
                    .logger
                    .error(format!(
                        "'{ident_exit}' exited with code {code} without reporting"
                    ))
                    .await;
                abort_child(&shared_exit, &ident_exit, code).await;
            }
        });
    }

    /// After the stop drain cap, forcibly terminate whatever is left.
    fn arm_stop_escalation(&self, shared: &Arc<TierShared>) {
        let shared = Arc::clone(shared);
        let drain = self.config.timeouts.stop_drain();
        tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            let mut terminators = shared.terminators.lock().await;
            for (ident, tx) in terminators.drain() {
                debug!(%ident, "stop drain expired, terminating");
                let _ = tx.send(());
            }
        });
    }

    async fn send_update(
        &self,
        shared: &Arc<TierShared>,
        client: &Arc<WsClient>,
        expected_leaves: u64,
    ) {
        let metrics = aggregate(shared, expected_leaves).await;
        let payload = json!({"ident": self.ident, "metrics": metrics});
        if let Err(err) = client
            .call(action::UPDATE, payload, self.config.timeouts.rpc())
            .await
        {
            warn!(%err, "periodic update failed");
        }
    }

    async fn report(
        &self,
        shared: &Arc<TierShared>,
        client: &Arc<WsClient>,
        store: &Arc<LogStore>,
        result: ChildResult,
        expected_leaves: u64,
    ) {
        let payload = CompletePayload {
            ident: self.ident.clone(),
            result,
            code: if result == ChildResult::Success { 0 } else { 1 },
            metrics: aggregate(shared, expected_leaves).await,
            db_file: Some(store.path().display().to_string()),
        };
        match serde_json::to_value(&payload) {
            Ok(value) => {
                if let Err(err) = client
                    .call(action::COMPLETE, value, self.config.timeouts.rpc())
                    .await
                {
                    warn!(%err, "completion was not acknowledged");
                }
            }
            Err(err) => warn!(%err, "could not serialize completion"),
        }
    }
}

async fn all_terminal(shared: &Arc<TierShared>) -> bool {
    let children = shared.children.lock().await;
    children.values().all(ChildRecord::is_terminal)
}

async fn abort_child(shared: &Arc<TierShared>, ident: &str, code: i32) {
    {
        let mut children = shared.children.lock().await;
        if let Some(record) = children.get_mut(ident) {
            if record.is_terminal() {
                return;
            }
            if let Err(err) = record.mark_aborted(code, Utc::now().timestamp()) {
                debug!(%err, "abort failed");
                return;
            }
        }
    }
    shared.kick.notify_one();
}

/// The tier's aggregate metric snapshot.
///
/// `sub_*` counters are tier-computed and authoritative: totals come from
/// child reports (falling back to each child's leaf count before it
/// reports), actives count LAUNCHED/STARTED children, and an aborted
/// child's whole subtree counts as failed. Every other named metric is
/// summed element-wise across children, with this tier's own message
/// tallies added in.
async fn aggregate(shared: &Arc<TierShared>, expected_leaves: u64) -> MetricMap {
    let children = shared.children.lock().await;
    let mut sub_total = 0i64;
    let mut sub_active = 0i64;
    let mut sub_passed = 0i64;
    let mut sub_failed = 0i64;
    let mut named = MetricMap::new();

    for record in children.values() {
        let leaves = record.spec.expected_leaves() as i64;
        sub_total += record
            .metrics
            .get("sub_total")
            .copied()
            .filter(|&reported| reported > 0)
            .unwrap_or(leaves);
        if record.state.is_active() {
            sub_active += 1;
        }
        match (record.state, record.result) {
            (ChildState::Complete, ChildResult::Aborted) => sub_failed += leaves,
            _ => {
                sub_passed += record.metrics.get("sub_passed").copied().unwrap_or(0);
                sub_failed += record.metrics.get("sub_failed").copied().unwrap_or(0);
            }
        }
        let passthrough: MetricMap = record
            .metrics
            .iter()
            .filter(|(name, _)| !name.starts_with("sub_"))
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        merge_metrics(&mut named, &passthrough);
    }

    // While children are still starting up, the spec's leaf count is the
    // floor for the total.
    sub_total = sub_total.max(expected_leaves as i64);

    merge_metrics(&mut named, &shared.logger.counts_snapshot());
    named.insert("sub_total".into(), sub_total);
    named.insert("sub_active".into(), sub_active);
    named.insert("sub_passed".into(), sub_passed);
    named.insert("sub_failed".into(), sub_failed);
    named
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Job, JobGroup};

    fn leaf(ident: &str) -> JobSpec {
        JobSpec::Job(Job {
            ident: ident.into(),
            command: "true".into(),
            ..Job::default()
        })
    }

    async fn shared_with(children: Vec<ChildRecord>) -> Arc<TierShared> {
        let store = Arc::new(LogStore::open_in_memory().await.unwrap());
        let logger = Arc::new(JobLogger::new(store, None, Severity::Critical));
        let (stop_tx, _stop_rx) = watch::channel(false);
        Arc::new(TierShared {
            ident: "tier".into(),
            logger,
            children: Mutex::new(
                children
                    .into_iter()
                    .map(|record| (record.ident.clone(), record))
                    .collect(),
            ),
            terminators: Mutex::new(HashMap::new()),
            kick: Notify::new(),
            stop_tx,
            finished: AtomicBool::new(false),
            config: Config::default(),
        })
    }

    fn handler(shared: &Arc<TierShared>) -> TierHandler {
        TierHandler {
            shared: Arc::clone(shared),
        }
    }

    #[tokio::test]
    async fn test_register_transitions_child() {
        let mut record = ChildRecord::new("a", leaf("a"));
        record.mark_launched(1).unwrap();
        let shared = shared_with(vec![record]).await;
        handler(&shared)
            .handle(
                action::REGISTER,
                json!({"ident": "a", "server": "127.0.0.1:9999"}),
            )
            .await
            .unwrap();
        let children = shared.children.lock().await;
        let record = children.get("a").unwrap();
        assert_eq!(record.state, ChildState::Started);
        assert_eq!(record.server_url.as_deref(), Some("127.0.0.1:9999"));
    }

    #[tokio::test]
    async fn test_register_from_pending_rejected() {
        let shared = shared_with(vec![ChildRecord::new("a", leaf("a"))]).await;
        let err = handler(&shared)
            .handle(action::REGISTER, json!({"ident": "a", "server": "x"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PENDING"));
    }

    #[tokio::test]
    async fn test_update_requires_started() {
        let shared = shared_with(vec![ChildRecord::new("a", leaf("a"))]).await;
        let err = handler(&shared)
            .handle(action::UPDATE, json!({"ident": "a", "metrics": {}}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatorError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_complete_records_result_and_second_complete_fails() {
        let mut record = ChildRecord::new("a", leaf("a"));
        record.mark_launched(1).unwrap();
        record.mark_started("addr".into(), 2).unwrap();
        let shared = shared_with(vec![record]).await;
        let payload = json!({
            "ident": "a",
            "result": "SUCCESS",
            "code": 0,
            "metrics": {"sub_total": 1, "sub_passed": 1, "sub_failed": 0},
            "db_file": "/tmp/a/db.sqlite",
        });
        handler(&shared)
            .handle(action::COMPLETE, payload.clone())
            .await
            .unwrap();
        {
            let children = shared.children.lock().await;
            let record = children.get("a").unwrap();
            assert_eq!(record.result, ChildResult::Success);
            assert_eq!(record.exit_code, Some(0));
            assert_eq!(record.db_file.as_deref(), Some("/tmp/a/db.sqlite"));
        }
        // Receiving a second complete for the same ident is a protocol
        // error.
        assert!(handler(&shared)
            .handle(action::COMPLETE, payload)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_ident_rejected() {
        let shared = shared_with(vec![]).await;
        let err = handler(&shared)
            .handle(action::UPDATE, json!({"ident": "ghost", "metrics": {}}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown child"));
    }

    #[tokio::test]
    async fn test_spec_served_for_launched_child() {
        let mut record = ChildRecord::new("a", leaf("a"));
        record.mark_launched(1).unwrap();
        let shared = shared_with(vec![record]).await;
        let reply = handler(&shared)
            .handle(action::SPEC, json!({"ident": "a"}))
            .await
            .unwrap();
        let reply: SpecReply = serde_json::from_value(reply).unwrap();
        assert!(reply.spec.contains("!Job"));
        assert!(reply.spec.contains("ident: a"));
    }

    #[tokio::test]
    async fn test_children_snapshot() {
        let mut a = ChildRecord::new("a", leaf("a"));
        a.mark_launched(1).unwrap();
        let shared = shared_with(vec![a, ChildRecord::new("b", leaf("b"))]).await;
        let reply = handler(&shared)
            .handle(action::CHILDREN, json!({}))
            .await
            .unwrap();
        let reply: ChildrenReply = serde_json::from_value(reply).unwrap();
        assert_eq!(reply.len(), 2);
        assert_eq!(reply["a"].state, ChildState::Launched);
        assert_eq!(reply["b"].state, ChildState::Pending);
    }

    #[tokio::test]
    async fn test_stop_aborts_pending_children() {
        let shared = shared_with(vec![ChildRecord::new("a", leaf("a"))]).await;
        handler(&shared).handle(action::STOP, json!({})).await.unwrap();
        let children = shared.children.lock().await;
        let record = children.get("a").unwrap();
        assert_eq!(record.result, ChildResult::Aborted);
        assert!(shared.stopping());
    }

    #[tokio::test]
    async fn test_aggregate_counts() {
        let mut passed = ChildRecord::new("a", leaf("a"));
        passed.mark_launched(1).unwrap();
        passed.mark_started("x".into(), 2).unwrap();
        passed
            .mark_complete(ChildResult::Success, 0, 3)
            .unwrap();
        passed.metrics = MetricMap::from([
            ("sub_total".to_string(), 1),
            ("sub_passed".to_string(), 1),
            ("sub_failed".to_string(), 0),
            ("msg_info".to_string(), 4),
            ("lint_warnings".to_string(), 2),
        ]);

        let mut aborted = ChildRecord::new("b", leaf("b"));
        aborted.mark_aborted(255, 3).unwrap();

        let mut running = ChildRecord::new("c", leaf("c"));
        running.mark_launched(1).unwrap();
        running.mark_started("y".into(), 2).unwrap();

        let shared = shared_with(vec![passed, aborted, running]).await;
        let metrics = aggregate(&shared, 3).await;
        assert_eq!(metrics.get("sub_total"), Some(&3));
        assert_eq!(metrics.get("sub_active"), Some(&1));
        assert_eq!(metrics.get("sub_passed"), Some(&1));
        assert_eq!(metrics.get("sub_failed"), Some(&1));
        assert_eq!(metrics.get("lint_warnings"), Some(&2));
        assert_eq!(metrics.get("msg_info"), Some(&4));
    }

    #[tokio::test]
    async fn test_aggregate_respects_subtree_totals() {
        // A sub-tier child reporting a richer subtree than one leaf.
        let group = JobSpec::Group(JobGroup {
            ident: "g".into(),
            jobs: vec![leaf("x"), leaf("y")],
            ..JobGroup::default()
        });
        let mut sub = ChildRecord::new("g", group);
        sub.mark_launched(1).unwrap();
        sub.mark_started("z".into(), 2).unwrap();
        sub.metrics = MetricMap::from([
            ("sub_total".to_string(), 2),
            ("sub_passed".to_string(), 1),
            ("sub_failed".to_string(), 0),
        ]);
        let shared = shared_with(vec![sub]).await;
        let metrics = aggregate(&shared, 2).await;
        assert_eq!(metrics.get("sub_total"), Some(&2));
        assert_eq!(metrics.get("sub_passed"), Some(&1));
    }
}
