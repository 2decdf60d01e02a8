//! Periodic resource sampling of the supervised process tree.
//!
//! Reads CPU usage and resident memory for the child process and its
//! descendants on a fixed cadence, appends samples to the store, tracks the
//! running maxima for the `cpu_percent_max`/`rss_bytes_max` metrics, and
//! warns once per excursion above the job's requested resources.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

use crate::domain::models::{ResourceSample, ResourceSet, Severity};
use crate::services::job_logger::JobLogger;

#[derive(Debug, Clone, Copy, Default)]
struct Peaks {
    cpu_percent: f64,
    rss_bytes: i64,
}

pub struct ResourceSampler {
    logger: Arc<JobLogger>,
    limits: ResourceSet,
    peaks: Arc<Mutex<Peaks>>,
}

impl ResourceSampler {
    pub fn new(logger: Arc<JobLogger>, limits: ResourceSet) -> Self {
        Self {
            logger,
            limits,
            peaks: Arc::new(Mutex::new(Peaks::default())),
        }
    }

    /// The highest observed usage so far, as integer metric values.
    pub async fn peaks(&self) -> (i64, i64) {
        let peaks = self.peaks.lock().await;
        (peaks.cpu_percent.round() as i64, peaks.rss_bytes)
    }

    /// Spawn the sampling loop for the process with id `pid`. The loop runs
    /// until `shutdown` flips to true, taking one final sample on the way
    /// out.
    pub fn spawn(
        self: &Arc<Self>,
        pid: u32,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let sampler = Arc::clone(self);
        tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = interval(period);
            // The first tick of a tokio interval fires immediately; that
            // reading primes sysinfo's CPU accounting.
            let mut exceeding = false;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sampler.sample(&mut system, pid, &mut exceeding).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            sampler.sample(&mut system, pid, &mut exceeding).await;
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn sample(&self, system: &mut System, pid: u32, exceeding: &mut bool) {
        system.refresh_processes(ProcessesToUpdate::All, true);
        let Some((cpu_percent, rss_bytes)) = usage_of_tree(system, pid) else {
            debug!(pid, "supervised process has no readable statistics");
            return;
        };

        let sample = ResourceSample {
            timestamp: Utc::now().timestamp(),
            cpu_percent,
            rss_bytes,
        };
        if let Err(err) = self.logger.store().append_resource(&sample).await {
            debug!(%err, "failed to persist resource sample");
        }

        {
            let mut peaks = self.peaks.lock().await;
            peaks.cpu_percent = peaks.cpu_percent.max(cpu_percent);
            peaks.rss_bytes = peaks.rss_bytes.max(rss_bytes);
        }

        self.check_limits(cpu_percent, rss_bytes, exceeding).await;
    }

    /// Edge-triggered warning when usage exceeds the requested resources.
    async fn check_limits(&self, cpu_percent: f64, rss_bytes: i64, exceeding: &mut bool) {
        let cpu_limit = f64::from(self.limits.cores) * 100.0;
        let over_cpu = self.limits.cores > 0 && cpu_percent > cpu_limit;
        let over_mem =
            self.limits.memory_bytes > 0 && rss_bytes as u64 > self.limits.memory_bytes;
        let now_exceeding = over_cpu || over_mem;
        if now_exceeding && !*exceeding {
            self.logger
                .log(
                    Severity::Warning,
                    &format!(
                        "job exceeds its requested resources ({} cores, {} bytes): \
                         using {cpu_percent:.1}% CPU and {rss_bytes} bytes",
                        self.limits.cores, self.limits.memory_bytes
                    ),
                )
                .await;
        }
        *exceeding = now_exceeding;
    }
}

/// Sum CPU percent and RSS over `pid` and every transitive descendant.
fn usage_of_tree(system: &System, pid: u32) -> Option<(f64, i64)> {
    let root = Pid::from_u32(pid);
    system.process(root)?;

    let mut members = vec![root];
    let mut index = 0;
    while index < members.len() {
        let parent = members[index];
        for (candidate, process) in system.processes() {
            if process.parent() == Some(parent) && !members.contains(candidate) {
                members.push(*candidate);
            }
        }
        index += 1;
    }

    let mut cpu_percent = 0.0f64;
    let mut rss_bytes = 0i64;
    for member in members {
        if let Some(process) = system.process(member) {
            cpu_percent += f64::from(process.cpu_usage());
            rss_bytes += process.memory() as i64;
        }
    }
    Some((cpu_percent, rss_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::LogStore;

    async fn sampler(limits: ResourceSet) -> Arc<ResourceSampler> {
        let store = Arc::new(LogStore::open_in_memory().await.unwrap());
        let logger = Arc::new(JobLogger::new(store, None, Severity::Info));
        Arc::new(ResourceSampler::new(logger, limits))
    }

    #[tokio::test]
    async fn test_samples_own_process() {
        let sampler = sampler(ResourceSet::default()).await;
        let (tx, rx) = watch::channel(false);
        let task = sampler.spawn(std::process::id(), Duration::from_millis(50), rx);
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        // Our own process certainly holds some resident memory.
        let (_cpu, rss) = sampler.peaks().await;
        assert!(rss > 0);
    }

    #[tokio::test]
    async fn test_limit_warning_is_edge_triggered() {
        // A 1-byte memory request guarantees an excursion on every sample.
        let limits = ResourceSet {
            cores: 0,
            memory_bytes: 1,
            licenses: Default::default(),
        };
        let sampler = sampler(limits).await;
        let mut exceeding = false;
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        sampler
            .sample(&mut system, std::process::id(), &mut exceeding)
            .await;
        assert!(exceeding);
        sampler
            .sample(&mut system, std::process::id(), &mut exceeding)
            .await;

        let warnings = sampler.logger.count(Severity::Warning);
        assert_eq!(warnings, 1);
    }
}
