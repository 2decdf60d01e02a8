//! Local fork/exec scheduler.
//!
//! Re-enters this same executable in `wrapper` or `tier` mode. Concurrency
//! is bounded by slots: a leaf job takes one slot, a sub-tier takes up to
//! its expected leaf count, released when the process exits.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::domain::errors::{GatorError, GatorResult};
use crate::domain::ports::{JobHandle, LaunchMode, LaunchRequest, Scheduler};

pub struct LocalScheduler {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl LocalScheduler {
    pub fn new(concurrency: usize) -> GatorResult<Self> {
        if concurrency == 0 {
            return Err(GatorError::Scheduler(
                "local scheduler needs at least one slot".into(),
            ));
        }
        Ok(Self {
            slots: Arc::new(Semaphore::new(concurrency)),
            capacity: concurrency,
        })
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn launch(&self, request: LaunchRequest) -> GatorResult<Box<dyn JobHandle>> {
        let want = match request.mode {
            LaunchMode::Wrapper => 1,
            LaunchMode::Tier => self
                .capacity
                .min(request.expected_leaves.max(1) as usize),
        };
        let permits = Arc::clone(&self.slots)
            .acquire_many_owned(want as u32)
            .await
            .map_err(|_| GatorError::Scheduler("scheduler is shut down".into()))?;
        debug!(ident = %request.ident, slots = want, "scheduling");

        let exe = std::env::current_exe()
            .map_err(|err| GatorError::Scheduler(format!("cannot locate executable: {err}")))?;
        let child = Command::new(exe)
            .arg(request.mode.as_str())
            .arg("--ident")
            .arg(&request.ident)
            .arg("--parent")
            .arg(&request.parent_url)
            .arg("--tracking")
            .arg(&request.tracking)
            .env("GATOR_PARENT", &request.parent_url)
            .env("GATOR_IDENT", &request.ident)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                GatorError::Scheduler(format!("failed to launch '{}': {err}", request.ident))
            })?;

        Ok(Box::new(LocalHandle {
            child,
            _permits: permits,
        }))
    }
}

struct LocalHandle {
    child: Child,
    _permits: OwnedSemaphorePermit,
}

#[async_trait]
impl JobHandle for LocalHandle {
    async fn wait_for_exit(&mut self) -> GatorResult<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| GatorError::Scheduler(format!("wait failed: {err}")))?;
        Ok(status.code().unwrap_or(255))
    }

    async fn terminate(&mut self) -> GatorResult<()> {
        self.child
            .start_kill()
            .map_err(|err| GatorError::Scheduler(format!("kill failed: {err}")))
    }
}
