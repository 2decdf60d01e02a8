//! Scheduler port: launch a child process that phones home to a parent URL.
//!
//! Concrete adapters decide how processes come to exist (local fork/exec,
//! cluster submission, containers). The launched process is expected to
//! connect back to `parent_url` and `register` within a grace period, or the
//! tier treats it as failed-to-start.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::errors::GatorResult;
use crate::domain::models::resource::ResourceSet;

/// Which supervisor role the launched process should assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// A wrapper supervising one leaf job.
    Wrapper,
    /// A tier supervising a group or array.
    Tier,
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wrapper => "wrapper",
            Self::Tier => "tier",
        }
    }
}

/// Everything a scheduler needs to launch one child.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub ident: String,
    pub parent_url: String,
    pub mode: LaunchMode,
    pub tracking: PathBuf,
    pub resources: ResourceSet,
    /// Leaf count under the child, used for slot accounting.
    pub expected_leaves: u64,
}

/// Handle to a launched child process.
#[async_trait]
pub trait JobHandle: Send + Sync {
    /// Wait for the process to exit and return its exit code.
    async fn wait_for_exit(&mut self) -> GatorResult<i32>;

    /// Forcefully terminate the process.
    async fn terminate(&mut self) -> GatorResult<()>;
}

/// Launches child supervisor processes.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> GatorResult<Box<dyn JobHandle>>;
}
