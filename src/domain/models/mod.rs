//! Domain models.

pub mod child;
pub mod log;
pub mod resource;
pub mod severity;
pub mod spec;

pub use child::{ChildRecord, ChildResult, ChildState};
pub use log::{LogEntry, MetricMap, MetricSample, ResourceSample};
pub use resource::{MemoryUnit, Resource, ResourceSet};
pub use severity::Severity;
pub use spec::{Job, JobArray, JobGroup, JobSpec};
