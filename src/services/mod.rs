//! Services: the supervisor runtimes and their supporting pieces.

pub mod dependency_resolver;
pub mod job_logger;
pub mod output_parser;
pub mod resource_sampler;
pub mod tier;
pub mod wrapper;

pub use dependency_resolver::{DependencyResolver, Partition};
pub use job_logger::JobLogger;
pub use output_parser::{LineRule, OutputParser};
pub use resource_sampler::ResourceSampler;
pub use tier::Tier;
pub use wrapper::Wrapper;
