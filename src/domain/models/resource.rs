//! Resource requests attached to jobs.
//!
//! Specs express requests with the `!Cores`, `!Memory`, and `!License`
//! tags; the scheduler consumes the normalized [`ResourceSet`] triple.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::errors::{GatorError, GatorResult};

/// Unit for a `!Memory` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryUnit {
    KB,
    MB,
    GB,
    TB,
}

impl MemoryUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KB => "KB",
            Self::MB => "MB",
            Self::GB => "GB",
            Self::TB => "TB",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "KB" => Some(Self::KB),
            "MB" => Some(Self::MB),
            "GB" => Some(Self::GB),
            "TB" => Some(Self::TB),
            _ => None,
        }
    }

    pub fn bytes(&self) -> u64 {
        match self {
            Self::KB => 1_000,
            Self::MB => 1_000_000,
            Self::GB => 1_000_000_000,
            Self::TB => 1_000_000_000_000,
        }
    }
}

/// A single resource request from a job spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    Cores { count: u32 },
    Memory { size: u64, unit: MemoryUnit },
    License { name: String, count: u32 },
}

impl Resource {
    /// Validate a full request list: at most one `!Cores`, at most one
    /// `!Memory`, and no duplicated license names.
    pub fn check_list(resources: &[Resource]) -> GatorResult<()> {
        let mut cores = 0usize;
        let mut memory = 0usize;
        let mut licenses: BTreeMap<&str, usize> = BTreeMap::new();
        for resource in resources {
            match resource {
                Resource::Cores { .. } => cores += 1,
                Resource::Memory { .. } => memory += 1,
                Resource::License { name, .. } => *licenses.entry(name).or_default() += 1,
            }
        }
        if cores > 1 {
            return Err(GatorError::Spec(
                "more than one !Cores resource request".into(),
            ));
        }
        if memory > 1 {
            return Err(GatorError::Spec(
                "more than one !Memory resource request".into(),
            ));
        }
        for (name, count) in licenses {
            if count > 1 {
                return Err(GatorError::Spec(format!(
                    "more than one entry for license '{name}'"
                )));
            }
        }
        Ok(())
    }
}

/// Normalized view of a job's resource requests, as consumed by schedulers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub cores: u32,
    pub memory_bytes: u64,
    pub licenses: BTreeMap<String, u32>,
}

impl ResourceSet {
    pub fn from_requests(resources: &[Resource]) -> Self {
        let mut set = ResourceSet::default();
        for resource in resources {
            match resource {
                Resource::Cores { count } => set.cores = *count,
                Resource::Memory { size, unit } => set.memory_bytes = size * unit.bytes(),
                Resource::License { name, count } => {
                    *set.licenses.entry(name.clone()).or_default() += count;
                }
            }
        }
        set
    }
}
