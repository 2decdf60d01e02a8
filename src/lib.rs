//! Gator - hierarchical shell-job runner.
//!
//! A declarative job tree is executed as an overlay tree of supervisor
//! processes: tiers manage groups and arrays of children, wrappers manage a
//! single leaf job, and every process talks to its parent over a JSON
//! websocket protocol.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{GatorError, GatorResult};
pub use infrastructure::config::{Config, ConfigLoader};
