//! Adapters: replaceable implementations of the domain ports.

pub mod scheduler;
