//! Child records held by a tier for each direct child.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::models::log::MetricMap;
use crate::domain::models::spec::JobSpec;

/// Lifecycle state of a child. States progress monotonically
/// PENDING -> LAUNCHED -> STARTED -> COMPLETE; an aborted child jumps
/// straight to COMPLETE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildState {
    Pending,
    Launched,
    Started,
    Complete,
}

impl ChildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Launched => "LAUNCHED",
            Self::Started => "STARTED",
            Self::Complete => "COMPLETE",
        }
    }

    /// Whether `next` is a legal forward transition from this state.
    pub fn can_transition_to(&self, next: ChildState) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Launched | Self::Complete),
            Self::Launched => matches!(next, Self::Started | Self::Complete),
            Self::Started => matches!(next, Self::Complete),
            Self::Complete => false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Launched | Self::Started)
    }
}

/// Terminal result of a child. Assigned exactly once, at the COMPLETE
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildResult {
    Unknown,
    Success,
    Failure,
    Aborted,
}

impl ChildResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Aborted => "ABORTED",
        }
    }
}

/// Everything a tier tracks about one direct child.
#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub ident: String,
    pub spec: JobSpec,
    pub state: ChildState,
    pub result: ChildResult,
    pub server_url: Option<String>,
    pub exit_code: Option<i32>,
    pub db_file: Option<String>,
    pub metrics: MetricMap,
    pub started_ts: Option<i64>,
    pub updated_ts: Option<i64>,
    pub completed_ts: Option<i64>,
}

impl ChildRecord {
    pub fn new(ident: impl Into<String>, spec: JobSpec) -> Self {
        Self {
            ident: ident.into(),
            spec,
            state: ChildState::Pending,
            result: ChildResult::Unknown,
            server_url: None,
            exit_code: None,
            db_file: None,
            metrics: BTreeMap::new(),
            started_ts: None,
            updated_ts: None,
            completed_ts: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == ChildState::Complete
    }

    /// Mark the child as handed to the scheduler.
    pub fn mark_launched(&mut self, now: i64) -> Result<(), String> {
        self.transition(ChildState::Launched)?;
        self.updated_ts = Some(now);
        Ok(())
    }

    /// Mark the child as registered, recording its server address.
    pub fn mark_started(&mut self, server_url: String, now: i64) -> Result<(), String> {
        self.transition(ChildState::Started)?;
        self.server_url = Some(server_url);
        self.started_ts = Some(now);
        self.updated_ts = Some(now);
        Ok(())
    }

    /// Mark the child complete with its reported result and exit code.
    pub fn mark_complete(&mut self, result: ChildResult, code: i32, now: i64) -> Result<(), String> {
        self.transition(ChildState::Complete)?;
        self.result = result;
        self.exit_code = Some(code);
        self.completed_ts = Some(now);
        self.updated_ts = Some(now);
        Ok(())
    }

    /// Abort a child that will never run (unmet dependencies, upstream stop,
    /// or a launch that failed). `code` is synthetic.
    pub fn mark_aborted(&mut self, code: i32, now: i64) -> Result<(), String> {
        self.transition(ChildState::Complete)?;
        self.result = ChildResult::Aborted;
        self.exit_code = Some(code);
        self.completed_ts = Some(now);
        self.updated_ts = Some(now);
        Ok(())
    }

    fn transition(&mut self, next: ChildState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "child '{}' cannot move from {} to {}",
                self.ident,
                self.state.as_str(),
                next.as_str()
            ));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::spec::Job;

    fn record() -> ChildRecord {
        ChildRecord::new(
            "a",
            JobSpec::Job(Job {
                ident: "a".into(),
                command: "true".into(),
                ..Job::default()
            }),
        )
    }

    #[test]
    fn test_full_lifecycle() {
        let mut rec = record();
        rec.mark_launched(1).unwrap();
        rec.mark_started("127.0.0.1:1234".into(), 2).unwrap();
        rec.mark_complete(ChildResult::Success, 0, 3).unwrap();
        assert!(rec.is_terminal());
        assert_eq!(rec.result, ChildResult::Success);
        assert_eq!(rec.exit_code, Some(0));
        assert_eq!(rec.started_ts, Some(2));
        assert_eq!(rec.completed_ts, Some(3));
    }

    #[test]
    fn test_abort_from_pending() {
        let mut rec = record();
        rec.mark_aborted(255, 1).unwrap();
        assert_eq!(rec.state, ChildState::Complete);
        assert_eq!(rec.result, ChildResult::Aborted);
        assert!(rec.started_ts.is_none());
    }

    #[test]
    fn test_no_backward_transitions() {
        let mut rec = record();
        rec.mark_launched(1).unwrap();
        rec.mark_complete(ChildResult::Failure, 1, 2).unwrap();
        assert!(rec.mark_started("x".into(), 3).is_err());
        assert!(rec.mark_complete(ChildResult::Success, 0, 4).is_err());
    }

    #[test]
    fn test_started_requires_launched() {
        let mut rec = record();
        assert!(rec.mark_started("x".into(), 1).is_err());
    }
}
