//! Typed payloads for the protocol actions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::models::{ChildResult, ChildState, MetricMap, Severity};

/// Action names shared by both roles and the role-specific extensions.
pub mod action {
    pub const LOG: &str = "log";
    pub const STOP: &str = "stop";
    pub const IDENTIFY: &str = "identify";
    pub const GET_MESSAGES: &str = "get_messages";
    // Tier only.
    pub const SPEC: &str = "spec";
    pub const REGISTER: &str = "register";
    pub const UPDATE: &str = "update";
    pub const COMPLETE: &str = "complete";
    pub const CHILDREN: &str = "children";
    pub const GET_TREE: &str = "get_tree";
    // Wrapper only.
    pub const METRIC: &str = "metric";
}

/// `log`: a captured log line travelling upward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub timestamp: i64,
    pub severity: Severity,
    pub message: String,
}

/// `register`: a freshly started child announcing its server address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub ident: String,
    /// `host:port` of the child's own websocket server.
    pub server: String,
}

/// `spec` request: a child asking for its specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecPayload {
    pub ident: String,
}

/// `spec` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecReply {
    /// YAML serialization of the child's spec node.
    pub spec: String,
}

/// `update`: periodic metric snapshot from a child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub ident: String,
    pub metrics: MetricMap,
}

/// `complete`: a child's terminal report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePayload {
    pub ident: String,
    pub result: ChildResult,
    pub code: i32,
    pub metrics: MetricMap,
    /// Path of the reporter's store file, surfaced for archival.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_file: Option<String>,
}

/// `metric`: a user-reported metric for the wrapper's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPayload {
    pub name: String,
    pub value: i64,
}

/// One entry of the `children` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSummary {
    pub state: ChildState,
    pub result: ChildResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub metrics: MetricMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// `children` reply: ident -> summary.
pub type ChildrenReply = BTreeMap<String, ChildSummary>;

/// `get_messages` request: a uid cursor plus page size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMessagesPayload {
    #[serde(default)]
    pub after: i64,
    #[serde(default = "default_message_limit")]
    pub limit: i64,
}

fn default_message_limit() -> i64 {
    10
}

/// One message of the `get_messages` reply. Severity travels as its
/// canonical numeric value here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMessage {
    pub uid: i64,
    pub severity: i64,
    pub message: String,
    pub timestamp: i64,
}

/// `get_messages` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMessagesReply {
    pub messages: Vec<ApiMessage>,
    pub total: i64,
    /// Whether the job is still running (messages may still be appended).
    pub live: bool,
}

/// `identify` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyReply {
    pub tool: String,
    pub version: String,
}

impl IdentifyReply {
    pub fn current() -> Self {
        Self {
            tool: "gator".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
