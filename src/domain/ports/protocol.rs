//! Action handler port.
//!
//! Tiers and wrappers expose the same websocket surface; the endpoint layer
//! routes decoded envelopes into whichever of the two is running in this
//! process.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::GatorResult;

/// Services one protocol action and returns the success payload.
///
/// Errors are rendered into `{"result": "error"}` envelopes by the caller;
/// the connection stays open.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &str, payload: Value) -> GatorResult<Value>;
}
