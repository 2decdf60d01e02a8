//! Envelope dispatch.
//!
//! Shared by the server and client halves of an endpoint: decode one frame,
//! service it through the process's [`ActionHandler`], and produce the reply
//! frame if one is due.

use serde_json::Value;
use tracing::warn;

use crate::domain::ports::ActionHandler;
use crate::infrastructure::protocol::envelope::{self, Incoming, Request, Response};
use crate::infrastructure::protocol::messages::{action, IdentifyReply};

/// Dispatch one inbound text frame. Returns the serialized reply frame, if
/// any is owed to the peer.
///
/// Decode failures always produce an error response, even for frames that
/// might have been posted. Handler failures produce an error response and
/// leave the connection open.
pub async fn dispatch(handler: &dyn ActionHandler, text: &str) -> Option<String> {
    let request = match envelope::decode(text) {
        Ok(Incoming::Request(request)) => request,
        Ok(Incoming::Response(response)) => {
            warn!(rsp_id = response.rsp_id(), "dropping uncorrelated response");
            return None;
        }
        Err(err) => {
            return Some(Response::error(err.req_id, err.reason).to_text());
        }
    };
    service(handler, request).await.map(|reply| reply.to_text())
}

async fn service(handler: &dyn ActionHandler, request: Request) -> Option<Response> {
    let Request {
        action,
        req_id,
        posted,
        payload,
    } = request;

    if action == action::IDENTIFY {
        let payload = serde_json::to_value(IdentifyReply::current()).unwrap_or(Value::Null);
        return reply_success(&action, req_id, posted, payload);
    }

    match handler.handle(&action, payload).await {
        Ok(payload) => reply_success(&action, req_id, posted, payload),
        Err(err) => {
            warn!(%action, %err, "action failed");
            Some(Response::error(req_id, err.to_string()))
        }
    }
}

fn reply_success(action: &str, req_id: u64, posted: bool, payload: Value) -> Option<Response> {
    if posted {
        None
    } else {
        Some(Response::success(action, req_id, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{GatorError, GatorResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl ActionHandler for EchoHandler {
        async fn handle(&self, action: &str, payload: Value) -> GatorResult<Value> {
            match action {
                "echo" => Ok(payload),
                other => Err(GatorError::Protocol(format!("unknown action '{other}'"))),
            }
        }
    }

    #[tokio::test]
    async fn test_non_posted_request_gets_success() {
        let frame = Request::new("echo", 4, false, json!({"x": 1})).to_text();
        let reply = dispatch(&EchoHandler, &frame).await.unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["result"], "success");
        assert_eq!(parsed["rsp_id"], 4);
        assert_eq!(parsed["payload"]["x"], 1);
    }

    #[tokio::test]
    async fn test_posted_request_is_silent_on_success() {
        let frame = Request::new("echo", 0, true, json!({})).to_text();
        assert!(dispatch(&EchoHandler, &frame).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_action_gets_error() {
        let frame = Request::new("nope", 8, false, json!({})).to_text();
        let reply = dispatch(&EchoHandler, &frame).await.unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["result"], "error");
        assert_eq!(parsed["rsp_id"], 8);
    }

    #[tokio::test]
    async fn test_undecodable_posted_frame_still_gets_error() {
        let reply = dispatch(&EchoHandler, "{\"posted\": true}").await.unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["result"], "error");
    }

    #[tokio::test]
    async fn test_identify_reports_tool_and_version() {
        let frame = Request::new("identify", 1, false, json!({})).to_text();
        let reply = dispatch(&EchoHandler, &frame).await.unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["payload"]["tool"], "gator");
    }
}
