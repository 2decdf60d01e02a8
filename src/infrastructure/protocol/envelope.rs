//! Message envelope codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default)]
    pub req_id: u64,
    #[serde(default)]
    pub posted: bool,
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    pub fn new(action: impl Into<String>, req_id: u64, posted: bool, payload: Value) -> Self {
        Self {
            action: action.into(),
            req_id,
            posted,
            payload,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A response envelope, distinguished from requests by `rsp_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Success {
        action: String,
        rsp_id: u64,
        payload: Value,
    },
    Error {
        rsp_id: u64,
        reason: String,
    },
}

impl Response {
    pub fn success(action: impl Into<String>, rsp_id: u64, payload: Value) -> Self {
        Self::Success {
            action: action.into(),
            rsp_id,
            payload,
        }
    }

    pub fn error(rsp_id: u64, reason: impl Into<String>) -> Self {
        Self::Error {
            rsp_id,
            reason: reason.into(),
        }
    }

    pub fn rsp_id(&self) -> u64 {
        match self {
            Self::Success { rsp_id, .. } | Self::Error { rsp_id, .. } => *rsp_id,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Either side of the conversation.
#[derive(Debug, Clone)]
pub enum Incoming {
    Request(Request),
    Response(Response),
}

/// A frame that could not be decoded. `req_id` is recovered on a best-effort
/// basis so the failure response still correlates when possible.
#[derive(Debug, Clone)]
pub struct DecodeError {
    pub req_id: u64,
    pub reason: String,
}

/// Decode one frame. The presence of `rsp_id` marks a response; everything
/// else must be a well-formed request.
pub fn decode(text: &str) -> Result<Incoming, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|err| DecodeError {
        req_id: 0,
        reason: format!("unparseable envelope: {err}"),
    })?;
    let req_id = value
        .get("req_id")
        .and_then(Value::as_u64)
        .unwrap_or_default();
    if value.get("rsp_id").is_some() {
        let response = serde_json::from_value(value).map_err(|err| DecodeError {
            req_id,
            reason: format!("malformed response: {err}"),
        })?;
        return Ok(Incoming::Response(response));
    }
    let request: Request = serde_json::from_value(value).map_err(|err| DecodeError {
        req_id,
        reason: format!("malformed request: {err}"),
    })?;
    Ok(Incoming::Request(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let request = Request::new("register", 7, false, json!({"ident": "a"}));
        let decoded = decode(&request.to_text()).unwrap();
        match decoded {
            Incoming::Request(req) => {
                assert_eq!(req.action, "register");
                assert_eq!(req.req_id, 7);
                assert!(!req.posted);
                assert_eq!(req.payload["ident"], "a");
            }
            Incoming::Response(_) => panic!("expected a request"),
        }
    }

    #[test]
    fn test_response_discriminated_by_rsp_id() {
        let text = Response::success("spec", 3, json!({"spec": "x"})).to_text();
        match decode(&text).unwrap() {
            Incoming::Response(Response::Success { rsp_id, .. }) => assert_eq!(rsp_id, 3),
            _ => panic!("expected a success response"),
        }

        let text = Response::error(9, "nope").to_text();
        match decode(&text).unwrap() {
            Incoming::Response(Response::Error { rsp_id, reason }) => {
                assert_eq!(rsp_id, 9);
                assert_eq!(reason, "nope");
            }
            _ => panic!("expected an error response"),
        }
    }

    #[test]
    fn test_missing_action_is_a_decode_error() {
        let err = decode("{\"req_id\": 5, \"payload\": {}}").unwrap_err();
        assert_eq!(err.req_id, 5);
        assert!(err.reason.contains("action"));
    }

    #[test]
    fn test_unparseable_json_is_a_decode_error() {
        let err = decode("not json").unwrap_err();
        assert_eq!(err.req_id, 0);
        assert!(err.reason.contains("unparseable"));
    }

    #[test]
    fn test_posted_defaults_false() {
        match decode("{\"action\": \"log\", \"payload\": {}}").unwrap() {
            Incoming::Request(req) => assert!(!req.posted),
            Incoming::Response(_) => panic!("expected a request"),
        }
    }
}
