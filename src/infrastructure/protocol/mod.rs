//! Bidirectional JSON websocket protocol.
//!
//! Every frame is one JSON envelope. Requests carry `action`/`req_id`/
//! `posted`/`payload`; responses correlate by `rsp_id` and carry either a
//! success payload or an error reason. `posted = true` suppresses the
//! success response; failure responses are always emitted.

pub mod client;
pub mod envelope;
pub mod messages;
pub mod router;
pub mod server;

pub use client::WsClient;
pub use envelope::{Incoming, Request, Response};
pub use server::WsServer;
