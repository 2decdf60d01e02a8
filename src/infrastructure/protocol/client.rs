//! Websocket client endpoint.
//!
//! Used for the one upward connection each supervisor keeps to its parent,
//! and for short-lived downward connections a tier opens to a child's
//! server when forwarding `stop` or assembling `get_tree`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::domain::errors::{GatorError, GatorResult};
use crate::domain::ports::ActionHandler;
use crate::infrastructure::protocol::envelope::{self, Incoming, Request, Response};
use crate::infrastructure::protocol::router;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

pub struct WsClient {
    outgoing: mpsc::Sender<Message>,
    pending: PendingMap,
    next_req: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsClient {
    /// Connect to `ws://address/`. Inbound requests on this connection are
    /// serviced through `handler` when one is supplied.
    pub async fn connect(
        address: &str,
        handler: Option<Arc<dyn ActionHandler>>,
    ) -> GatorResult<Self> {
        let url = normalize_url(address);
        let (stream, _) = connect_async(&url)
            .await
            .map_err(|err| GatorError::Transport(format!("connect to {url} failed: {err}")))?;
        let (sink, source) = stream.split();

        let (outgoing, outgoing_rx) = mpsc::channel::<Message>(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(write_loop(sink, outgoing_rx));
        let reader = tokio::spawn(read_loop(
            source,
            pending.clone(),
            handler,
            outgoing.clone(),
        ));

        Ok(Self {
            outgoing,
            pending,
            next_req: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    /// Connect with bounded exponential backoff: `initial` delay doubling up
    /// to `cap`, for at most `attempts` tries.
    pub async fn connect_with_backoff(
        address: &str,
        handler: Option<Arc<dyn ActionHandler>>,
        attempts: u32,
        initial: Duration,
        cap: Duration,
    ) -> GatorResult<Self> {
        let mut delay = initial;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match Self::connect(address, handler.clone()).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    debug!(attempt, %err, "upward connect failed, backing off");
                    last_error = Some(err);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(cap);
            }
        }
        Err(last_error
            .unwrap_or_else(|| GatorError::Transport("no connection attempts made".into())))
    }

    /// Send a non-posted request and await the correlated response.
    pub async fn call(&self, action: &str, payload: Value, timeout: Duration) -> GatorResult<Value> {
        let req_id = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(req_id, tx);

        let frame = Request::new(action, req_id, false, payload).to_text();
        if self.outgoing.send(Message::text(frame)).await.is_err() {
            self.pending.lock().await.remove(&req_id);
            return Err(GatorError::Transport("connection closed".into()));
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(GatorError::Transport("connection closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&req_id);
                return Err(GatorError::Transport(format!(
                    "timed out waiting for '{action}' response"
                )));
            }
        };
        match response {
            Response::Success { payload, .. } => Ok(payload),
            Response::Error { reason, .. } => Err(GatorError::Protocol(format!(
                "peer rejected '{action}': {reason}"
            ))),
        }
    }

    /// Send a posted request; no response is expected.
    pub async fn post(&self, action: &str, payload: Value) -> GatorResult<()> {
        let frame = Request::new(action, 0, true, payload).to_text();
        self.outgoing
            .send(Message::text(frame))
            .await
            .map_err(|_| GatorError::Transport("connection closed".into()))
    }

    pub async fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None)).await;
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Connect, issue one non-posted request, and tear the connection down.
pub async fn request_once(
    address: &str,
    action: &str,
    payload: Value,
    timeout: Duration,
) -> GatorResult<Value> {
    let client = WsClient::connect(address, None).await?;
    let result = client.call(action, payload, timeout).await;
    client.close().await;
    result
}

/// Connect, fire one posted request, and tear the connection down.
pub async fn post_once(address: &str, action: &str, payload: Value) -> GatorResult<()> {
    let client = WsClient::connect(address, None).await?;
    let result = client.post(action, payload).await;
    client.close().await;
    result
}

fn normalize_url(address: &str) -> String {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("ws://{address}/")
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    pending: PendingMap,
    handler: Option<Arc<dyn ActionHandler>>,
    outgoing: mpsc::Sender<Message>,
) {
    while let Some(frame) = source.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, "client receive failed");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        // Responses complete an outstanding call; requests are routed.
        match envelope::decode(text.as_str()) {
            Ok(Incoming::Response(response)) => {
                let waiter = pending.lock().await.remove(&response.rsp_id());
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(rsp_id = response.rsp_id(), "response without a caller"),
                }
            }
            Ok(Incoming::Request(_)) | Err(_) => {
                if let Some(handler) = &handler {
                    if let Some(reply) = router::dispatch(handler.as_ref(), text.as_str()).await {
                        if outgoing.send(Message::text(reply)).await.is_err() {
                            break;
                        }
                    }
                } else {
                    warn!("unsolicited request on a client-only connection");
                }
            }
        }
    }

    // Fail any calls that will never be answered.
    let mut pending = pending.lock().await;
    pending.clear();
}
