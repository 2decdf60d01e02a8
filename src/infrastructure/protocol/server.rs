//! Websocket endpoint server.
//!
//! Each tier and wrapper binds exactly one server on an ephemeral local
//! port; all actions share the single `/` route.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::errors::{GatorError, GatorResult};
use crate::domain::ports::ActionHandler;
use crate::infrastructure::protocol::router;

pub struct WsServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WsServer {
    /// Bind on an ephemeral local port and start serving.
    pub async fn bind(handler: Arc<dyn ActionHandler>) -> GatorResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|err| GatorError::Transport(format!("failed to bind server: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| GatorError::Transport(format!("no local address: {err}")))?;

        let app = Router::new().route("/", get(upgrade)).with_state(handler);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = serve.await {
                warn!(%err, "websocket server stopped abnormally");
            }
        });

        debug!(%local_addr, "websocket server listening");
        Ok(Self {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    /// The bound `host:port`, as sent in `register` payloads.
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    /// The full `ws://host:port/` URL.
    pub fn url(&self) -> String {
        format!("ws://{}/", self.local_addr)
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn upgrade(
    State(handler): State<Arc<dyn ActionHandler>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection(socket, handler))
}

async fn connection(mut socket: WebSocket, handler: Arc<dyn ActionHandler>) {
    while let Some(frame) = socket.recv().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, "websocket receive failed");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                if let Some(reply) = router::dispatch(handler.as_ref(), text.as_str()).await {
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            // Pings are answered by the transport layer.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }
}
