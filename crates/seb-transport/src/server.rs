//! HTTP transport server using Axum.
//!
//! Decodes JSON-RPC 2.0 requests from `POST /rpc`, hands them to the
//! session server, and encodes the result. Server notifications fan out to
//! `GET /events` subscribers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::State,
    response::{
        IntoResponse, Json,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::stream::{self, Stream};
use seb_protocol::{RequestId, RpcError, RpcNotification, RpcResponse};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Trait implemented by the session server to handle incoming requests.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a JSON-RPC request and return its result.
    fn handle_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> impl std::future::Future<Output = seb_protocol::HandlerResult> + Send;
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Enable permissive CORS
    pub enable_cors: bool,
    /// Log every request at debug level
    pub verbose_logging: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            hostname: "127.0.0.1".into(),
            enable_cors: false,
            verbose_logging: false,
        }
    }
}

/// Shared state for the transport server.
struct AppState<H: RequestHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    /// Broadcast channel for notifications (server → all subscribers)
    notification_tx: broadcast::Sender<String>,
    /// Requests served (for health check)
    request_count: AtomicU64,
}

/// The transport server — owns the listener task.
pub struct TransportServer {
    /// Broadcast sender for notifications
    notification_tx: broadcast::Sender<String>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Start the transport server with the given request handler.
    pub async fn start<H: RequestHandler>(
        config: TransportConfig,
        handler: H,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let (notification_tx, _) = broadcast::channel(1024);
        Self::start_with_sender(config, Arc::new(handler), notification_tx).await
    }

    /// Start the transport server with a pre-existing broadcast channel.
    /// Accepts `Arc<H>` so the handler can be shared with the scheduler.
    pub async fn start_with_sender<H: RequestHandler>(
        config: TransportConfig,
        handler: Arc<H>,
        notification_tx: broadcast::Sender<String>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let state = Arc::new(AppState {
            handler,
            config: config.clone(),
            notification_tx: notification_tx.clone(),
            request_count: AtomicU64::new(0),
        });

        let mut app = Router::new()
            .route("/rpc", post(rpc_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .route("/events", get(events_handler::<H>))
            .with_state(state);
        if config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("SEB session transport listening on http://{}:{}/rpc", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
            {
                warn!("Transport server error: {}", e);
            }
        });

        Ok(Self {
            notification_tx,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Broadcast a notification to all event-stream subscribers.
    pub fn broadcast(&self, notification: RpcNotification) {
        if let Ok(json) = serde_json::to_string(&notification) {
            // No subscribers is fine
            let _ = self.notification_tx.send(json);
        }
    }

    /// Get the notification sender for external use.
    pub fn notification_sender(&self) -> broadcast::Sender<String> {
        self.notification_tx.clone()
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("SEB session transport stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn rpc_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
    body: String,
) -> impl IntoResponse {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    Json(handle_message(&body, &state).await)
}

async fn health_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "requests": state.request_count.load(Ordering::Relaxed),
        "subscribers": state.notification_tx.receiver_count(),
    }))
}

async fn events_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.notification_tx.subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(json) => return Some((Ok(Event::default().data(json)), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, {} notifications dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON-RPC decoding
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_message<H: RequestHandler>(text: &str, state: &AppState<H>) -> RpcResponse {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return RpcResponse::error(None, RpcError::parse_error("Failed to parse JSON")),
    };

    // Validate JSON-RPC shape
    let jsonrpc = parsed.get("jsonrpc").and_then(|v| v.as_str());
    let id: Option<RequestId> = parsed.get("id").cloned().and_then(|v| serde_json::from_value(v).ok());
    let method = match parsed.get("method").and_then(|v| v.as_str()) {
        Some(method) if jsonrpc == Some("2.0") => method,
        _ => return RpcResponse::error(id, RpcError::invalid_request("Invalid JSON-RPC 2.0 request")),
    };
    let params = parsed.get("params").cloned();

    if state.config.verbose_logging {
        debug!("-> {} {:?}", method, id);
    }

    // Route to handler
    match state.handler.handle_request(method, params).await {
        Ok(result) => RpcResponse::success(id.unwrap_or(RequestId::Number(0)), result),
        Err(err) => {
            if state.config.verbose_logging {
                debug!("<- {} failed: {}", method, err);
            }
            RpcResponse::error(id, err)
        }
    }
}
