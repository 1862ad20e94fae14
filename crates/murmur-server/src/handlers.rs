//! HTTP and WebSocket handlers for the Murmur server.
//!
//! WebSocket connections are handed to the [`ConnectionLifecycle`]; the
//! remaining routes are read-only views of history, activity and presence.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use murmur_broker::Broker;
use murmur_core::{
    ActivityRecord, BroadcastHub, ChatStore, ConnectionLifecycle, ConnectionRegistry,
    MessageBridge, PresenceTracker, StoredMessage,
};
use murmur_protocol::OnlineSet;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Records returned by the listing endpoints.
const LISTING_LIMIT: usize = 50;

/// How often hub counters are exported.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Fan-out to attached clients.
    pub hub: BroadcastHub,
    /// Who is online.
    pub presence: Arc<PresenceTracker>,
    /// Chat history and activity.
    pub store: Arc<dyn ChatStore>,
    /// Relay to and from the broker.
    pub bridge: Arc<MessageBridge>,
    /// Attach/run/detach of client connections.
    pub lifecycle: Arc<ConnectionLifecycle>,
}

impl AppState {
    /// Wire up the hub components.
    ///
    /// Must be called from within a tokio runtime. The bridge is not
    /// started; spawn it with the broker's event stream.
    #[must_use]
    pub fn new(config: Config, broker: Arc<dyn Broker>, store: Arc<dyn ChatStore>) -> Self {
        let hub = BroadcastHub::spawn(Arc::new(ConnectionRegistry::new()));
        let presence = Arc::new(PresenceTracker::new());
        let bridge = Arc::new(MessageBridge::new(
            broker,
            hub.clone(),
            Arc::clone(&presence),
            Arc::clone(&store),
            config.broker.topics.clone(),
        ));
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            hub.clone(),
            Arc::clone(&bridge),
            Arc::clone(&store),
            config.lifecycle(),
        ));

        Self {
            config,
            hub,
            presence,
            store,
            bridge,
            lifecycle,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/messages", get(messages_handler))
        .route("/activity", get(activity_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = &state.config;

    // Start metrics server if enabled
    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => {
                tokio::spawn(report_hub_stats(Arc::clone(&state)));
            }
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Murmur server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    serve(listener, state).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn report_hub_stats(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        interval.tick().await;
        metrics::record_hub_stats(state.hub.stats());
        metrics::set_users_online(state.presence.len());
    }
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Username to attach as; a guest name is assigned when absent.
    pub username: Option<String>,
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.registry().len(),
        "online": state.presence.len(),
    }))
}

/// Recent chat history, newest first.
async fn messages_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StoredMessage>>, (StatusCode, String)> {
    state
        .store
        .recent_messages(LISTING_LIMIT)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "Failed to load messages");
            metrics::record_error("store");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load messages".to_string())
        })
}

/// Recent presence activity, newest first.
async fn activity_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ActivityRecord>>, (StatusCode, String)> {
    state
        .store
        .recent_activity(LISTING_LIMIT)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "Failed to load activity");
            metrics::record_error("store");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load activity".to_string())
        })
}

/// Who is online right now.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<OnlineSet> {
    Json(state.presence.snapshot())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let connections = state.hub.registry().len();
    if connections >= state.config.limits.max_connections {
        warn!(connections, "Connection limit reached, refusing upgrade");
        metrics::record_rejected();
        return (StatusCode::SERVICE_UNAVAILABLE, "Server at capacity").into_response();
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, params.username, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, username: Option<String>, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let session = state.lifecycle.attach(username.as_deref()).await;
    let client = session.handle.id();
    debug!(client, username = %session.handle.username(), "WebSocket connected");

    let (sender, receiver) = socket.split();

    let sink = sender.with(|payload: Bytes| {
        metrics::record_message(payload.len(), "outbound");
        future::ready(
            String::from_utf8(payload.to_vec())
                .map(Message::Text)
                .map_err(axum::Error::new),
        )
    });

    // Ping/pong is answered by axum; only data frames reach the lifecycle
    let stream = receiver
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(move |msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => {
                    metrics::record_message(text.len(), "inbound");
                    Some(Ok(text))
                }
                Ok(Message::Binary(data)) => {
                    metrics::record_message(data.len(), "inbound");
                    match String::from_utf8(data) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            warn!(client, "Discarding non-UTF-8 binary frame");
                            None
                        }
                    }
                }
                Ok(_) => None,
                Err(e) => {
                    metrics::record_error("websocket");
                    Some(Err(e))
                }
            })
        });

    state.lifecycle.run(session, sink, stream).await;

    debug!(client, "WebSocket disconnected");
}
