use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parlor_broker::Broker;
use parlor_store::{Database, StoreError};
use parlor_telemetry::{LogQuery, SqliteLogSink};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{self, ApiError};
use crate::config::ServerConfig;
use crate::connection::{self, SocketTimers};
use crate::lookup::StoreIdentity;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LOG_QUERY: u32 = 1_000;

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub db: Database,
    pub config: Arc<ServerConfig>,
    /// Persisted warnings, when the log store is enabled.
    pub logs: Option<Arc<SqliteLogSink>>,
    /// One permit per live WebSocket, taken before the upgrade.
    connection_slots: Arc<Semaphore>,
}

impl AppState {
    /// Broker backed by the store for identity and room names.
    pub fn new(config: ServerConfig, db: Database) -> Self {
        let lookup = Arc::new(StoreIdentity::new(db.clone(), config.require_known_users));
        let broker = Broker::new(config.broker_config(), lookup);
        Self {
            broker,
            db,
            connection_slots: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            logs: None,
        }
    }

    /// Serve persisted logs on `/logs`.
    pub fn with_logs(mut self, logs: Option<Arc<SqliteLogSink>>) -> Self {
        self.logs = logs;
        self
    }

    /// WebSocket slots not currently taken.
    pub fn free_connection_slots(&self) -> usize {
        self.connection_slots.available_permits()
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/logs", get(logs_handler))
        .merge(api::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns once the listener is up.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    start_with_state(AppState::new(config, db)).await
}

/// [`start`] with prepared state, e.g. one carrying the log sink.
pub async fn start_with_state(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(state.config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    let broker = Arc::clone(&state.broker);

    let shutdown = CancellationToken::new();
    let mut tasks = broker.start_maintenance(shutdown.clone());

    let router = build_router(state);
    let serve_token = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_token.cancelled_owned())
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    }));

    info!(addr = %local_addr, "parlor server started");

    Ok(ServerHandle {
        port: local_addr.port(),
        broker,
        shutdown,
        tasks,
    })
}

/// Handle returned by [`start`]. Keeps background tasks alive until
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub port: u16,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Stop accepting connections, close every live one, and wait for the
    /// background tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let closed = self.broker.close_all();
        info!(
            closed_connections = closed,
            task_count = self.tasks.len(),
            "shutting down"
        );

        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}, some tasks may still be running");
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    // The permit travels with the upgrade and is released when the socket
    // task ends, or when the upgrade never completes.
    let Ok(permit) = Arc::clone(&state.connection_slots).try_acquire_owned() else {
        warn!(
            limit = state.config.max_connections,
            "connection limit reached, refusing upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            handle_socket(socket, state).await;
            drop(permit);
        })
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.broker.register();
    info!(connection_id = %connection_id, "websocket connected");

    let timers = SocketTimers {
        heartbeat_interval: state.config.heartbeat_interval(),
        write_timeout: state.config.write_timeout(),
    };
    connection::handle_ws_connection(socket, connection_id, rx, state.broker, timers).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, http_status) = match state.db.ping() {
        Ok(()) => ("healthy", StatusCode::OK),
        Err(e) => {
            warn!(error = %e, "health check: database unavailable");
            ("degraded", StatusCode::SERVICE_UNAVAILABLE)
        }
    };
    let body = json!({
        "status": status,
        "connections": state.broker.connection_count(),
        "rooms": state.broker.room_count(),
        "stats": state.broker.stats(),
    });
    (http_status, Json(body))
}

async fn logs_handler(
    State(state): State<AppState>,
    Query(mut query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(logs) = state.logs.as_ref() else {
        return Err(ApiError::NotFound("Log store is disabled".into()));
    };
    query.limit = Some(query.limit.unwrap_or(100).min(MAX_LOG_QUERY));
    let records = logs
        .query(&query)
        .map_err(|e| ApiError::Store(StoreError::from(e)))?;
    Ok(Json(records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn build_router_creates_routes() {
        let state = AppState::new(test_config(), Database::in_memory().unwrap());
        let _router = build_router(state);
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(test_config(), Database::in_memory().unwrap())
            .await
            .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["rooms"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_serving() {
        let handle = start(test_config(), Database::in_memory().unwrap())
            .await
            .unwrap();
        let url = format!("http://127.0.0.1:{}/health", handle.port);
        handle.shutdown().await;

        assert!(reqwest::get(&url).await.is_err());
    }

    #[tokio::test]
    async fn logs_route_serves_persisted_warnings() {
        use parlor_telemetry::SqliteLogLayer;
        use tracing_subscriber::layer::SubscriberExt;

        let path = std::env::temp_dir().join(format!("parlor-route-logs-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let sink = Arc::new(SqliteLogSink::new(&path).unwrap());
        let _subscriber = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink))),
        );

        let state = AppState::new(test_config(), Database::in_memory().unwrap())
            .with_logs(Some(Arc::clone(&sink)));
        let handle = start_with_state(state).await.unwrap();

        tracing::info_span!("connection", connection_id = "conn_logged").in_scope(|| {
            warn!("socket write timed out");
        });
        warn!("unrelated");

        let url = format!("http://127.0.0.1:{}/logs?connectionId=conn_logged", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        let records = body.as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], "socket write timed out");
        assert_eq!(records[0]["connectionId"], "conn_logged");

        handle.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn logs_route_without_sink_is_not_found() {
        let handle = start(test_config(), Database::in_memory().unwrap())
            .await
            .unwrap();
        let url = format!("http://127.0.0.1:{}/logs", handle.port);
        assert_eq!(reqwest::get(&url).await.unwrap().status(), 404);
        handle.shutdown().await;
    }

    #[test]
    fn connection_slots_match_limit() {
        let config = ServerConfig {
            max_connections: 3,
            ..test_config()
        };
        let state = AppState::new(config, Database::in_memory().unwrap());
        assert_eq!(state.free_connection_slots(), 3);
    }
}
