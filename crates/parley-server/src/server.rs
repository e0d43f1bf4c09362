//! `ParleyServer`: axum HTTP + WebSocket surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use parley_core::ids::ConversationId;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{ANY_ORIGIN, ServerConfig};
use crate::errors::ManagerError;
use crate::health::{self, HealthResponse};
use crate::manager::ConnectionManager;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket;

/// CORS for the HTTP routes, restricted to the configured origins.
///
/// Preflights from any other origin get no `Access-Control-Allow-Origin`, so
/// browsers refuse the cross-site call.
fn cors_layer(config: &ServerConfig) -> CorsLayer {
    if config.allowed_origins.iter().any(|origin| origin == ANY_ORIGIN) {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring malformed allowed origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The connection manager.
    pub manager: Arc<ConnectionManager>,
    /// HTTP surface configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The Parley relay server.
pub struct ParleyServer {
    config: Arc<ServerConfig>,
    manager: Arc<ConnectionManager>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl ParleyServer {
    /// Create a new server over `manager`.
    pub fn new(config: ServerConfig, manager: Arc<ConnectionManager>) -> Self {
        Self {
            config: Arc::new(config),
            manager,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: Arc::clone(&self.manager),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws/sessions", get(sessions_handler))
            .route("/ws/init/{identity}", get(init_handler))
            .route("/ws/{identity}", get(ws_handler))
            .route("/ws/{identity}/terminate", post(terminate_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&self.config))
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(error) = served {
                warn!(%error, "http server stopped with error");
            }
        });
        info!(%addr, "parley listening");
        Ok((addr, handle))
    }

    /// Get the connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = &state.manager;
    Json(health::health_check(
        state.start_time,
        manager.connection_count(),
        manager.session_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws/sessions
async fn sessions_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "sessions": state.manager.identities() }))
}

/// GET /ws/init/{identity}: may this identity connect now?
async fn init_handler(State(state): State<AppState>, Path(identity): Path<String>) -> Response {
    let identity = ConversationId::from_string(identity);
    match state.manager.preflight(&identity).await {
        Ok(()) => Json(json!({ "result": "success" })).into_response(),
        Err(error) => {
            info!(%identity, %error, "connection pre-check refused");
            (StatusCode::CONFLICT, Json(json!({ "result": "fail", "error": error.to_string() }))).into_response()
        }
    }
}

/// GET /ws/{identity}: upgrade and admit.
async fn ws_handler(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        warn!(%identity, origin = origin.unwrap_or_default(), "upgrade refused: origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let identity = ConversationId::from_string(identity);
    if let Err(error) = state.manager.check_existing(&identity).await {
        warn!(%identity, %error, "upgrade refused: prior session still present");
        return (StatusCode::CONFLICT, error.to_string()).into_response();
    }

    let manager = Arc::clone(&state.manager);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| websocket::accept(socket, identity, manager))
}

/// POST /ws/{identity}/terminate
async fn terminate_handler(State(state): State<AppState>, Path(identity): Path<String>) -> Response {
    let identity = ConversationId::from_string(identity);
    match state.manager.terminate(&identity).await {
        Ok(evicted) => Json(json!({ "result": "success", "evicted": evicted })).into_response(),
        Err(ManagerError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(error) => {
            warn!(%identity, %error, "terminate failed");
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use parley_core::conversation::{Conversation, ConversationStatus};
    use parley_store::ConversationStore;
    use tower::ServiceExt;

    use crate::test_support::{Fixture, admit, fixture};

    fn make_server(fx: &Fixture) -> ParleyServer {
        ParleyServer::new(ServerConfig::default(), Arc::clone(&fx.manager))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn health_counts_sessions() {
        let fx = fixture();
        let server = make_server(&fx);
        let (_session, _rx) = admit(&fx.manager, "chat-1").await;

        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 1);
        assert_eq!(body["active_sessions"], 1);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let fx = fixture();
        let (status, _) = get_json(make_server(&fx).router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sessions_lists_identities() {
        let fx = fixture();
        let (_b, _rx_b) = admit(&fx.manager, "b").await;
        let (_a, _rx_a) = admit(&fx.manager, "a").await;

        let (status, body) = get_json(make_server(&fx).router(), "/ws/sessions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn init_succeeds_for_a_free_identity() {
        let fx = fixture();
        let (status, body) = get_json(make_server(&fx).router(), "/ws/init/chat-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "success");
    }

    #[tokio::test]
    async fn init_refuses_a_terminated_conversation() {
        let fx = fixture();
        let mut conversation = Conversation::new(ConversationId::from("chat-1"));
        conversation.terminate();
        fx.store.create(&conversation).await.unwrap();

        let (status, body) = get_json(make_server(&fx).router(), "/ws/init/chat-1").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["result"], "fail");
        assert_eq!(body["error"], "conversation 'chat-1' is terminated");
    }

    #[tokio::test]
    async fn init_refuses_while_a_session_lingers() {
        let fx = fixture();
        let (_session, _rx) = admit(&fx.manager, "chat-1").await;
        let (status, body) = get_json(make_server(&fx).router(), "/ws/init/chat-1").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["result"], "fail");
    }

    #[tokio::test]
    async fn foreign_origin_is_forbidden() {
        let fx = fixture();
        let config = ServerConfig {
            allowed_origins: vec!["http://localhost:3000".into()],
            ..ServerConfig::default()
        };
        let app = ParleyServer::new(config, Arc::clone(&fx.manager)).router();
        let req = Request::builder()
            .uri("/ws/chat-1")
            .header(header::ORIGIN, "https://evil.example")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(fx.manager.session_count(), 0);
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/ws/chat-1/terminate")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn cors_preflight_follows_allowed_origins() {
        let fx = fixture();
        let config = ServerConfig {
            allowed_origins: vec!["http://localhost:3000".into()],
            ..ServerConfig::default()
        };
        let app = ParleyServer::new(config, Arc::clone(&fx.manager)).router();

        let resp = app.clone().oneshot(preflight("https://evil.example")).await.unwrap();
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

        let resp = app.oneshot(preflight("http://localhost:3000")).await.unwrap();
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:3000"
        );
    }

    #[tokio::test]
    async fn wildcard_origin_keeps_cors_permissive() {
        let fx = fixture();
        let resp = make_server(&fx)
            .router()
            .oneshot(preflight("https://anywhere.example"))
            .await
            .unwrap();
        assert_eq!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[tokio::test]
    async fn plain_get_on_socket_route_is_rejected() {
        let fx = fixture();
        let (status, _) = get_json(make_server(&fx).router(), "/ws/chat-1").await;
        assert!(status.is_client_error());
        assert_eq!(fx.manager.session_count(), 0);
    }

    #[tokio::test]
    async fn terminate_evicts_and_reports() {
        let fx = fixture();
        let (session, _rx) = admit(&fx.manager, "chat-1").await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/ws/chat-1/terminate")
            .body(Body::empty())
            .unwrap();
        let resp = make_server(&fx).router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(session.is_closed());

        let stored = fx.store.get(&ConversationId::from("chat-1")).await.unwrap().unwrap();
        assert_eq!(stored.status, ConversationStatus::Terminated);
    }

    #[tokio::test]
    async fn terminate_unknown_is_not_found() {
        let fx = fixture();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/ws/ghost/terminate")
            .body(Body::empty())
            .unwrap();
        let resp = make_server(&fx).router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_an_ephemeral_port_and_stops_on_shutdown() {
        let fx = fixture();
        let server = make_server(&fx);
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
