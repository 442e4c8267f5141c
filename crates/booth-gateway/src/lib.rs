pub mod access;
pub mod audit;
pub mod config;
pub mod db;
pub mod fees;
pub mod reaper;
pub mod rooms;
pub mod security;
pub mod signal;
pub mod state;
pub mod store;
pub mod web;

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{header, Method, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Args, GatewayConfig};
pub use state::AppState;

#[derive(Serialize)]
struct RuntimeMetrics {
    active_ws_connections: usize,
    joined_participants: usize,
    active_rooms: usize,
}

async fn runtime_metrics(state: &AppState) -> RuntimeMetrics {
    RuntimeMetrics {
        active_ws_connections: signal::active_ws_connections(),
        joined_participants: state.connections.read().await.len(),
        active_rooms: state.rooms.len().await,
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(runtime_metrics(&state).await))
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = runtime_metrics(&state).await;
    let active_sessions = db::count_active_sessions(&state.pool).await.unwrap_or(0);

    let prometheus_text = format!(
        r#"# HELP booth_gateway_websocket_connections Open signaling sockets
# TYPE booth_gateway_websocket_connections gauge
booth_gateway_websocket_connections {}
# HELP booth_gateway_participants Participants that completed a join
# TYPE booth_gateway_participants gauge
booth_gateway_participants {}
# HELP booth_gateway_rooms Rooms held in the realtime store
# TYPE booth_gateway_rooms gauge
booth_gateway_rooms {}
# HELP booth_gateway_active_sessions Session records still active
# TYPE booth_gateway_active_sessions gauge
booth_gateway_active_sessions {}
"#,
        metrics.active_ws_connections,
        metrics.joined_participants,
        metrics.active_rooms,
        active_sessions,
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prometheus_text,
    )
}

async fn global_api_rate_limit(req: Request<axum::body::Body>, next: middleware::Next) -> Response {
    let path = req.uri().path();
    if path == "/" || path == "/health" || path.starts_with("/metrics/") || path == "/ws" {
        return next.run(req).await;
    }

    let direct_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let client_ip = security::effective_client_ip(req.headers(), direct_addr);
    let key = format!("{}:{}:{}", req.method(), path, client_ip);
    if !security::allow_global_api_request(&key) {
        return web::error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }

    next.run(req).await
}

pub fn build_cors_layer() -> CorsLayer {
    let allow_origin = if security::cors_allow_any() {
        AllowOrigin::any()
    } else {
        let origins = security::cors_origin_values();
        if origins.is_empty() {
            tracing::warn!(
                "no valid CORS origins configured; cross-origin browser access will be blocked"
            );
        }
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// Every HTTP and WebSocket route of the gateway.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Virtual Booth Gateway Online" }))
        .route("/health", get(health))
        .route("/metrics/runtime", get(health))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .route("/webrtc/config", get(web::webrtc_config))
        .route("/sessions/:participant_id", get(web::get_session))
        .route("/api/actions", post(fees::handle_action))
        .route(
            "/access-codes",
            get(access::list_codes).post(access::issue_code),
        )
        .route("/access-codes/validate", post(access::validate_code))
        .route("/ws", get(signal::ws_handler))
        .layer(middleware::from_fn(global_api_rate_limit))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
