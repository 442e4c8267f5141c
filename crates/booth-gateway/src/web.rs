use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::warn;

use crate::config::GatewayConfig;
use crate::db::{self, SessionRecord};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct IceServer {
    pub urls: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcConfigResponse {
    pub success: bool,
    pub ice_servers: Vec<IceServer>,
    pub ws_signaling_url: String,
}

pub fn ws_signaling_url(config: &GatewayConfig) -> String {
    config
        .ws_signaling_url
        .clone()
        .unwrap_or_else(|| "ws://localhost:3000/ws".to_string())
}

/// `GET /webrtc/config`: everything a participant needs before joining.
pub async fn webrtc_config(State(config): State<Arc<GatewayConfig>>) -> impl IntoResponse {
    Json(WebRtcConfigResponse {
        success: true,
        ice_servers: config
            .ice_urls
            .iter()
            .map(|url| IceServer { urls: url.clone() })
            .collect(),
        ws_signaling_url: ws_signaling_url(&config),
    })
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    success: bool,
    session: SessionRecord,
}

/// `GET /sessions/:participant_id`
pub async fn get_session(
    State(pool): State<SqlitePool>,
    Path(participant_id): Path<String>,
) -> impl IntoResponse {
    if participant_id.is_empty() || participant_id.len() > 64 {
        return error_response(StatusCode::BAD_REQUEST, "Invalid participant id");
    }
    match db::get_session(&pool, &participant_id).await {
        Ok(Some(session)) => Json(SessionResponse {
            success: true,
            session,
        })
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Session not found"),
        Err(err) => {
            warn!("session lookup failed for {}: {}", participant_id, err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Session lookup failed")
        }
    }
}
