//! Access-code issue, listing and redemption endpoints.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Json, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use booth_common::{access_code, now_ms, AgentInfo};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::audit::{self, AuditContext, AuditEvent};
use crate::db::{self, AccessCodeRecord};
use crate::security;
use crate::state::AppState;
use crate::web::error_response;

const ISSUE_ATTEMPTS: usize = 8;
const MAX_AGENT_ID_LEN: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCodeRequest {
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub agent_title: Option<String>,
    #[serde(default)]
    pub single_use: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCodeResponse {
    pub success: bool,
    pub code: String,
    pub expires_at: i64,
    pub agent: AgentInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCodesQuery {
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct ListCodesResponse {
    pub success: bool,
    pub codes: Vec<AccessCodeRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateCodeRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateCodeResponse {
    pub success: bool,
    pub valid: bool,
    pub code: String,
    pub demo: bool,
    pub agent: AgentInfo,
}

fn is_valid_agent_id(agent_id: &str) -> bool {
    !agent_id.is_empty()
        && agent_id.len() <= MAX_AGENT_ID_LEN
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

fn actor_hash(headers: &HeaderMap, addr: SocketAddr) -> String {
    security::hash_ip(security::effective_client_ip(headers, addr))
}

/// `POST /access-codes`
pub async fn issue_code(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<IssueCodeRequest>,
) -> impl IntoResponse {
    let agent_id = req.agent_id.trim();
    if !is_valid_agent_id(agent_id) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid agent id");
    }

    let existing = match db::get_agent(&state.pool, agent_id).await {
        Ok(agent) => agent,
        Err(err) => {
            warn!("agent lookup failed for {}: {}", agent_id, err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Agent lookup failed");
        }
    };
    let name = req
        .agent_name
        .as_deref()
        .map(|name| security::sanitize_text(name, 64))
        .filter(|name| !name.is_empty())
        .or_else(|| existing.as_ref().map(|agent| agent.name.clone()))
        .unwrap_or_else(|| "Agent".to_string());
    let title = req
        .agent_title
        .as_deref()
        .map(|title| security::sanitize_text(title, 64))
        .filter(|title| !title.is_empty())
        .or_else(|| existing.as_ref().map(|agent| agent.title.clone()))
        .unwrap_or_else(|| AgentInfo::demo().title);
    let agent = AgentInfo {
        id: agent_id.to_string(),
        avatar: AgentInfo::initials(&name),
        name,
        title,
    };
    if let Err(err) = db::upsert_agent(&state.pool, &agent).await {
        warn!("agent upsert failed for {}: {}", agent_id, err);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save agent");
    }

    let now = now_ms();
    let expires_at = now + state.config.access_code_ttl.as_millis() as i64;
    for _ in 0..ISSUE_ATTEMPTS {
        let code = access_code::generate(&mut rand::thread_rng());
        if state.config.is_demo_code(&code) {
            continue;
        }
        let record = AccessCodeRecord {
            code: code.clone(),
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            created_at: now,
            expires_at,
            used: false,
            used_at: None,
            single_use: req.single_use,
            status: "active".to_string(),
        };
        match db::insert_access_code(&state.pool, &record).await {
            Ok(true) => {
                let actor = actor_hash(&headers, addr);
                audit::record(
                    &state.pool,
                    AuditEvent::AccessCodeIssued,
                    AuditContext::room(&code)
                        .with_actor(&actor)
                        .with_details(&agent.id),
                )
                .await;
                return Json(IssueCodeResponse {
                    success: true,
                    code,
                    expires_at,
                    agent,
                })
                .into_response();
            }
            Ok(false) => continue,
            Err(err) => {
                warn!("failed to store access code: {}", err);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to issue code");
            }
        }
    }
    error_response(StatusCode::SERVICE_UNAVAILABLE, "Could not allocate a unique code")
}

/// `GET /access-codes?agentId=`
pub async fn list_codes(
    State(state): State<AppState>,
    Query(query): Query<ListCodesQuery>,
) -> impl IntoResponse {
    if !is_valid_agent_id(query.agent_id.trim()) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid agent id");
    }
    match db::list_active_access_codes(&state.pool, query.agent_id.trim(), now_ms()).await {
        Ok(codes) => Json(ListCodesResponse {
            success: true,
            codes,
        })
        .into_response(),
        Err(err) => {
            warn!("listing codes for {} failed: {}", query.agent_id, err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list codes")
        }
    }
}

/// `POST /access-codes/validate`
///
/// A malformed code is rejected before any store access.
pub async fn validate_code(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ValidateCodeRequest>,
) -> impl IntoResponse {
    let code = match access_code::parse(&req.code) {
        Ok(code) => code,
        Err(err) => {
            let message = match err {
                booth_common::Error::Validation(msg) => msg,
                other => other.to_string(),
            };
            return error_response(StatusCode::BAD_REQUEST, message);
        }
    };

    if state.config.is_demo_code(&code) {
        return Json(ValidateCodeResponse {
            success: true,
            valid: true,
            code,
            demo: true,
            agent: AgentInfo::demo(),
        })
        .into_response();
    }

    let actor = actor_hash(&headers, addr);
    let now = now_ms();
    let outcome = match db::get_access_code(&state.pool, &code).await {
        Ok(None) => Err((StatusCode::NOT_FOUND, "Invalid access code")),
        Ok(Some(record)) if record.is_expired(now) => {
            Err((StatusCode::GONE, "Access code has expired"))
        }
        Ok(Some(record)) if record.used && record.single_use => {
            Err((StatusCode::CONFLICT, "Access code has already been used"))
        }
        Ok(Some(record)) => match db::mark_access_code_used(&state.pool, &code, now).await {
            Ok(true) => Ok(record),
            Ok(false) => Err((StatusCode::CONFLICT, "Access code has already been used")),
            Err(err) => {
                warn!("failed to redeem code {}: {}", code, err);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Validation failed");
            }
        },
        Err(err) => {
            warn!("code lookup failed for {}: {}", code, err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Validation failed");
        }
    };

    match outcome {
        Ok(record) => {
            audit::record(
                &state.pool,
                AuditEvent::AccessCodeRedeemed,
                AuditContext::room(&code).with_actor(&actor),
            )
            .await;
            let agent = match db::agent_for_code(&state.pool, &record).await {
                Ok(agent) => agent,
                Err(err) => {
                    warn!("agent lookup failed for code {}: {}", code, err);
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Validation failed");
                }
            };
            Json(ValidateCodeResponse {
                success: true,
                valid: true,
                code,
                demo: false,
                agent,
            })
            .into_response()
        }
        Err((status, message)) => {
            audit::record(
                &state.pool,
                AuditEvent::AccessCodeRejected,
                AuditContext::room(&code)
                    .with_actor(&actor)
                    .with_details(message),
            )
            .await;
            error_response(status, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_rules() {
        assert!(is_valid_agent_id("agent_42"));
        assert!(is_valid_agent_id("a.b-c"));
        assert!(!is_valid_agent_id(""));
        assert!(!is_valid_agent_id("agent 42"));
        assert!(!is_valid_agent_id(&"a".repeat(MAX_AGENT_ID_LEN + 1)));
    }
}
