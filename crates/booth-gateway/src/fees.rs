use axum::{extract::Json, http::StatusCode, response::IntoResponse};
use booth_common::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::web::error_response;

const DEFAULT_RATE: f64 = 0.02;
const PAYOUT_FLAT_FEE: f64 = 10.0;
const SHARE_BASE_URL: &str = "https://vitalswap.com/fees";
const FEE_GUIDE_PATH: &str = "/assets/vitalswap-fee-guide.pdf";

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calculation {
    pub service: String,
    pub amount: f64,
    pub fee: f64,
    pub total: f64,
}

/// Fee for `amount` of `service`. Payouts are a flat fee, everything else a
/// percentage of the amount.
pub fn quick_fee(service: &str, amount: f64) -> f64 {
    let rate = match service {
        "payout" => return PAYOUT_FLAT_FEE,
        "card" => 0.015,
        "transfer" => 0.02,
        "fx" => 0.01,
        _ => DEFAULT_RATE,
    };
    amount * rate
}

pub fn calculate(service: &str, amount: f64) -> Calculation {
    let fee = quick_fee(service, amount);
    Calculation {
        service: service.to_string(),
        amount,
        fee,
        total: amount + fee,
    }
}

fn parse_quick_calculate(data: &Value) -> Result<(String, f64), &'static str> {
    let service = data
        .get("service")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("service is required")?;
    let amount = data
        .get("amount")
        .and_then(Value::as_f64)
        .ok_or("amount must be a number")?;
    if !amount.is_finite() || amount < 0.0 {
        return Err("amount must be a non-negative number");
    }
    Ok((service.to_string(), amount))
}

/// `POST /api/actions`
pub async fn handle_action(Json(req): Json<ActionRequest>) -> impl IntoResponse {
    match req.action.as_str() {
        "save-favorites" => {
            let favorites = match req.data.get("services") {
                Some(Value::Array(services)) => Value::Array(services.clone()),
                _ => Value::Array(Vec::new()),
            };
            Json(json!({
                "success": true,
                "message": "Favorites saved successfully",
                "favorites": favorites,
            }))
            .into_response()
        }
        "share-comparison" => Json(json!({
            "success": true,
            "shareUrl": format!("{SHARE_BASE_URL}?shared={}", now_ms()),
            "message": "Fee comparison shared",
        }))
        .into_response(),
        "download-guide" => Json(json!({
            "success": true,
            "downloadUrl": FEE_GUIDE_PATH,
            "message": "Fee guide download started",
        }))
        .into_response(),
        "quick-calculate" => match parse_quick_calculate(&req.data) {
            Ok((service, amount)) => Json(json!({
                "success": true,
                "calculation": calculate(&service, amount),
            }))
            .into_response(),
            Err(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        },
        _ => error_response(StatusCode::BAD_REQUEST, "Invalid action"),
    }
}
