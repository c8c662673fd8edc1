use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use chrono::Utc;
use cm_usage::record::DEFAULT_OPERATION;
use cm_usage::{CallEvent, DailyTotal, RequestOrigin, UsageStats};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiErrorResponse};
use crate::state::AppState;

const DEFAULT_DAYS: u32 = 7;
const MAX_DAYS: u32 = 90;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRequest {
    pub model: Option<String>,
    pub operation: Option<String>,
    pub success: Option<bool>,
    pub response_time: Option<u64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub success: bool,
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    pub days: Option<u32>,
}

fn request_origin(headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestOrigin {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    RequestOrigin {
        ip_address: forwarded.or_else(|| peer.map(|addr| addr.ip().to_string())),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

pub async fn stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<UsageStats>, ApiErrorResponse> {
    let stats = state
        .store
        .stats(&user.id, Utc::now())
        .map_err(ApiErrorResponse::internal)?;
    Ok(Json(stats))
}

pub async fn record(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    Json(body): Json<RecordRequest>,
) -> Result<Json<RecordResponse>, ApiErrorResponse> {
    let model = body
        .model
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            ApiErrorResponse::from((StatusCode::BAD_REQUEST, ApiError::model_required()))
        })?;

    let event = CallEvent {
        model,
        operation: body
            .operation
            .filter(|op| !op.is_empty())
            .unwrap_or_else(|| DEFAULT_OPERATION.to_string()),
        success: body.success.unwrap_or(true),
        response_time: body.response_time,
        tokens_in: body.tokens_in,
        tokens_out: body.tokens_out,
    };
    let origin = request_origin(&headers, peer.map(|Extension(ConnectInfo(addr))| addr));

    let id = state
        .store
        .record_call(&user.id, &event, &origin, Utc::now())
        .map_err(ApiErrorResponse::internal)?;
    Ok(Json(RecordResponse { success: true, id }))
}

pub async fn daily(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<DailyQuery>,
) -> Result<Json<Vec<DailyTotal>>, ApiErrorResponse> {
    let days = query.days.unwrap_or(DEFAULT_DAYS).clamp(1, MAX_DAYS);
    let totals = state
        .store
        .daily_totals(&user.id, days)
        .map_err(ApiErrorResponse::internal)?;
    Ok(Json(totals))
}
