//! Operator endpoints: stats, manual block and unblock.

use std::net::IpAddr;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::middleware::header_str;
use super::server::AppState;
use crate::ratelimit::{AdmissionStats, UnblockReport};

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub ip: String,
    pub duration_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct UnblockRequest {
    pub ip: String,
}

#[derive(Debug, Serialize)]
pub struct BlockResponse {
    pub ip: String,
    pub blocked_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct AdminError {
    pub error: String,
}

type AdminResult<T> = std::result::Result<Json<T>, (StatusCode, Json<AdminError>)>;

fn bad_request(message: String) -> (StatusCode, Json<AdminError>) {
    (StatusCode::BAD_REQUEST, Json(AdminError { error: message }))
}

fn parse_ip(ip: &str) -> std::result::Result<String, (StatusCode, Json<AdminError>)> {
    ip.trim()
        .parse::<IpAddr>()
        .map(|addr| addr.to_string())
        .map_err(|_| bad_request(format!("'{}' is not a valid IP address", ip)))
}

pub async fn get_stats(State(state): State<AppState>) -> Json<AdmissionStats> {
    Json(state.controller.stats())
}

pub async fn block_ip(
    State(state): State<AppState>,
    Json(req): Json<BlockRequest>,
) -> AdminResult<BlockResponse> {
    let ip = parse_ip(&req.ip)?;
    if req.duration_ms == 0 {
        return Err(bad_request("duration_ms must be greater than zero".into()));
    }

    state.controller.block_ip(&ip, req.duration_ms);
    Ok(Json(BlockResponse {
        ip,
        blocked_ms: req.duration_ms,
    }))
}

pub async fn unblock_ip(
    State(state): State<AppState>,
    Json(req): Json<UnblockRequest>,
) -> AdminResult<UnblockReport> {
    let ip = parse_ip(&req.ip)?;
    Ok(Json(state.controller.unblock_ip(&ip)))
}

/// Require `Authorization: Bearer <admin_token>`.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let Some(token) = state.admin_token.as_deref() else {
        return Err(StatusCode::NOT_FOUND);
    };

    let presented =
        header_str(request.headers(), AUTHORIZATION).and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(token) {
        return Ok(next.run(request).await);
    }

    warn!(path = %request.uri().path(), "Rejected admin request");
    Err(StatusCode::UNAUTHORIZED)
}

pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/stats", get(get_stats))
        .route("/admin/block", post(block_ip))
        .route("/admin/unblock", post(unblock_ip))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
