//! 诊断 API 端点
//!
//! 健康监控访问器之上的一层薄 HTTP 接口。
//! 生产环境下除 `/health` 外都要求与 WebSocket 入口相同的 token。

use axum::{
    extract::{Query, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::bridge::BridgeStatus;
use crate::orchestrator::StrategyCounters;
use crate::resilience::{ErrorCategory, RemediationOutcome};
use crate::server::AppState;
use crate::telemetry::{CheckResult, CheckStatus, ErrorRecord, HealthStats};
use crate::websocket::extract_token;

/// 默认返回的错误条数
const DEFAULT_ERROR_LIMIT: usize = 50;

/// API 错误响应
#[derive(Debug, Serialize)]
pub struct DebugApiError {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}

impl IntoResponse for DebugApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

fn authorize(state: &AppState, headers: &HeaderMap, query: Option<&str>) -> Result<(), DebugApiError> {
    let token = extract_token(headers, query);
    state
        .guard
        .check_auth(token.as_deref())
        .map_err(|e| DebugApiError {
            error: "unauthorized".to_string(),
            message: e.to_string(),
            status_code: e.status_code(),
        })
}

/// 健康检查响应
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: CheckStatus,
    pub uptime_secs: i64,
    pub active_connections: usize,
    pub bridge: BridgeStatus,
    pub checks: Vec<CheckResult>,
}

/// GET /health - 健康状态（不需要认证）
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let stats = state.monitor.stats();
    let status = if stats.status == CheckStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(HealthResponse {
            status: stats.status,
            uptime_secs: stats.uptime_secs,
            active_connections: stats.active_connections,
            bridge: state.bridge.status().await,
            checks: stats.last_checks,
        }),
    )
}

/// 统计响应
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub health: HealthStats,
    pub strategies: HashMap<&'static str, StrategyCounters>,
    pub bridge: BridgeStatus,
}

/// GET /api/debug/stats - 监控统计
pub async fn debug_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Json<StatsResponse>, DebugApiError> {
    authorize(&state, &headers, query.as_deref())?;
    Ok(Json(StatsResponse {
        health: state.monitor.stats(),
        strategies: state.orchestrator.counters(),
        bridge: state.bridge.status().await,
    }))
}

/// 错误列表查询参数
#[derive(Debug, Deserialize)]
pub struct ErrorsQuery {
    pub limit: Option<usize>,
}

/// GET /api/debug/errors?limit= - 最近的错误，新的在前
pub async fn debug_errors(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
    Query(params): Query<ErrorsQuery>,
) -> Result<Json<Vec<ErrorRecord>>, DebugApiError> {
    authorize(&state, &headers, raw.as_deref())?;
    let limit = params.limit.unwrap_or(DEFAULT_ERROR_LIMIT);
    Ok(Json(state.monitor.recent_errors(limit)))
}

/// POST /api/debug/reset - 清空统计
pub async fn debug_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Json<serde_json::Value>, DebugApiError> {
    authorize(&state, &headers, query.as_deref())?;
    tracing::info!("[DEBUG_API] 重置监控统计");
    state.monitor.reset();
    Ok(Json(serde_json::json!({ "reset": true })))
}

/// 手动恢复请求
#[derive(Debug, Default, Deserialize)]
pub struct RecoverRequest {
    /// 要修复的类别；为空时取最近错误中出现过的类别
    #[serde(default)]
    pub categories: Option<Vec<ErrorCategory>>,
}

/// POST /api/debug/recover - 手动触发一轮恢复
pub async fn debug_recover(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Option<Json<RecoverRequest>>,
) -> Result<Json<Vec<RemediationOutcome>>, DebugApiError> {
    authorize(&state, &headers, query.as_deref())?;
    let request = body.map(|Json(request)| request).unwrap_or_default();
    tracing::info!("[DEBUG_API] 手动恢复: {:?}", request.categories);
    Ok(Json(state.monitor.recover(request.categories).await))
}
