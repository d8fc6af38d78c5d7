//! Axum route handlers for the attribution RPC API.

use crate::manager::AttributionManager;
use attribution_types::*;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub manager: AttributionManager,
    pub start_time: Instant,
}

// POST /rpc/sources/register
pub async fn register_source(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterSourceRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    if state
        .manager
        .handle_source(req.source, ContextId(req.context_id))
    {
        (StatusCode::OK, Json(RpcResponse::ok(true)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RpcResponse::err("Event queue is full")),
        )
    }
}

// POST /rpc/triggers/register
pub async fn register_trigger(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterTriggerRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    if state
        .manager
        .handle_trigger(req.trigger, ContextId(req.context_id))
    {
        (StatusCode::OK, Json(RpcResponse::ok(true)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RpcResponse::err("Event queue is full")),
        )
    }
}

// POST /rpc/os/register
pub async fn register_os(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterOsRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    if state.manager.handle_os_registration(req.registration) {
        (StatusCode::OK, Json(RpcResponse::ok(true)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RpcResponse::err("OS registration queue is full")),
        )
    }
}

// GET /rpc/sources/active
pub async fn active_sources(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<StoredSource>>>) {
    let sources = state.manager.get_active_sources_for_web_ui().await;
    (StatusCode::OK, Json(RpcResponse::ok(sources)))
}

// GET /rpc/reports/pending?limit=N
pub async fn pending_reports(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PendingReportsQuery>,
) -> (StatusCode, Json<RpcResponse<Vec<AttributionReport>>>) {
    let reports = state
        .manager
        .get_pending_reports_for_internal_use(query.limit)
        .await;
    (StatusCode::OK, Json(RpcResponse::ok(reports)))
}

// POST /rpc/reports/send
pub async fn send_report(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendReportRequest>,
) -> (StatusCode, Json<RpcResponse<SendResult>>) {
    match state
        .manager
        .send_report_for_web_ui(ReportId(req.report_id))
        .await
    {
        Some(result) => (StatusCode::OK, Json(RpcResponse::ok(result))),
        None => (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err(format!(
                "Report {} not found or already being sent",
                req.report_id
            ))),
        ),
    }
}

// POST /rpc/data/clear
pub async fn clear_data(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClearDataRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    if let (Some(begin), Some(end)) = (req.begin, req.end) {
        if begin > end {
            return (
                StatusCode::BAD_REQUEST,
                Json(RpcResponse::err("begin must not be after end")),
            );
        }
    }
    state
        .manager
        .clear_data(req.begin, req.end, req.filter, req.delete_rate_limit_data)
        .await;
    (StatusCode::OK, Json(RpcResponse::ok(true)))
}

// GET /rpc/data/keys
pub async fn data_keys(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<AttributionDataKey>>>) {
    let keys = state.manager.get_all_data_keys().await;
    (StatusCode::OK, Json(RpcResponse::ok(keys)))
}

// POST /rpc/data/keys/remove
pub async fn remove_data_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemoveDataKeyRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    state
        .manager
        .remove_attribution_data_by_data_key(AttributionDataKey {
            reporting_origin: req.reporting_origin,
        })
        .await;
    (StatusCode::OK, Json(RpcResponse::ok(true)))
}

// POST /rpc/debug_mode
pub async fn debug_mode(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DebugModeRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    state.manager.set_debug_mode(req.enabled).await;
    (StatusCode::OK, Json(RpcResponse::ok(state.manager.debug_mode())))
}

// POST /rpc/connectivity
pub async fn connectivity(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectivityRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    state.manager.on_connection_changed(req.online).await;
    (StatusCode::OK, Json(RpcResponse::ok(state.manager.is_online())))
}

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let manager = &state.manager;
    (
        StatusCode::OK,
        Json(RpcResponse::ok(ServiceStatus {
            running: true,
            uptime_secs: state.start_time.elapsed().as_secs(),
            debug_mode: manager.debug_mode(),
            online: manager.is_online(),
            os_support: manager.os_support(),
            next_report_time: manager.next_report_time(),
            reports_being_sent: manager.reports_being_sent_count(),
            counters: manager.metrics().snapshot(),
        })),
    )
}
