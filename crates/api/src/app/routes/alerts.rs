use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use crate::app::dto;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_alerts))
        .route("/scan", post(scan_now))
        .route("/:alert_id/acknowledge", post(acknowledge_alert))
        .route("/:alert_id/resolve", post(resolve_alert))
}

/// Active (NEW and ACKNOWLEDGED) alerts, or every alert in one status.
pub async fn list_alerts(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::AlertListQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref().map(dto::parse_alert_status).transpose() {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let result = match status {
        None => services.run(|s| s.alerts.list_active()).await,
        Some(status) => services.run(move |s| s.alerts.list(Some(status))).await,
    };
    match result {
        Ok(alerts) => (StatusCode::OK, Json(alerts)).into_response(),
        Err(resp) => resp,
    }
}

/// Run one threshold scan immediately instead of waiting for the scheduler.
pub async fn scan_now(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.run(|s| s.alerts.scan(Utc::now())).await {
        Ok(report) => (StatusCode::OK, Json(dto::ScanResponse::from(report))).into_response(),
        Err(resp) => resp,
    }
}

pub async fn acknowledge_alert(
    Extension(services): Extension<Arc<AppServices>>,
    Path(alert_id): Path<String>,
) -> axum::response::Response {
    let alert_id = match dto::parse_alert_id(&alert_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |s| s.alerts.acknowledge(alert_id)).await {
        Ok(alert) => (StatusCode::OK, Json(alert)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn resolve_alert(
    Extension(services): Extension<Arc<AppServices>>,
    Path(alert_id): Path<String>,
) -> axum::response::Response {
    let alert_id = match dto::parse_alert_id(&alert_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |s| s.alerts.resolve(alert_id)).await {
        Ok(alert) => (StatusCode::OK, Json(alert)).into_response(),
        Err(resp) => resp,
    }
}
