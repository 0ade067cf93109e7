use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};

use crate::app::dto;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_inventory))
        .route("/regions", get(region_totals))
        .route("/:variant_id", get(get_inventory_status))
        .route("/:variant_id/ledger", get(get_ledger))
        .route("/:variant_id/reconciliation", get(get_reconciliation))
        .route("/:variant_id/dealers", get(get_dealer_summary))
        .route("/:variant_id/reorder-level", put(update_reorder_level))
        .route("/:variant_id/dealers/:dealer_id/status", put(update_dealer_status))
}

pub async fn list_inventory(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::InventoryListQuery>,
) -> axum::response::Response {
    let filter = query.filter();
    let page = query.page();

    match services.run(move |s| s.query.list_inventory(&filter, page)).await {
        Ok(paged) => (StatusCode::OK, Json(paged)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_inventory_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(variant_id): Path<String>,
) -> axum::response::Response {
    let variant_id = match dto::parse_variant_id(&variant_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |s| s.query.get_inventory_status(variant_id)).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_ledger(
    Extension(services): Extension<Arc<AppServices>>,
    Path(variant_id): Path<String>,
    Query(query): Query<dto::PageQuery>,
) -> axum::response::Response {
    let variant_id = match dto::parse_variant_id(&variant_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let page = query.page();

    match services.run(move |s| s.query.ledger(variant_id, page)).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_reconciliation(
    Extension(services): Extension<Arc<AppServices>>,
    Path(variant_id): Path<String>,
) -> axum::response::Response {
    let variant_id = match dto::parse_variant_id(&variant_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |s| s.query.reconcile(variant_id)).await {
        Ok(report) => (StatusCode::OK, Json(dto::ReconciliationResponse::from(report))).into_response(),
        Err(resp) => resp,
    }
}

/// Dealer levels as last seen by the summary projection (eventually consistent).
pub async fn get_dealer_summary(
    Extension(services): Extension<Arc<AppServices>>,
    Path(variant_id): Path<String>,
) -> axum::response::Response {
    let variant_id = match dto::parse_variant_id(&variant_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    (StatusCode::OK, Json(services.summary.dealer_summary(variant_id))).into_response()
}

pub async fn region_totals(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    (StatusCode::OK, Json(services.summary.region_totals())).into_response()
}

pub async fn update_reorder_level(
    Extension(services): Extension<Arc<AppServices>>,
    Path(variant_id): Path<String>,
    Json(body): Json<dto::UpdateReorderLevelRequest>,
) -> axum::response::Response {
    let variant_id = match dto::parse_variant_id(&variant_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let scope = body.scope();
    let reorder_level = body.reorder_level;

    match services
        .run(move |s| s.applier.update_reorder_level(scope, variant_id, reorder_level))
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "variant_id": variant_id,
                "dealer_id": scope.dealer_id(),
                "reorder_level": reorder_level,
            })),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

pub async fn update_dealer_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path((variant_id, dealer_id)): Path<(String, String)>,
    Json(body): Json<dto::UpdateDealerStatusRequest>,
) -> axum::response::Response {
    let variant_id = match dto::parse_variant_id(&variant_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let dealer_id = match dto::parse_dealer_id(&dealer_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .run(move |s| s.applier.update_dealer_status(dealer_id, variant_id, &body.status))
        .await
    {
        Ok(row) => (StatusCode::OK, Json(dto::StockRow::from(&row))).into_response(),
        Err(resp) => resp,
    }
}
