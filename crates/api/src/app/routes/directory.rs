use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::put,
    Json, Router,
};

use stockledger_inventory::{DealerInfo, VariantInfo};

use crate::app::dto;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/variants/:variant_id", put(upsert_variant))
        .route("/dealers/:dealer_id", put(upsert_dealer))
}

/// Register or rename a catalog variant (display data only).
pub async fn upsert_variant(
    Extension(services): Extension<Arc<AppServices>>,
    Path(variant_id): Path<String>,
    Json(body): Json<dto::UpsertVariantRequest>,
) -> axum::response::Response {
    let variant_id = match dto::parse_variant_id(&variant_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let info = VariantInfo {
        variant_id,
        model_name: body.model_name,
        variant_name: body.variant_name,
    };
    services.catalog.insert(info.clone());
    (StatusCode::OK, Json(info)).into_response()
}

/// Register a dealer and its region; later stock events roll up under it.
pub async fn upsert_dealer(
    Extension(services): Extension<Arc<AppServices>>,
    Path(dealer_id): Path<String>,
    Json(body): Json<dto::UpsertDealerRequest>,
) -> axum::response::Response {
    let dealer_id = match dto::parse_dealer_id(&dealer_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let info = DealerInfo {
        dealer_id,
        name: body.name,
        region: body.region,
    };
    services.directory.insert(info.clone());
    (StatusCode::OK, Json(info)).into_response()
}
