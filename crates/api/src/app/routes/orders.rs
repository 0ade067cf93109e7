use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use stockledger_core::OrderId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::StaffContext;

pub fn router() -> Router {
    Router::new().route("/:order_id/allocate", post(allocate_order))
}

/// Reserve every line of an approved order centrally, all or nothing.
///
/// Repeating the call for the same order reports the original allocation.
pub async fn allocate_order(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(staff): Extension<StaffContext>,
    Path(order_id): Path<String>,
    Json(body): Json<dto::AllocateOrderRequest>,
) -> axum::response::Response {
    let order_id = match OrderId::new(order_id) {
        Ok(v) => v,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };
    let staff_id = staff.staff_id().clone();
    let id = order_id.to_string();

    match services
        .run(move |s| s.applier.allocate_for_order(&order_id, &body.items, &staff_id))
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(dto::AllocationResponse::new(id, outcome))).into_response(),
        Err(resp) => resp,
    }
}
