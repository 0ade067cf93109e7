use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::dto;
use crate::app::services::AppServices;
use crate::context::StaffContext;

/// Apply one stock movement; responds once the ledger entry is committed.
pub async fn apply_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(staff): Extension<StaffContext>,
    Json(body): Json<dto::ApplyTransactionRequest>,
) -> axum::response::Response {
    let request = body.into_request(staff.staff_id().clone());

    let applied = match services.run(move |s| s.applier.apply(request)).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };

    (
        StatusCode::CREATED,
        Json(dto::AppliedTransactionResponse::from(applied)),
    )
        .into_response()
}
