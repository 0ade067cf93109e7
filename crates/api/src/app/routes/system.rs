use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::context::StaffContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(staff): Extension<StaffContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "staff_id": staff.staff_id().as_str(),
    }))
}
