use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use stockledger_core::StaffId;

use crate::context::StaffContext;

/// Header carrying the authenticated staff identity (set by the gateway).
pub const STAFF_HEADER: &str = "x-staff-id";

pub async fn staff_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let staff_id = extract_staff(req.headers())?;

    req.extensions_mut().insert(StaffContext::new(staff_id));

    Ok(next.run(req).await)
}

fn extract_staff(headers: &HeaderMap) -> Result<StaffId, StatusCode> {
    let header = headers.get(STAFF_HEADER).ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    StaffId::new(header.trim()).map_err(|_| StatusCode::UNAUTHORIZED)
}
