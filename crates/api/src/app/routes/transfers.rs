use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use stockledger_inventory::StockScope;

use crate::app::services::AppServices;
use crate::app::dto;
use crate::context::StaffContext;

pub fn vehicle_router() -> Router {
    Router::new()
        .route("/receive", post(receive_vehicles))
        .route("/:vin", get(get_vehicle))
        .route("/:vin/sell", post(sell_vehicle))
}

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_transfer))
        .route("/:transfer_id", get(get_transfer))
        .route("/:transfer_id/confirm", post(confirm_transfer))
        .route("/:transfer_id/dispatch", post(dispatch_transfer))
        .route("/:transfer_id/deliver", post(deliver_transfer))
        .route("/:transfer_id/cancel", post(cancel_transfer))
}

/// Register arriving vehicles at the warehouse (restocks their variant).
pub async fn receive_vehicles(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(staff): Extension<StaffContext>,
    Json(body): Json<dto::ReceiveVehiclesRequest>,
) -> axum::response::Response {
    let staff_id = staff.staff_id().clone();
    let received = body.vins.len();

    match services
        .run(move |s| s.transfers.receive_vehicles(body.variant_id, body.vins, staff_id))
        .await
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "received": received })),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_vehicle(
    Extension(services): Extension<Arc<AppServices>>,
    Path(vin): Path<String>,
) -> axum::response::Response {
    let vin = match dto::parse_vin(&vin) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |s| s.transfers.vehicle(&vin)).await {
        Ok(vehicle) => (StatusCode::OK, Json(vehicle)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn sell_vehicle(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(staff): Extension<StaffContext>,
    Path(vin): Path<String>,
) -> axum::response::Response {
    let vin = match dto::parse_vin(&vin) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let staff_id = staff.staff_id().clone();

    match services.run(move |s| s.transfers.sell_vehicle(&vin, staff_id)).await {
        Ok(vehicle) => (StatusCode::OK, Json(vehicle)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn create_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(staff): Extension<StaffContext>,
    Json(body): Json<dto::CreateTransferRequest>,
) -> axum::response::Response {
    let staff_id = staff.staff_id().clone();
    let from = StockScope::from_dealer(body.from_dealer_id);
    let to = StockScope::from_dealer(body.to_dealer_id);

    match services
        .run(move |s| s.transfers.request_transfer(body.variant_id, from, to, body.vins, staff_id))
        .await
    {
        Ok(request) => (StatusCode::CREATED, Json(request)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Path(transfer_id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_transfer_id(&transfer_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |s| s.transfers.request(id)).await {
        Ok(request) => (StatusCode::OK, Json(request)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn confirm_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Path(transfer_id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_transfer_id(&transfer_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |s| s.transfers.confirm(id)).await {
        Ok(request) => (StatusCode::OK, Json(request)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn dispatch_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Path(transfer_id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_transfer_id(&transfer_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |s| s.transfers.dispatch(id)).await {
        Ok(request) => (StatusCode::OK, Json(request)).into_response(),
        Err(resp) => resp,
    }
}

/// Land the vehicles and apply the quantity movement in one unit of work.
pub async fn deliver_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(staff): Extension<StaffContext>,
    Path(transfer_id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_transfer_id(&transfer_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let staff_id = staff.staff_id().clone();

    match services.run(move |s| s.transfers.deliver(id, staff_id)).await {
        Ok(request) => (StatusCode::OK, Json(request)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn cancel_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Path(transfer_id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_transfer_id(&transfer_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.run(move |s| s.transfers.cancel(id)).await {
        Ok(request) => (StatusCode::OK, Json(request)).into_response(),
        Err(resp) => resp,
    }
}
