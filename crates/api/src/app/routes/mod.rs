use axum::{
    routing::{get, post},
    Router,
};

pub mod alerts;
pub mod directory;
pub mod inventory;
pub mod orders;
pub mod system;
pub mod transactions;
pub mod transfers;

/// Router for all staff-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/transactions", post(transactions::apply_transaction))
        .nest("/inventory", inventory::router())
        .nest("/orders", orders::router())
        .nest("/alerts", alerts::router())
        .nest("/vehicles", transfers::vehicle_router())
        .nest("/transfers", transfers::router())
        .nest("/directory", directory::router())
}
