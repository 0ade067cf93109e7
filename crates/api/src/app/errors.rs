use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use stockledger_infra::store::StoreError;
use stockledger_infra::{AlertError, ApplyError, QueryError, TransferError};

/// Conversion of a service error into the JSON error body.
pub trait ErrorResponse {
    fn into_error_response(self) -> axum::response::Response;
}

impl ErrorResponse for ApplyError {
    fn into_error_response(self) -> axum::response::Response {
        apply_error_to_response(self)
    }
}

impl ErrorResponse for QueryError {
    fn into_error_response(self) -> axum::response::Response {
        match self {
            QueryError::UnknownVariant(id) => json_error(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("variant {id} has no stock records"),
            ),
            e @ QueryError::Ledger { .. } => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "ledger_inconsistent", e.to_string())
            }
            QueryError::Store(e) => store_error_to_response(e),
        }
    }
}

impl ErrorResponse for AlertError {
    fn into_error_response(self) -> axum::response::Response {
        match self {
            e @ AlertError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
            AlertError::InvalidTransition(msg) => {
                json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
            }
            AlertError::Store(e) => store_error_to_response(e),
        }
    }
}

impl ErrorResponse for TransferError {
    fn into_error_response(self) -> axum::response::Response {
        match self {
            e @ TransferError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
            TransferError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
            TransferError::Apply(e) => apply_error_to_response(e),
            TransferError::Store(e) => store_error_to_response(e),
        }
    }
}

pub fn apply_error_to_response(err: ApplyError) -> axum::response::Response {
    match err {
        ApplyError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ ApplyError::InsufficientStock { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "insufficient_stock", e.to_string())
        }
        ApplyError::UnknownReference(msg) => json_error(StatusCode::NOT_FOUND, "unknown_reference", msg),
        e @ ApplyError::ConcurrentModification { .. } => {
            json_error(StatusCode::CONFLICT, "concurrent_modification", e.to_string())
        }
        ApplyError::AlreadyApplied(key) => json_error(
            StatusCode::CONFLICT,
            "already_applied",
            format!("{key} was already applied"),
        ),
        ApplyError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        ApplyError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "concurrent_modification", msg),
        StoreError::Duplicate(key) => json_error(StatusCode::CONFLICT, "already_applied", key),
        StoreError::Corrupt(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
        StoreError::Backend(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_and_transient_failures_get_distinct_statuses() {
        let insufficient = ApplyError::InsufficientStock {
            scope: "dealer 1".to_string(),
            requested: 30,
            available: 25,
        };
        assert_eq!(
            apply_error_to_response(insufficient).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let conflict = ApplyError::ConcurrentModification {
            attempts: 5,
            message: "central row moved".to_string(),
        };
        assert_eq!(apply_error_to_response(conflict).status(), StatusCode::CONFLICT);

        let backend = ApplyError::Store(StoreError::Backend("pool timed out".to_string()));
        assert_eq!(apply_error_to_response(backend).status(), StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(
            apply_error_to_response(ApplyError::Validation("quantity must be positive".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
