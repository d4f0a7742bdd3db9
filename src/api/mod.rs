pub mod account;
pub mod caller;
pub mod health;
pub mod positions;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;

use crate::services::TradingError;
use crate::AppState;

pub use caller::{CallerId, USER_ID_HEADER};

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api/positions", positions::router())
        .nest("/api/account", account::router())
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl TradingError {
    /// HTTP status and stable machine-readable code.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            TradingError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            TradingError::InsufficientBalance { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_BALANCE")
            }
            TradingError::PositionNotFound(_) => (StatusCode::NOT_FOUND, "POSITION_NOT_FOUND"),
            TradingError::NoMarkPrice(_) => (StatusCode::BAD_REQUEST, "NO_MARK_PRICE"),
            TradingError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            TradingError::DatabaseError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
            }
        }
    }
}

/// Convert TradingError to HTTP response.
impl IntoResponse for TradingError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ValidationError;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (TradingError::Validation(ValidationError::EmptySymbol), 400),
            (
                TradingError::InsufficientBalance {
                    needed: 10.0,
                    available: 1.0,
                },
                402,
            ),
            (TradingError::PositionNotFound("p".to_string()), 404),
            (TradingError::NoMarkPrice("btcusdt".to_string()), 400),
            (TradingError::Unauthorized, 401),
            (TradingError::DatabaseError("disk".to_string()), 500),
        ];
        for (error, status) in cases {
            assert_eq!(error.status_and_code().0.as_u16(), status);
        }
    }

    #[test]
    fn test_api_response_serialization() {
        let json = serde_json::to_string(&ApiResponse { data: 42 }).unwrap();
        assert_eq!(json, r#"{"data":42}"#);
    }
}
