//! Caller identity.
//!
//! Authentication happens upstream; the authenticated user id is forwarded
//! in the `x-user-id` header.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::services::TradingError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// User id of the caller. Rejects with 401 when the header is missing or
/// blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = TradingError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CallerId(v.to_string()))
            .ok_or(TradingError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tokio_test::{assert_err, assert_ok, block_on};

    fn extract(request: Request<()>) -> Result<CallerId, TradingError> {
        let (mut parts, _) = request.into_parts();
        block_on(CallerId::from_request_parts(&mut parts, &()))
    }

    #[test]
    fn test_header_extracted() {
        let request = Request::builder()
            .header(USER_ID_HEADER, " alice ")
            .body(())
            .unwrap();
        let caller = assert_ok!(extract(request));
        assert_eq!(caller, CallerId("alice".to_string()));
    }

    #[test]
    fn test_missing_or_blank_header_rejected() {
        let missing = Request::builder().body(()).unwrap();
        let err = assert_err!(extract(missing));
        assert!(matches!(err, TradingError::Unauthorized));

        let blank = Request::builder().header(USER_ID_HEADER, "  ").body(()).unwrap();
        let err = assert_err!(extract(blank));
        assert!(matches!(err, TradingError::Unauthorized));
    }
}
