//! API error type with HTTP status mapping.
//!
//! Validation failures are 400s; every engine failure surfaces as a 500 with
//! a machine-readable `code` distinguishing the failure kind, and the
//! underlying tool output preserved in `error`.

use crate::api::types::ApiErrorResponse;
use crate::error::Error;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// API error with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    /// Invalid request input (400).
    BadRequest(String),
    /// Engine failure (500), carrying the originating error.
    Engine(Error),
    /// Request handling infrastructure failure (500).
    Internal(String),
}

impl ApiError {
    /// Machine-readable code for the error body.
    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::Engine(err) => match err {
                Error::Image(_) => "IMAGE_PREPARATION_FAILED",
                Error::Network(_) => "NETWORK_PROVISIONING_FAILED",
                Error::DiskCopy(_) => "DISK_COPY_FAILED",
                Error::Seed(_) => "SEED_GENERATION_FAILED",
                Error::Inject(_) => "CREDENTIAL_INJECTION_FAILED",
                Error::Launch(_) => "HYPERVISOR_LAUNCH_FAILED",
                Error::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
                Error::UnknownAction { .. } => "UNKNOWN_ACTION",
                Error::AddressPoolExhausted(_) => "ADDRESS_POOL_EXHAUSTED",
                Error::CommandFailed { .. } => "COMMAND_FAILED",
                _ => "INTERNAL_ERROR",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Engine(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ApiErrorResponse {
            error: message,
            code: code.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Engine(err)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_is_400() {
        let resp = ApiError::BadRequest("public_key is required".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_engine_errors_are_500() {
        let cases = [
            Error::image("pull failed"),
            Error::network("tap failed"),
            Error::not_found("x"),
            Error::unknown_action("suspend"),
        ];
        for err in cases {
            let resp = ApiError::from(err).into_response();
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn test_engine_error_codes_are_distinct() {
        let codes = [
            ApiError::from(Error::image("x")).code(),
            ApiError::from(Error::network("x")).code(),
            ApiError::from(Error::disk_copy("x")).code(),
            ApiError::from(Error::seed("x")).code(),
            ApiError::from(Error::launch("x")).code(),
            ApiError::from(Error::not_found("x")).code(),
            ApiError::from(Error::unknown_action("x")).code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len(), "codes must be pairwise distinct");
    }

    #[test]
    fn test_code_mapping() {
        assert_eq!(
            ApiError::from(Error::image("x")).code(),
            "IMAGE_PREPARATION_FAILED"
        );
        assert_eq!(
            ApiError::from(Error::not_found("x")).code(),
            "INSTANCE_NOT_FOUND"
        );
        assert_eq!(
            ApiError::from(Error::unknown_action("x")).code(),
            "UNKNOWN_ACTION"
        );
    }
}
