//! Error types for the equipment lending server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Machine-readable error codes returned in every error body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Failure = 1,
    DbFailure = 2,
    BadValue = 3,
    NotFound = 4,
    InsufficientQuantity = 10,
    ExceedsRemainingQuantity = 11,
    ItemFullyReturned = 12,
    InvalidBorrowRequestStatus = 20,
    AlreadyConfirmed = 21,
    InvalidOrExpiredCode = 22,
    OtpGenerationExhausted = 30,
    CollaboratorFailure = 31,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Requested quantity exceeds available equipment")]
    InsufficientQuantity,

    #[error("Return quantity exceeds remaining borrowed quantity")]
    ExceedsRemainingQuantity,

    #[error("Borrowed item has already been fully returned")]
    ItemFullyReturned,

    #[error("Invalid borrow request status: {0}")]
    InvalidBorrowRequestStatus(String),

    #[error("Return request is already confirmed")]
    AlreadyConfirmed,

    #[error("Invalid or expired code")]
    InvalidOrExpiredCode,

    #[error("Failed to generate a unique code after {0} attempts")]
    OtpGenerationExhausted(u32),

    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation(_) => ErrorCode::BadValue,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::InsufficientQuantity => ErrorCode::InsufficientQuantity,
            AppError::ExceedsRemainingQuantity => ErrorCode::ExceedsRemainingQuantity,
            AppError::ItemFullyReturned => ErrorCode::ItemFullyReturned,
            AppError::InvalidBorrowRequestStatus(_) => ErrorCode::InvalidBorrowRequestStatus,
            AppError::AlreadyConfirmed => ErrorCode::AlreadyConfirmed,
            AppError::InvalidOrExpiredCode => ErrorCode::InvalidOrExpiredCode,
            AppError::OtpGenerationExhausted(_) => ErrorCode::OtpGenerationExhausted,
            AppError::Collaborator(_) => ErrorCode::CollaboratorFailure,
            AppError::Database(_) => ErrorCode::DbFailure,
            AppError::Internal(_) => ErrorCode::Failure,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Error response body
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match &self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::InsufficientQuantity
            | AppError::ExceedsRemainingQuantity
            | AppError::ItemFullyReturned => (StatusCode::CONFLICT, self.to_string()),
            AppError::InvalidBorrowRequestStatus(_) | AppError::AlreadyConfirmed => {
                (StatusCode::CONFLICT, self.to_string())
            }
            AppError::InvalidOrExpiredCode => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::OtpGenerationExhausted(attempts) => {
                tracing::error!(attempts, "One-time code generation exhausted");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Could not issue a claim code, try again later".to_string(),
                )
            }
            AppError::Collaborator(msg) => {
                tracing::warn!("Collaborator failure: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "Failed to fetch related information".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_conflicts_map_to_conflict_status() {
        let response = AppError::InsufficientQuantity.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = AppError::AlreadyConfirmed.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn database_errors_do_not_leak_details() {
        let err = AppError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.code(), ErrorCode::DbFailure);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn expired_code_is_forbidden() {
        let response = AppError::InvalidOrExpiredCode.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
