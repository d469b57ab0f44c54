//! Return request model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use super::borrow::{BorrowRequestStatus, SortDirection};
use super::otp::IssuedOtp;
use super::user::UserBasicInfo;

/// Return request row; one per borrow request touched by a return submission
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ReturnRequest {
    pub id: Uuid,
    pub borrow_request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub confirmed_by: Option<Uuid>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ReturnRequestItem {
    pub id: Uuid,
    pub return_request_id: Uuid,
    pub borrow_request_item_id: Uuid,
    pub quantity: i32,
}

/// Closes one borrow transaction
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ReturnTransaction {
    pub id: Uuid,
    pub borrow_transaction_id: Uuid,
    pub return_request_item_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ReturnItemInput {
    pub borrow_request_item_id: Uuid,
    pub quantity: i32,
}

/// Create return request(s) for one or more borrowed lines
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateReturnRequest {
    pub items: Vec<ReturnItemInput>,
}

/// A return request created by a submission, grouped by borrow request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreatedReturnRequest {
    pub id: Uuid,
    pub borrow_request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub items: Vec<ReturnRequestItem>,
    pub code: IssuedOtp,
}

/// Confirm a return request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ConfirmReturnRequest {
    pub confirmed_by: Uuid,
    #[validate(length(max = 1000))]
    pub remarks: Option<String>,
    /// Return code presented by the borrower, checked when supplied
    #[validate(length(min = 1, max = 32))]
    pub code: Option<String>,
}

/// Result of a confirmation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConfirmedReturn {
    pub return_request_id: Uuid,
    pub borrow_request_id: Uuid,
    pub returned_units: u32,
    pub borrow_request_status: BorrowRequestStatus,
}

/// Return request line with catalog display fields
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ReturnLine {
    pub return_request_item_id: Uuid,
    pub borrow_request_item_id: Uuid,
    pub equipment_type_id: Uuid,
    pub name: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub image_url: Option<String>,
    pub quantity: i32,
}

/// Return request as stored; user ids are not yet resolved
#[derive(Debug, Clone)]
pub struct ReturnRequestRecord {
    pub request: ReturnRequest,
    pub requested_by: Uuid,
    pub expected_return_at: DateTime<Utc>,
    pub lines: Vec<ReturnLine>,
}

/// Return request with borrower display information
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReturnRequestDetails {
    pub id: Uuid,
    pub borrow_request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub borrower: UserBasicInfo,
    pub equipments: Vec<ReturnLine>,
    pub expected_return_at: DateTime<Utc>,
    pub confirmed_by: Option<UserBasicInfo>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub remarks: Option<String>,
}

/// Unconfirmed return request filters
#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
pub struct ReturnRequestQuery {
    pub user_id: Option<Uuid>,
    /// Equipment type name
    pub category: Option<String>,
    /// Direction on expected return time, newest first by default
    pub sort: Option<SortDirection>,
}
