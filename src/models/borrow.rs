//! Borrow request model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use super::otp::IssuedOtp;
use super::user::UserBasicInfo;

/// Borrow request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[sqlx(type_name = "borrow_request_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BorrowRequestStatus {
    Pending,
    Approved,
    Received,
    Fulfilled,
    Rejected,
    Unclaimed,
}

impl BorrowRequestStatus {
    /// Sort rank used when ordering history by status
    pub fn rank(self) -> u8 {
        match self {
            BorrowRequestStatus::Pending => 1,
            BorrowRequestStatus::Approved => 2,
            BorrowRequestStatus::Received => 3,
            BorrowRequestStatus::Fulfilled => 4,
            BorrowRequestStatus::Rejected | BorrowRequestStatus::Unclaimed => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BorrowRequestStatus::Pending => "pending",
            BorrowRequestStatus::Approved => "approved",
            BorrowRequestStatus::Received => "received",
            BorrowRequestStatus::Fulfilled => "fulfilled",
            BorrowRequestStatus::Rejected => "rejected",
            BorrowRequestStatus::Unclaimed => "unclaimed",
        }
    }
}

impl std::fmt::Display for BorrowRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Borrow request row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BorrowRequest {
    pub id: Uuid,
    pub requested_by: Uuid,
    pub location: String,
    pub purpose: String,
    pub expected_return_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: BorrowRequestStatus,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub remarks: Option<String>,
}

/// One line of a borrow request: a type and how many units of it
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BorrowRequestItem {
    pub id: Uuid,
    pub borrow_request_id: Uuid,
    pub equipment_type_id: Uuid,
    pub quantity: i32,
}

/// Open or closed binding of a unit to a borrow request line
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BorrowTransaction {
    pub id: Uuid,
    pub equipment_id: Uuid,
    pub borrow_request_item_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Borrow request line with catalog display fields
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BorrowLine {
    pub borrow_request_item_id: Uuid,
    pub equipment_type_id: Uuid,
    pub name: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub image_url: Option<String>,
    pub quantity: i32,
}

/// Requested line of a new borrow request
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BorrowItemInput {
    pub equipment_type_id: Uuid,
    pub quantity: i32,
}

/// Create borrow request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateBorrowRequest {
    pub requested_by: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub location: String,
    #[validate(length(min = 1, max = 1000))]
    pub purpose: String,
    pub expected_return_at: DateTime<Utc>,
    pub equipments: Vec<BorrowItemInput>,
}

/// Reviewer decision on a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

impl From<ReviewDecision> for BorrowRequestStatus {
    fn from(d: ReviewDecision) -> Self {
        match d {
            ReviewDecision::Approved => BorrowRequestStatus::Approved,
            ReviewDecision::Rejected => BorrowRequestStatus::Rejected,
        }
    }
}

/// Review borrow request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ReviewBorrowRequest {
    pub reviewed_by: Uuid,
    pub status: ReviewDecision,
    #[validate(length(max = 1000))]
    pub remarks: Option<String>,
}

/// Outcome of a review; carries the claim code when approved
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReviewOutcome {
    pub request: BorrowRequest,
    pub claim_code: Option<IssuedOtp>,
}

/// Claim approved equipment with the one-time code
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ReceiveBorrowRequest {
    #[validate(length(min = 1, max = 32))]
    pub code: String,
}

/// Administrative status override
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdateBorrowStatus {
    pub status: BorrowRequestStatus,
}

/// Externally computed anomaly score for a borrow request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct AnomalyResult {
    pub borrow_request_id: Uuid,
    pub score: f32,
    pub is_anomaly: bool,
    pub is_false_positive: Option<bool>,
}

/// Borrow request as stored, with its lines; user ids are not yet resolved
#[derive(Debug, Clone)]
pub struct BorrowRequestRecord {
    pub request: BorrowRequest,
    pub lines: Vec<BorrowLine>,
    pub anomaly: Option<AnomalyResult>,
    /// Time of the latest confirmed return against this borrow request
    pub returned_at: Option<DateTime<Utc>>,
}

/// Borrow request with borrower and reviewer display information
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BorrowRequestDetails {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub borrower: UserBasicInfo,
    pub equipments: Vec<BorrowLine>,
    pub location: String,
    pub purpose: String,
    pub expected_return_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub status: BorrowRequestStatus,
    pub reviewed_by: Option<UserBasicInfo>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub remarks: Option<String>,
    pub anomaly_result: Option<AnomalyResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HistorySortBy {
    CreatedAt,
    ExpectedReturnAt,
    ReturnedAt,
    #[default]
    Status,
}

/// Borrow history filters
#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
pub struct HistoryQuery {
    pub user_id: Option<Uuid>,
    pub status: Option<BorrowRequestStatus>,
    /// Equipment type name
    pub category: Option<String>,
    /// Matches equipment and borrower/reviewer names
    pub search: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub sort_by: Option<HistorySortBy>,
    pub sort: Option<SortDirection>,
}

/// Outstanding borrowed equipment filters
#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
pub struct BorrowedItemsQuery {
    pub user_id: Option<Uuid>,
    pub category: Option<String>,
    /// Direction on expected return time, newest first by default
    pub sort: Option<SortDirection>,
}
