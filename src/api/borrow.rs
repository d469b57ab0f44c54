//! Borrow request endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{
        borrow::{
            BorrowRequest, BorrowRequestDetails, BorrowedItemsQuery, CreateBorrowRequest,
            HistoryQuery, ReceiveBorrowRequest, ReviewBorrowRequest, ReviewOutcome,
            UpdateBorrowStatus,
        },
        IssuedOtp,
    },
};

/// Submit a borrow request
#[utoipa::path(
    post,
    path = "/borrow-requests",
    tag = "borrow",
    request_body = CreateBorrowRequest,
    responses(
        (status = 201, description = "Borrow request created", body = BorrowRequestDetails),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Equipment type not found"),
        (status = 409, description = "Requested quantity exceeds available equipment")
    )
)]
pub async fn create_borrow_request(
    State(state): State<crate::AppState>,
    Json(data): Json<CreateBorrowRequest>,
) -> AppResult<(StatusCode, Json<BorrowRequestDetails>)> {
    let created = state.services.borrows.submit(data).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Pending borrow requests awaiting review
#[utoipa::path(
    get,
    path = "/borrow-requests",
    tag = "borrow",
    responses(
        (status = 200, description = "Pending borrow requests", body = Vec<BorrowRequestDetails>)
    )
)]
pub async fn list_pending_borrow_requests(
    State(state): State<crate::AppState>,
) -> AppResult<Json<Vec<BorrowRequestDetails>>> {
    let requests = state.services.borrows.list_pending().await?;
    Ok(Json(requests))
}

/// Get a borrow request
#[utoipa::path(
    get,
    path = "/borrow-requests/{id}",
    tag = "borrow",
    params(("id" = Uuid, Path, description = "Borrow request ID")),
    responses(
        (status = 200, description = "Borrow request details", body = BorrowRequestDetails),
        (status = 404, description = "Borrow request not found")
    )
)]
pub async fn get_borrow_request(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<BorrowRequestDetails>> {
    let request = state.services.borrows.get(id).await?;
    Ok(Json(request))
}

/// Approve or reject a pending borrow request
#[utoipa::path(
    post,
    path = "/borrow-requests/{id}/review",
    tag = "borrow",
    params(("id" = Uuid, Path, description = "Borrow request ID")),
    request_body = ReviewBorrowRequest,
    responses(
        (status = 200, description = "Borrow request reviewed", body = ReviewOutcome),
        (status = 404, description = "Borrow request not found"),
        (status = 409, description = "Request is not pending or stock is insufficient")
    )
)]
pub async fn review_borrow_request(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
    Json(data): Json<ReviewBorrowRequest>,
) -> AppResult<Json<ReviewOutcome>> {
    let outcome = state.services.borrows.review(id, data).await?;
    Ok(Json(outcome))
}

/// Claim approved equipment with the one-time code
#[utoipa::path(
    post,
    path = "/borrow-requests/{id}/receive",
    tag = "borrow",
    params(("id" = Uuid, Path, description = "Borrow request ID")),
    request_body = ReceiveBorrowRequest,
    responses(
        (status = 200, description = "Equipment received", body = BorrowRequest),
        (status = 403, description = "Invalid or expired code"),
        (status = 409, description = "Request is not approved")
    )
)]
pub async fn receive_borrow_request(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
    Json(data): Json<ReceiveBorrowRequest>,
) -> AppResult<Json<BorrowRequest>> {
    let request = state.services.borrows.receive(id, data).await?;
    Ok(Json(request))
}

/// Current claim code of an approved borrow request
#[utoipa::path(
    get,
    path = "/borrow-requests/{id}/claim-code",
    tag = "borrow",
    params(("id" = Uuid, Path, description = "Borrow request ID")),
    responses(
        (status = 200, description = "Live claim code", body = IssuedOtp),
        (status = 404, description = "No live claim code")
    )
)]
pub async fn get_claim_code(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<IssuedOtp>> {
    let code = state.services.borrows.claim_code(id).await?;
    Ok(Json(code))
}

/// Administrative status change
#[utoipa::path(
    patch,
    path = "/borrow-requests/{id}/status",
    tag = "borrow",
    params(("id" = Uuid, Path, description = "Borrow request ID")),
    request_body = UpdateBorrowStatus,
    responses(
        (status = 200, description = "Status updated", body = BorrowRequest),
        (status = 404, description = "Borrow request not found"),
        (status = 409, description = "Transition not allowed")
    )
)]
pub async fn update_borrow_status(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
    Json(data): Json<UpdateBorrowStatus>,
) -> AppResult<Json<BorrowRequest>> {
    let request = state.services.borrows.update_status(id, data).await?;
    Ok(Json(request))
}

/// Borrow history with filters and sorting
#[utoipa::path(
    get,
    path = "/borrow-history",
    tag = "borrow",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Borrow history", body = Vec<BorrowRequestDetails>)
    )
)]
pub async fn get_borrow_history(
    State(state): State<crate::AppState>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<BorrowRequestDetails>>> {
    let history = state.services.borrows.history(&query).await?;
    Ok(Json(history))
}

/// Equipment currently out, per received borrow request
#[utoipa::path(
    get,
    path = "/borrowed-items",
    tag = "borrow",
    params(BorrowedItemsQuery),
    responses(
        (status = 200, description = "Outstanding borrowed equipment", body = Vec<BorrowRequestDetails>)
    )
)]
pub async fn get_borrowed_items(
    State(state): State<crate::AppState>,
    Query(query): Query<BorrowedItemsQuery>,
) -> AppResult<Json<Vec<BorrowRequestDetails>>> {
    let items = state.services.borrows.borrowed_items(&query).await?;
    Ok(Json(items))
}
