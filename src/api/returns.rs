//! Return request endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{
        returns::{
            ConfirmReturnRequest, ConfirmedReturn, CreateReturnRequest, CreatedReturnRequest,
            ReturnRequestDetails, ReturnRequestQuery,
        },
        IssuedOtp,
    },
};

/// Hand back borrowed units; one return request is created per borrow request
#[utoipa::path(
    post,
    path = "/return-requests",
    tag = "returns",
    request_body = CreateReturnRequest,
    responses(
        (status = 201, description = "Return requests created", body = Vec<CreatedReturnRequest>),
        (status = 404, description = "Borrowed line not found"),
        (status = 409, description = "Line already returned or quantity too high")
    )
)]
pub async fn create_return_request(
    State(state): State<crate::AppState>,
    Json(data): Json<CreateReturnRequest>,
) -> AppResult<(StatusCode, Json<Vec<CreatedReturnRequest>>)> {
    let created = state.services.returns.submit(data).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Unconfirmed return requests
#[utoipa::path(
    get,
    path = "/return-requests",
    tag = "returns",
    params(ReturnRequestQuery),
    responses(
        (status = 200, description = "Return requests awaiting confirmation", body = Vec<ReturnRequestDetails>)
    )
)]
pub async fn list_return_requests(
    State(state): State<crate::AppState>,
    Query(query): Query<ReturnRequestQuery>,
) -> AppResult<Json<Vec<ReturnRequestDetails>>> {
    let requests = state.services.returns.list(&query).await?;
    Ok(Json(requests))
}

/// Get a return request
#[utoipa::path(
    get,
    path = "/return-requests/{id}",
    tag = "returns",
    params(("id" = Uuid, Path, description = "Return request ID")),
    responses(
        (status = 200, description = "Return request details", body = ReturnRequestDetails),
        (status = 404, description = "Return request not found")
    )
)]
pub async fn get_return_request(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ReturnRequestDetails>> {
    let request = state.services.returns.get(id).await?;
    Ok(Json(request))
}

/// Confirm a return request
#[utoipa::path(
    post,
    path = "/return-requests/{id}/confirm",
    tag = "returns",
    params(("id" = Uuid, Path, description = "Return request ID")),
    request_body = ConfirmReturnRequest,
    responses(
        (status = 200, description = "Return confirmed", body = ConfirmedReturn),
        (status = 403, description = "Invalid or expired code"),
        (status = 409, description = "Already confirmed")
    )
)]
pub async fn confirm_return_request(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
    Json(data): Json<ConfirmReturnRequest>,
) -> AppResult<Json<ConfirmedReturn>> {
    let confirmed = state.services.returns.confirm(id, data).await?;
    Ok(Json(confirmed))
}

/// Current return code of an unconfirmed return request
#[utoipa::path(
    get,
    path = "/return-requests/{id}/code",
    tag = "returns",
    params(("id" = Uuid, Path, description = "Return request ID")),
    responses(
        (status = 200, description = "Live return code", body = IssuedOtp),
        (status = 404, description = "No live return code")
    )
)]
pub async fn get_return_code(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<IssuedOtp>> {
    let code = state.services.returns.return_code(id).await?;
    Ok(Json(code))
}
