//! OpenAPI documentation

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{borrow, equipment, health, returns};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Equipment Lending API",
        version = "1.0.0",
        description = "Reservation, claim and return engine for a shared equipment pool"
    ),
    servers(
        (url = "/api/v1", description = "API v1")
    ),
    paths(
        // Health
        health::health_check,
        health::readiness_check,
        // Equipment
        equipment::list_equipment,
        equipment::create_equipment,
        equipment::list_equipment_names,
        equipment::get_equipment_type,
        equipment::update_equipment_type,
        equipment::get_availability,
        equipment::get_unit_status,
        // Borrow requests
        borrow::create_borrow_request,
        borrow::list_pending_borrow_requests,
        borrow::get_borrow_request,
        borrow::review_borrow_request,
        borrow::receive_borrow_request,
        borrow::get_claim_code,
        borrow::update_borrow_status,
        borrow::get_borrow_history,
        borrow::get_borrowed_items,
        // Return requests
        returns::create_return_request,
        returns::list_return_requests,
        returns::get_return_request,
        returns::confirm_return_request,
        returns::get_return_code,
    ),
    components(
        schemas(
            // Equipment
            crate::models::equipment::EquipmentType,
            crate::models::equipment::Unit,
            crate::models::equipment::UnitStatus,
            crate::models::equipment::CreateEquipment,
            crate::models::equipment::CreatedEquipment,
            crate::models::equipment::UpdateEquipment,
            crate::models::equipment::EquipmentSummary,
            crate::models::equipment::Availability,
            crate::models::equipment::UnitStatusDetails,
            crate::models::user::UserBasicInfo,
            // Borrow requests
            crate::models::borrow::BorrowRequestStatus,
            crate::models::borrow::BorrowRequest,
            crate::models::borrow::BorrowLine,
            crate::models::borrow::BorrowItemInput,
            crate::models::borrow::CreateBorrowRequest,
            crate::models::borrow::ReviewDecision,
            crate::models::borrow::ReviewBorrowRequest,
            crate::models::borrow::ReviewOutcome,
            crate::models::borrow::ReceiveBorrowRequest,
            crate::models::borrow::UpdateBorrowStatus,
            crate::models::borrow::AnomalyResult,
            crate::models::borrow::BorrowRequestDetails,
            crate::models::borrow::SortDirection,
            crate::models::borrow::HistorySortBy,
            crate::models::otp::IssuedOtp,
            // Return requests
            crate::models::returns::ReturnRequestItem,
            crate::models::returns::ReturnItemInput,
            crate::models::returns::CreateReturnRequest,
            crate::models::returns::CreatedReturnRequest,
            crate::models::returns::ConfirmReturnRequest,
            crate::models::returns::ConfirmedReturn,
            crate::models::returns::ReturnLine,
            crate::models::returns::ReturnRequestDetails,
            // Health
            health::HealthResponse,
            // Errors
            crate::error::ErrorResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "equipment", description = "Equipment catalog and availability"),
        (name = "borrow", description = "Borrow requests, review and claim"),
        (name = "returns", description = "Return requests and confirmation")
    )
)]
pub struct ApiDoc;

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
