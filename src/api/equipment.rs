//! Equipment catalog endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::equipment::{
        Availability, CreateEquipment, CreatedEquipment, EquipmentQuery, EquipmentSummary,
        EquipmentType, UnitStatusDetails, UpdateEquipment,
    },
};

/// List units grouped by type, status and holder
#[utoipa::path(
    get,
    path = "/equipment",
    tag = "equipment",
    params(EquipmentQuery),
    responses(
        (status = 200, description = "Equipment summary", body = Vec<EquipmentSummary>)
    )
)]
pub async fn list_equipment(
    State(state): State<crate::AppState>,
    Query(query): Query<EquipmentQuery>,
) -> AppResult<Json<Vec<EquipmentSummary>>> {
    let equipment = state.services.catalog.list_equipment(&query).await?;
    Ok(Json(equipment))
}

/// Acquire units of an equipment type
#[utoipa::path(
    post,
    path = "/equipment",
    tag = "equipment",
    request_body = CreateEquipment,
    responses(
        (status = 201, description = "Equipment acquired", body = CreatedEquipment),
        (status = 400, description = "Invalid request")
    )
)]
pub async fn create_equipment(
    State(state): State<crate::AppState>,
    Json(data): Json<CreateEquipment>,
) -> AppResult<(StatusCode, Json<CreatedEquipment>)> {
    let created = state.services.catalog.create_equipment(data).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Distinct names of equipment types in stock
#[utoipa::path(
    get,
    path = "/equipment-names",
    tag = "equipment",
    responses(
        (status = 200, description = "Equipment type names", body = Vec<String>)
    )
)]
pub async fn list_equipment_names(State(state): State<crate::AppState>) -> AppResult<Json<Vec<String>>> {
    let names = state.services.catalog.equipment_names().await?;
    Ok(Json(names))
}

/// Get an equipment type
#[utoipa::path(
    get,
    path = "/equipment/{id}",
    tag = "equipment",
    params(("id" = Uuid, Path, description = "Equipment type ID")),
    responses(
        (status = 200, description = "Equipment type", body = EquipmentType),
        (status = 404, description = "Equipment type not found")
    )
)]
pub async fn get_equipment_type(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<EquipmentType>> {
    let equipment_type = state.services.catalog.get_equipment_type(id).await?;
    Ok(Json(equipment_type))
}

/// Update an equipment type
#[utoipa::path(
    patch,
    path = "/equipment/{id}",
    tag = "equipment",
    params(("id" = Uuid, Path, description = "Equipment type ID")),
    request_body = UpdateEquipment,
    responses(
        (status = 200, description = "Equipment type updated", body = EquipmentType),
        (status = 404, description = "Equipment type not found")
    )
)]
pub async fn update_equipment_type(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
    Json(data): Json<UpdateEquipment>,
) -> AppResult<Json<EquipmentType>> {
    let equipment_type = state.services.catalog.update_equipment_type(id, data).await?;
    Ok(Json(equipment_type))
}

/// Unit counts for an equipment type
#[utoipa::path(
    get,
    path = "/equipment/{id}/availability",
    tag = "equipment",
    params(("id" = Uuid, Path, description = "Equipment type ID")),
    responses(
        (status = 200, description = "Availability", body = Availability),
        (status = 404, description = "Equipment type not found")
    )
)]
pub async fn get_availability(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Availability>> {
    let availability = state.services.catalog.type_availability(id).await?;
    Ok(Json(availability))
}

/// Resolved status of one unit
#[utoipa::path(
    get,
    path = "/units/{id}",
    tag = "equipment",
    params(("id" = Uuid, Path, description = "Unit ID")),
    responses(
        (status = 200, description = "Unit status", body = UnitStatusDetails),
        (status = 404, description = "Unit not found")
    )
)]
pub async fn get_unit_status(
    State(state): State<crate::AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UnitStatusDetails>> {
    let status = state.services.catalog.unit_status(id).await?;
    Ok(Json(status))
}
