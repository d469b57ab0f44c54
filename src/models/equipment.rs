//! Equipment catalog model: types, units and computed unit status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use super::user::UserBasicInfo;

/// Catalog entry grouping interchangeable units
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct EquipmentType {
    pub id: Uuid,
    pub name: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EquipmentType {
    /// Case-insensitive search over name, brand and model
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [Some(&self.name), self.brand.as_ref(), self.model.as_ref()]
            .into_iter()
            .flatten()
            .any(|field| field.to_lowercase().contains(&needle))
    }
}

/// Normalized catalog key: name plus trimmed, lowercased brand and model
pub fn catalog_key(name: &str, brand: Option<&str>, model: Option<&str>) -> (String, String, String) {
    let normalize = |v: Option<&str>| v.map(|s| s.trim().to_lowercase()).unwrap_or_default();
    (name.to_string(), normalize(brand), normalize(model))
}

/// One physical unit of an equipment type
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Unit {
    pub id: Uuid,
    pub equipment_type_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// Status of a unit, always computed from the transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Available,
    Reserved,
    Borrowed,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            UnitStatus::Available => "available",
            UnitStatus::Reserved => "reserved",
            UnitStatus::Borrowed => "borrowed",
        };
        write!(f, "{}", label)
    }
}

/// Create equipment request: upserts the type and acquires `quantity` units
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateEquipment {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub image_url: Option<String>,
    pub acquired_at: DateTime<Utc>,
    #[validate(range(min = 1, max = 10000))]
    pub quantity: u32,
}

impl CreateEquipment {
    /// Trim text fields, turning blank brand/model into `None`
    pub fn normalized(mut self) -> Self {
        let blank_to_none = |v: Option<String>| {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        };
        self.name = self.name.trim().to_string();
        self.brand = blank_to_none(self.brand);
        self.model = blank_to_none(self.model);
        self
    }
}

/// Result of acquiring stock
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreatedEquipment {
    pub equipment_type: EquipmentType,
    pub acquired_at: DateTime<Utc>,
    pub quantity: u32,
}

/// Partial update of an equipment type
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateEquipment {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub image_url: Option<String>,
}

/// Equipment list filters
#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
pub struct EquipmentQuery {
    /// Comma-separated list of type names
    pub name: Option<String>,
    pub status: Option<UnitStatus>,
    /// Matches name, brand or model
    pub search: Option<String>,
}

impl EquipmentQuery {
    pub fn names(&self) -> Vec<String> {
        self.name
            .as_deref()
            .map(|n| {
                n.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn search(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Units of one type sharing a status and holder
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EquipmentSummary {
    pub id: Uuid,
    pub name: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub image_url: Option<String>,
    pub status: UnitStatus,
    pub quantity: u32,
    /// Borrower or reserver of these units
    pub holder: Option<UserBasicInfo>,
}

/// Unit counts for one equipment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Availability {
    pub equipment_type_id: Uuid,
    pub total: u32,
    pub available: u32,
    pub reserved: u32,
    pub borrowed: u32,
}

/// Who currently holds or reserves a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UnitHolder {
    pub user_id: Uuid,
    pub borrow_request_id: Uuid,
}

/// Resolved status of a single unit
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UnitStatusDetails {
    pub unit: Unit,
    pub status: UnitStatus,
    pub borrow_request_id: Option<Uuid>,
    pub holder: Option<UserBasicInfo>,
}
