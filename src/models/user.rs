//! User display information resolved through the user directory

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Display fields attached to borrowers and reviewers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct UserBasicInfo {
    pub id: Uuid,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub avatar_url: Option<String>,
}

impl UserBasicInfo {
    /// Case-insensitive match against any part of the name
    pub fn name_matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.first_name.to_lowercase().contains(&needle)
            || self.last_name.to_lowercase().contains(&needle)
            || self
                .middle_name
                .as_deref()
                .map(|m| m.to_lowercase().contains(&needle))
                .unwrap_or(false)
    }
}
