//! User directory backed by the `person` table

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::UserBasicInfo,
    repository::UserDirectory,
};

#[derive(Clone)]
pub struct PgUserDirectory {
    pool: Pool<Postgres>,
}

impl PgUserDirectory {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn basic_info(&self, user_id: Uuid) -> AppResult<UserBasicInfo> {
        sqlx::query_as::<_, UserBasicInfo>(
            "SELECT id, first_name, middle_name, last_name, avatar_url FROM person WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::Collaborator(format!("User {} not found in directory", user_id)))
    }

    async fn basic_info_many(&self, user_ids: &[Uuid]) -> AppResult<HashMap<Uuid, UserBasicInfo>> {
        let users = sqlx::query_as::<_, UserBasicInfo>(
            "SELECT id, first_name, middle_name, last_name, avatar_url FROM person WHERE id = ANY($1)",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        let resolved: HashMap<Uuid, UserBasicInfo> = users.into_iter().map(|u| (u.id, u)).collect();
        if let Some(missing) = user_ids.iter().find(|id| !resolved.contains_key(id)) {
            return Err(AppError::Collaborator(format!("User {} not found in directory", missing)));
        }
        Ok(resolved)
    }
}
