//! Equipment catalog on PostgreSQL

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::load_ledgers;
use crate::{
    error::{AppError, AppResult},
    lending::TypeLedger,
    models::equipment::{CreateEquipment, CreatedEquipment, EquipmentType, Unit, UpdateEquipment},
    repository::CatalogRepository,
};

#[derive(Clone)]
pub struct PgCatalogRepository {
    pool: Pool<Postgres>,
}

impl PgCatalogRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn catalog_conflict(e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Validation("an equipment type with this name, brand and model already exists".to_string())
        }
        _ => AppError::Database(e),
    }
}

#[async_trait]
impl CatalogRepository for PgCatalogRepository {
    async fn create_equipment(&self, input: &CreateEquipment, now: DateTime<Utc>) -> AppResult<CreatedEquipment> {
        let mut tx = self.pool.begin().await?;

        let equipment_type = sqlx::query_as::<_, EquipmentType>(
            r#"
            INSERT INTO equipment_type (id, name, brand, model, image_url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name, (COALESCE(LOWER(TRIM(brand)), '')), (COALESCE(LOWER(TRIM(model)), '')))
            DO UPDATE SET image_url = COALESCE(EXCLUDED.image_url, equipment_type.image_url)
            RETURNING id, name, brand, model, image_url, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.brand)
        .bind(&input.model)
        .bind(&input.image_url)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let unit_ids: Vec<Uuid> = (0..input.quantity).map(|_| Uuid::new_v4()).collect();
        sqlx::query(
            r#"
            INSERT INTO equipment (id, equipment_type_id, acquired_at)
            SELECT unit_id, $2, $3 FROM UNNEST($1::uuid[]) AS unit_id
            "#,
        )
        .bind(&unit_ids)
        .bind(equipment_type.id)
        .bind(input.acquired_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CreatedEquipment {
            equipment_type,
            acquired_at: input.acquired_at,
            quantity: input.quantity,
        })
    }

    async fn get_type(&self, id: Uuid) -> AppResult<EquipmentType> {
        sqlx::query_as::<_, EquipmentType>(
            "SELECT id, name, brand, model, image_url, created_at FROM equipment_type WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Equipment type {} not found", id)))
    }

    async fn update_type(&self, id: Uuid, changes: &UpdateEquipment) -> AppResult<EquipmentType> {
        sqlx::query_as::<_, EquipmentType>(
            r#"
            UPDATE equipment_type
            SET name = COALESCE($2, name),
                brand = COALESCE($3, brand),
                model = COALESCE($4, model),
                image_url = COALESCE($5, image_url)
            WHERE id = $1
            RETURNING id, name, brand, model, image_url, created_at
            "#,
        )
        .bind(id)
        .bind(&changes.name)
        .bind(&changes.brand)
        .bind(&changes.model)
        .bind(&changes.image_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(catalog_conflict)?
        .ok_or_else(|| AppError::NotFound(format!("Equipment type {} not found", id)))
    }

    async fn equipment_names(&self) -> AppResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT et.name
            FROM equipment_type et
            WHERE EXISTS (SELECT 1 FROM equipment e WHERE e.equipment_type_id = et.id)
            ORDER BY et.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn get_unit(&self, id: Uuid) -> AppResult<Unit> {
        sqlx::query_as::<_, Unit>("SELECT id, equipment_type_id, acquired_at FROM equipment WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Equipment unit {} not found", id)))
    }

    async fn ledger(&self, type_id: Uuid) -> AppResult<TypeLedger> {
        let mut conn = self.pool.acquire().await?;
        load_ledgers(&mut conn, Some(&[type_id]))
            .await?
            .remove(&type_id)
            .ok_or_else(|| AppError::NotFound(format!("Equipment type {} not found", type_id)))
    }

    async fn ledgers(&self) -> AppResult<Vec<(EquipmentType, TypeLedger)>> {
        let mut conn = self.pool.acquire().await?;
        let types = sqlx::query_as::<_, EquipmentType>(
            r#"
            SELECT id, name, brand, model, image_url, created_at
            FROM equipment_type
            ORDER BY name, brand NULLS FIRST, model NULLS FIRST
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut ledgers = load_ledgers(&mut conn, None).await?;
        Ok(types
            .into_iter()
            .filter_map(|t| ledgers.remove(&t.id).map(|l| (t, l)))
            .collect())
    }
}
