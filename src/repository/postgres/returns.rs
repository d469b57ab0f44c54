//! Return request pipeline on PostgreSQL

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Pool, Postgres};
use uuid::Uuid;

use super::{delete_otp, find_otp, issue_otp, outstanding_units, return_records, OtpKind};
use crate::{
    error::{AppError, AppResult},
    lending::{lifecycle, OtpPolicy},
    models::{
        borrow::BorrowRequestStatus,
        returns::{
            ConfirmedReturn, CreatedReturnRequest, ReturnRequest, ReturnRequestItem, ReturnRequestQuery,
            ReturnRequestRecord,
        },
    },
    repository::{Confirmation, ReturnRepository},
};

const COLUMNS: &str = "rr.id, rr.borrow_request_id, rr.created_at, rr.confirmed_by, rr.confirmed_at, rr.remarks";

#[derive(Clone)]
pub struct PgReturnRepository {
    pool: Pool<Postgres>,
}

impl PgReturnRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

/// Open borrow transactions of a line, lowest id first
async fn open_transactions(conn: &mut PgConnection, borrow_request_item_id: Uuid) -> AppResult<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT bt.id
        FROM borrow_transaction bt
        WHERE bt.borrow_request_item_id = $1
          AND NOT EXISTS (
              SELECT 1 FROM return_transaction rt
              WHERE rt.borrow_transaction_id = bt.id
          )
        ORDER BY bt.id
        "#,
    )
    .bind(borrow_request_item_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

/// Quantity of a line already handed back through confirmed return requests
async fn already_returned(conn: &mut PgConnection, borrow_request_item_id: Uuid) -> AppResult<i64> {
    let returned: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(rri.quantity), 0)::BIGINT
        FROM return_request_item rri
        WHERE rri.borrow_request_item_id = $1
          AND EXISTS (
              SELECT 1 FROM return_transaction rt
              WHERE rt.return_request_item_id = rri.id
          )
        "#,
    )
    .bind(borrow_request_item_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(returned)
}

#[async_trait]
impl ReturnRepository for PgReturnRepository {
    async fn create(
        &self,
        items: &[(Uuid, u32)],
        policy: &OtpPolicy,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<CreatedReturnRequest>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = items.iter().map(|(id, _)| *id).collect();
        let lines: HashMap<Uuid, (Uuid, i32, BorrowRequestStatus)> =
            sqlx::query_as::<_, (Uuid, Uuid, i32, BorrowRequestStatus)>(
                r#"
                SELECT bri.id, bri.borrow_request_id, bri.quantity, br.status
                FROM borrow_request_item bri
                JOIN borrow_request br ON br.id = bri.borrow_request_id
                WHERE bri.id = ANY($1)
                ORDER BY bri.id
                FOR UPDATE OF bri
                "#,
            )
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|(id, parent, quantity, status)| (id, (parent, quantity, status)))
            .collect();

        let mut groups: Vec<(Uuid, Vec<(Uuid, u32)>)> = Vec::new();
        for (item_id, quantity) in items {
            let (parent, borrowed, status) = lines
                .get(item_id)
                .copied()
                .ok_or_else(|| AppError::NotFound(format!("Borrowed item {} not found", item_id)))?;
            lifecycle::check_returnable(status)?;

            let returned = already_returned(&mut tx, *item_id).await?;
            let open = open_transactions(&mut tx, *item_id).await?.len();
            lifecycle::check_return_quantity(borrowed.max(0) as u32, returned.max(0) as u32, open as u32, *quantity)?;

            match groups.iter_mut().find(|(p, _)| *p == parent) {
                Some((_, group)) => group.push((*item_id, *quantity)),
                None => groups.push((parent, vec![(*item_id, *quantity)])),
            }
        }

        let mut created = Vec::with_capacity(groups.len());
        for (borrow_request_id, group) in groups {
            let request = sqlx::query_as::<_, ReturnRequest>(&format!(
                r#"
                INSERT INTO return_request AS rr (id, borrow_request_id, created_at)
                VALUES ($1, $2, $3)
                RETURNING {}
                "#,
                COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(borrow_request_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            let mut request_items = Vec::with_capacity(group.len());
            for (item_id, quantity) in group {
                let item = sqlx::query_as::<_, ReturnRequestItem>(
                    r#"
                    INSERT INTO return_request_item (id, return_request_id, borrow_request_item_id, quantity)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id, return_request_id, borrow_request_item_id, quantity
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(request.id)
                .bind(item_id)
                .bind(quantity as i32)
                .fetch_one(&mut *tx)
                .await?;
                request_items.push(item);
            }

            let code = issue_otp(&mut tx, OtpKind::Return, request.id, policy, now).await?;
            created.push(CreatedReturnRequest {
                id: request.id,
                borrow_request_id,
                created_at: request.created_at,
                items: request_items,
                code,
            });
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn confirm(&self, id: Uuid, confirmation: &Confirmation, now: DateTime<Utc>) -> AppResult<ConfirmedReturn> {
        let mut tx = self.pool.begin().await?;

        let request = sqlx::query_as::<_, ReturnRequest>(&format!(
            "SELECT {} FROM return_request rr WHERE rr.id = $1 FOR UPDATE",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Return request {} not found", id)))?;

        if request.confirmed_at.is_some() {
            return Err(AppError::AlreadyConfirmed);
        }

        let parent_status: BorrowRequestStatus =
            sqlx::query_scalar("SELECT status FROM borrow_request WHERE id = $1 FOR UPDATE")
                .bind(request.borrow_request_id)
                .fetch_one(&mut *tx)
                .await?;

        let items = sqlx::query_as::<_, ReturnRequestItem>(
            r#"
            SELECT id, return_request_id, borrow_request_item_id, quantity
            FROM return_request_item
            WHERE return_request_id = $1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let line_ids: Vec<Uuid> = items.iter().map(|i| i.borrow_request_item_id).collect();
        sqlx::query("SELECT id FROM borrow_request_item WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(&line_ids)
            .execute(&mut *tx)
            .await?;

        let confirmed_before: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM return_transaction rt
                JOIN return_request_item rri ON rri.id = rt.return_request_item_id
                WHERE rri.return_request_id = $1
            )
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if confirmed_before {
            return Err(AppError::AlreadyConfirmed);
        }

        if let Some(code) = &confirmation.code {
            match find_otp(&mut tx, OtpKind::Return, id).await? {
                Some(otp) if &otp.code == code && otp.is_live(now) => {}
                _ => return Err(AppError::InvalidOrExpiredCode),
            }
        }

        let mut returned_units = 0u32;
        for item in &items {
            let open = open_transactions(&mut tx, item.borrow_request_item_id).await?;
            let quantity = item.quantity.max(0) as usize;
            if quantity > open.len() {
                return Err(AppError::ExceedsRemainingQuantity);
            }
            for borrow_transaction_id in open.into_iter().take(quantity) {
                sqlx::query(
                    r#"
                    INSERT INTO return_transaction (id, borrow_transaction_id, return_request_item_id, created_at)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(borrow_transaction_id)
                .bind(item.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                returned_units += 1;
            }
        }

        let borrow_request_status = if outstanding_units(&mut tx, request.borrow_request_id).await? == 0 {
            sqlx::query("UPDATE borrow_request SET status = 'fulfilled' WHERE id = $1 AND status = 'received'")
                .bind(request.borrow_request_id)
                .execute(&mut *tx)
                .await?;
            BorrowRequestStatus::Fulfilled
        } else {
            parent_status
        };

        sqlx::query(
            r#"
            UPDATE return_request
            SET confirmed_by = $2, confirmed_at = $3, remarks = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(confirmation.confirmed_by)
        .bind(now)
        .bind(&confirmation.remarks)
        .execute(&mut *tx)
        .await?;

        delete_otp(&mut tx, OtpKind::Return, id).await?;
        tx.commit().await?;

        Ok(ConfirmedReturn {
            return_request_id: id,
            borrow_request_id: request.borrow_request_id,
            returned_units,
            borrow_request_status,
        })
    }

    async fn get(&self, id: Uuid) -> AppResult<ReturnRequestRecord> {
        let request = sqlx::query_as::<_, ReturnRequest>(&format!(
            "SELECT {} FROM return_request rr WHERE rr.id = $1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Return request {} not found", id)))?;

        return_records(&self.pool, vec![request])
            .await?
            .pop()
            .ok_or_else(|| AppError::NotFound(format!("Return request {} not found", id)))
    }

    async fn list_unconfirmed(&self, query: &ReturnRequestQuery) -> AppResult<Vec<ReturnRequestRecord>> {
        let requests = sqlx::query_as::<_, ReturnRequest>(&format!(
            r#"
            SELECT {}
            FROM return_request rr
            JOIN borrow_request br ON br.id = rr.borrow_request_id
            WHERE rr.confirmed_at IS NULL
              AND ($1::uuid IS NULL OR br.requested_by = $1)
              AND ($2::text IS NULL OR EXISTS (
                  SELECT 1
                  FROM return_request_item rri
                  JOIN borrow_request_item bri ON bri.id = rri.borrow_request_item_id
                  JOIN equipment_type et ON et.id = bri.equipment_type_id
                  WHERE rri.return_request_id = rr.id AND LOWER(et.name) = LOWER($2)
              ))
            "#,
            COLUMNS
        ))
        .bind(query.user_id)
        .bind(&query.category)
        .fetch_all(&self.pool)
        .await?;

        return_records(&self.pool, requests).await
    }
}
