//! Borrow request pipeline on PostgreSQL

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Pool, Postgres};
use uuid::Uuid;

use super::{
    borrow_records, delete_otp, find_otp, issue_otp, like_pattern, load_ledgers, lock_types,
    outstanding_units, OtpKind,
};
use crate::{
    error::{AppError, AppResult},
    lending::{lifecycle, OtpPolicy, OverrideAction},
    models::borrow::{
        AnomalyResult, BorrowRequest, BorrowRequestItem, BorrowRequestRecord, BorrowRequestStatus,
        BorrowedItemsQuery, HistoryQuery, ReviewDecision,
    },
    models::IssuedOtp,
    repository::{BorrowRepository, NewBorrowRequest, Review},
};

const COLUMNS: &str = "br.id, br.requested_by, br.location, br.purpose, br.expected_return_at, \
                       br.created_at, br.status, br.reviewed_by, br.reviewed_at, br.remarks";

#[derive(Clone)]
pub struct PgBorrowRepository {
    pool: Pool<Postgres>,
}

impl PgBorrowRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

async fn lock_request(conn: &mut PgConnection, id: Uuid) -> AppResult<BorrowRequest> {
    sqlx::query_as::<_, BorrowRequest>(&format!(
        "SELECT {} FROM borrow_request br WHERE br.id = $1 FOR UPDATE",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Borrow request {} not found", id)))
}

async fn set_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: BorrowRequestStatus,
) -> AppResult<BorrowRequest> {
    let request = sqlx::query_as::<_, BorrowRequest>(&format!(
        "UPDATE borrow_request br SET status = $2 WHERE br.id = $1 RETURNING {}",
        COLUMNS
    ))
    .bind(id)
    .bind(status)
    .fetch_one(&mut *conn)
    .await?;
    Ok(request)
}

/// Quantity per type across the request's lines
async fn quantities_by_type(conn: &mut PgConnection, id: Uuid) -> AppResult<Vec<(Uuid, u32)>> {
    let rows: Vec<(Uuid, i64)> = sqlx::query_as(
        r#"
        SELECT equipment_type_id, SUM(quantity)::BIGINT
        FROM borrow_request_item
        WHERE borrow_request_id = $1
        GROUP BY equipment_type_id
        ORDER BY equipment_type_id
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(t, q)| (t, q.max(0) as u32)).collect())
}

/// Bind the first unborrowed units of each type to the request's lines.
/// Fails without writing anything if any type is short.
async fn allocate(conn: &mut PgConnection, id: Uuid, now: DateTime<Utc>) -> AppResult<u32> {
    let items = sqlx::query_as::<_, BorrowRequestItem>(
        r#"
        SELECT id, borrow_request_id, equipment_type_id, quantity
        FROM borrow_request_item
        WHERE borrow_request_id = $1
        ORDER BY id
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    let totals = quantities_by_type(&mut *conn, id).await?;
    let type_ids: Vec<Uuid> = totals.iter().map(|(t, _)| *t).collect();
    lock_types(&mut *conn, &type_ids).await?;
    let ledgers = load_ledgers(&mut *conn, Some(&type_ids)).await?;

    let mut picks = HashMap::new();
    for (type_id, quantity) in &totals {
        let units = ledgers
            .get(type_id)
            .and_then(|l| l.select_for_claim(*quantity))
            .ok_or(AppError::InsufficientQuantity)?;
        picks.insert(*type_id, units.into_iter());
    }

    let mut bound = 0u32;
    for item in &items {
        let units = picks
            .get_mut(&item.equipment_type_id)
            .ok_or(AppError::InsufficientQuantity)?;
        for _ in 0..item.quantity {
            let unit_id = units.next().ok_or(AppError::InsufficientQuantity)?;
            sqlx::query(
                r#"
                INSERT INTO borrow_transaction (id, equipment_id, borrow_request_item_id, created_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(unit_id)
            .bind(item.id)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            bound += 1;
        }
    }

    Ok(bound)
}

#[async_trait]
impl BorrowRepository for PgBorrowRepository {
    async fn create(&self, request: &NewBorrowRequest, now: DateTime<Utc>) -> AppResult<BorrowRequestRecord> {
        let mut tx = self.pool.begin().await?;

        let type_ids: Vec<Uuid> = request.items.iter().map(|(t, _)| *t).collect();
        let ledgers = load_ledgers(&mut tx, Some(&type_ids)).await?;
        for (type_id, quantity) in &request.items {
            let ledger = ledgers
                .get(type_id)
                .ok_or_else(|| AppError::NotFound(format!("Equipment type {} not found", type_id)))?;
            if *quantity > ledger.truly_available() {
                return Err(AppError::InsufficientQuantity);
            }
        }

        let id = Uuid::new_v4();
        let created = sqlx::query_as::<_, BorrowRequest>(&format!(
            r#"
            INSERT INTO borrow_request AS br
                (id, requested_by, location, purpose, expected_return_at, created_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(request.requested_by)
        .bind(&request.location)
        .bind(&request.purpose)
        .bind(request.expected_return_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for (type_id, quantity) in &request.items {
            sqlx::query(
                r#"
                INSERT INTO borrow_request_item (id, borrow_request_id, equipment_type_id, quantity)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(type_id)
            .bind(*quantity as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        borrow_records(&self.pool, vec![created])
            .await?
            .pop()
            .ok_or_else(|| AppError::Internal(format!("Borrow request {} vanished", id)))
    }

    async fn get(&self, id: Uuid) -> AppResult<BorrowRequestRecord> {
        let request = sqlx::query_as::<_, BorrowRequest>(&format!(
            "SELECT {} FROM borrow_request br WHERE br.id = $1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Borrow request {} not found", id)))?;

        borrow_records(&self.pool, vec![request])
            .await?
            .pop()
            .ok_or_else(|| AppError::NotFound(format!("Borrow request {} not found", id)))
    }

    async fn review(
        &self,
        id: Uuid,
        review: &Review,
        policy: &OtpPolicy,
        now: DateTime<Utc>,
    ) -> AppResult<(BorrowRequest, Option<IssuedOtp>)> {
        let mut tx = self.pool.begin().await?;

        let current = lock_request(&mut tx, id).await?;
        lifecycle::check_reviewable(current.status)?;

        if review.decision == ReviewDecision::Approved {
            let wanted = quantities_by_type(&mut tx, id).await?;
            let type_ids: Vec<Uuid> = wanted.iter().map(|(t, _)| *t).collect();
            lock_types(&mut tx, &type_ids).await?;
            let ledgers = load_ledgers(&mut tx, Some(&type_ids)).await?;

            for (type_id, quantity) in &wanted {
                let fits = ledgers
                    .get(type_id)
                    .map(|l| l.can_reserve(*quantity))
                    .unwrap_or(false);
                if !fits {
                    return Err(AppError::InsufficientQuantity);
                }
            }
        }

        let status: BorrowRequestStatus = review.decision.into();
        let updated = sqlx::query_as::<_, BorrowRequest>(&format!(
            r#"
            UPDATE borrow_request br
            SET status = $2, reviewed_by = $3, reviewed_at = $4, remarks = $5
            WHERE br.id = $1
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id)
        .bind(status)
        .bind(review.reviewed_by)
        .bind(now)
        .bind(&review.remarks)
        .fetch_one(&mut *tx)
        .await?;

        let claim_code = match review.decision {
            ReviewDecision::Approved => Some(issue_otp(&mut tx, OtpKind::Claim, id, policy, now).await?),
            ReviewDecision::Rejected => None,
        };

        tx.commit().await?;
        Ok((updated, claim_code))
    }

    async fn receive(&self, id: Uuid, code: &str, now: DateTime<Utc>) -> AppResult<BorrowRequest> {
        let mut tx = self.pool.begin().await?;

        let current = lock_request(&mut tx, id).await?;
        match find_otp(&mut tx, OtpKind::Claim, id).await? {
            Some(otp) if otp.code == code && otp.is_live(now) => {}
            _ => return Err(AppError::InvalidOrExpiredCode),
        }
        lifecycle::check_claimable(current.status)?;

        allocate(&mut tx, id, now).await?;
        let updated = set_status(&mut tx, id, BorrowRequestStatus::Received).await?;
        delete_otp(&mut tx, OtpKind::Claim, id).await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn override_status(
        &self,
        id: Uuid,
        target: BorrowRequestStatus,
        now: DateTime<Utc>,
    ) -> AppResult<BorrowRequest> {
        let mut tx = self.pool.begin().await?;

        let current = lock_request(&mut tx, id).await?;
        match lifecycle::check_override(current.status, target)? {
            OverrideAction::Allocate => {
                allocate(&mut tx, id, now).await?;
                delete_otp(&mut tx, OtpKind::Claim, id).await?;
            }
            OverrideAction::Fulfil => {
                if outstanding_units(&mut tx, id).await? > 0 {
                    return Err(AppError::InvalidBorrowRequestStatus(
                        "units are still borrowed".to_string(),
                    ));
                }
            }
            OverrideAction::Release => delete_otp(&mut tx, OtpKind::Claim, id).await?,
            OverrideAction::Reject => {}
        }

        let updated = set_status(&mut tx, id, target).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn list_pending(&self) -> AppResult<Vec<BorrowRequestRecord>> {
        let requests = sqlx::query_as::<_, BorrowRequest>(&format!(
            "SELECT {} FROM borrow_request br WHERE br.status = 'pending' ORDER BY br.created_at, br.id",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        borrow_records(&self.pool, requests).await
    }

    async fn history(&self, query: &HistoryQuery) -> AppResult<Vec<BorrowRequestRecord>> {
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);

        let requests = sqlx::query_as::<_, BorrowRequest>(&format!(
            r#"
            SELECT {}
            FROM borrow_request br
            LEFT JOIN person p ON p.id = br.requested_by
            LEFT JOIN person rv ON rv.id = br.reviewed_by
            WHERE ($1::uuid IS NULL OR br.requested_by = $1)
              AND ($2::borrow_request_status IS NULL OR br.status = $2)
              AND ($3::text IS NULL OR EXISTS (
                  SELECT 1
                  FROM borrow_request_item bri
                  JOIN equipment_type et ON et.id = bri.equipment_type_id
                  WHERE bri.borrow_request_id = br.id AND LOWER(et.name) = LOWER($3)
              ))
              AND ($4::text IS NULL
                   OR EXISTS (
                       SELECT 1
                       FROM borrow_request_item bri
                       JOIN equipment_type et ON et.id = bri.equipment_type_id
                       WHERE bri.borrow_request_id = br.id
                         AND (et.name ILIKE $4 OR et.brand ILIKE $4 OR et.model ILIKE $4)
                   )
                   OR p.first_name ILIKE $4 OR p.middle_name ILIKE $4 OR p.last_name ILIKE $4
                   OR rv.first_name ILIKE $4 OR rv.middle_name ILIKE $4 OR rv.last_name ILIKE $4)
              AND ($5::timestamptz IS NULL OR br.created_at >= $5)
              AND ($6::timestamptz IS NULL OR br.created_at <= $6)
            "#,
            COLUMNS
        ))
        .bind(query.user_id)
        .bind(query.status)
        .bind(&query.category)
        .bind(search)
        .bind(query.from)
        .bind(query.to)
        .fetch_all(&self.pool)
        .await?;

        borrow_records(&self.pool, requests).await
    }

    async fn borrowed_items(&self, query: &BorrowedItemsQuery) -> AppResult<Vec<BorrowRequestRecord>> {
        let requests = sqlx::query_as::<_, BorrowRequest>(&format!(
            r#"
            SELECT {}
            FROM borrow_request br
            WHERE br.status = 'received'
              AND ($1::uuid IS NULL OR br.requested_by = $1)
            "#,
            COLUMNS
        ))
        .bind(query.user_id)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();
        let outstanding: HashMap<Uuid, i64> = sqlx::query_as::<_, (Uuid, i64)>(
            r#"
            SELECT bt.borrow_request_item_id, COUNT(*)
            FROM borrow_transaction bt
            JOIN borrow_request_item bri ON bri.id = bt.borrow_request_item_id
            WHERE bri.borrow_request_id = ANY($1)
              AND NOT EXISTS (
                  SELECT 1 FROM return_transaction rt
                  WHERE rt.borrow_transaction_id = bt.id
              )
            GROUP BY bt.borrow_request_item_id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        let category = query.category.as_deref().map(str::to_lowercase);
        let mut records = borrow_records(&self.pool, requests).await?;
        for record in &mut records {
            record.lines.retain_mut(|line| {
                line.quantity = outstanding
                    .get(&line.borrow_request_item_id)
                    .copied()
                    .unwrap_or(0) as i32;
                line.quantity > 0
                    && category
                        .as_deref()
                        .map_or(true, |c| line.name.to_lowercase() == c)
            });
        }
        records.retain(|r| !r.lines.is_empty());
        Ok(records)
    }

    async fn record_anomaly(&self, result: &AnomalyResult) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO anomaly_result (borrow_request_id, score, is_anomaly, is_false_positive)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (borrow_request_id) DO UPDATE
            SET score = EXCLUDED.score,
                is_anomaly = EXCLUDED.is_anomaly,
                is_false_positive = EXCLUDED.is_false_positive
            "#,
        )
        .bind(result.borrow_request_id)
        .bind(result.score)
        .bind(result.is_anomaly)
        .bind(result.is_false_positive)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_unclaimed(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        // Rows locked by an in-flight claim are skipped and picked up next sweep
        let expired: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH expired AS (
                SELECT br.id
                FROM borrow_request br
                JOIN borrow_request_otp o ON o.borrow_request_id = br.id
                WHERE br.status = 'approved' AND o.expires_at <= $1
                FOR UPDATE OF br SKIP LOCKED
            )
            UPDATE borrow_request
            SET status = 'unclaimed'
            WHERE id IN (SELECT id FROM expired) AND status = 'approved'
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM borrow_request_otp WHERE borrow_request_id = ANY($1)")
            .bind(&expired)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(expired)
    }
}
