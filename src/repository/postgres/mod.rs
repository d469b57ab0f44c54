//! PostgreSQL backend
//!
//! Every capacity-changing operation runs in one READ COMMITTED transaction and
//! takes explicit row locks before reading availability: the borrow request row
//! first, then the affected `equipment_type` rows in id order. Locking the type
//! rows serializes approvals and claims per type, so the ledger read inside the
//! transaction cannot be invalidated by a concurrent writer.

mod borrow;
mod catalog;
mod otp;
mod returns;
mod users;

pub use borrow::PgBorrowRepository;
pub use catalog::PgCatalogRepository;
pub use otp::PgOtpRepository;
pub use returns::PgReturnRepository;
pub use users::PgUserDirectory;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, Pool, Postgres};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    lending::{OtpPolicy, Reservation, TypeLedger},
    models::{
        borrow::{AnomalyResult, BorrowLine, BorrowRequest, BorrowRequestRecord},
        equipment::{Unit, UnitHolder},
        returns::{ReturnLine, ReturnRequest, ReturnRequestRecord},
        IssuedOtp,
    },
};

/// Which request a one-time code belongs to
#[derive(Debug, Clone, Copy)]
pub(crate) enum OtpKind {
    Claim,
    Return,
}

impl OtpKind {
    fn table(self) -> &'static str {
        match self {
            OtpKind::Claim => "borrow_request_otp",
            OtpKind::Return => "return_request_otp",
        }
    }

    fn key(self) -> &'static str {
        match self {
            OtpKind::Claim => "borrow_request_id",
            OtpKind::Return => "return_request_id",
        }
    }
}

/// `%needle%` for ILIKE with wildcards escaped
pub(crate) fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Lock equipment type rows in id order; fails if any id is unknown
pub(crate) async fn lock_types(conn: &mut PgConnection, type_ids: &[Uuid]) -> AppResult<()> {
    let mut ids = type_ids.to_vec();
    ids.sort();
    ids.dedup();

    let found: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM equipment_type WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    match ids.iter().find(|id| !found.contains(id)) {
        Some(missing) => Err(AppError::NotFound(format!(
            "Equipment type {} not found",
            missing
        ))),
        None => Ok(()),
    }
}

/// Build ledgers for the given types, or for every type when `type_ids` is `None`
pub(crate) async fn load_ledgers(
    conn: &mut PgConnection,
    type_ids: Option<&[Uuid]>,
) -> AppResult<HashMap<Uuid, TypeLedger>> {
    let filter: Option<Vec<Uuid>> = type_ids.map(<[Uuid]>::to_vec);

    let types: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM equipment_type WHERE ($1::uuid[] IS NULL OR id = ANY($1))",
    )
    .bind(&filter)
    .fetch_all(&mut *conn)
    .await?;

    let units = sqlx::query_as::<_, Unit>(
        r#"
        SELECT id, equipment_type_id, acquired_at
        FROM equipment
        WHERE ($1::uuid[] IS NULL OR equipment_type_id = ANY($1))
        ORDER BY id
        "#,
    )
    .bind(&filter)
    .fetch_all(&mut *conn)
    .await?;

    let open: Vec<(Uuid, Uuid, Uuid)> = sqlx::query_as(
        r#"
        SELECT bt.equipment_id, br.requested_by, br.id
        FROM borrow_transaction bt
        JOIN borrow_request_item bri ON bri.id = bt.borrow_request_item_id
        JOIN borrow_request br ON br.id = bri.borrow_request_id
        WHERE ($1::uuid[] IS NULL OR bri.equipment_type_id = ANY($1))
          AND NOT EXISTS (
              SELECT 1 FROM return_transaction rt
              WHERE rt.borrow_transaction_id = bt.id
          )
        "#,
    )
    .bind(&filter)
    .fetch_all(&mut *conn)
    .await?;

    let reservations: Vec<(Uuid, Uuid, Uuid, i64)> = sqlx::query_as(
        r#"
        SELECT bri.equipment_type_id, br.id, br.requested_by, SUM(bri.quantity)::BIGINT
        FROM borrow_request br
        JOIN borrow_request_item bri ON bri.borrow_request_id = br.id
        WHERE br.status = 'approved'
          AND ($1::uuid[] IS NULL OR bri.equipment_type_id = ANY($1))
        GROUP BY bri.equipment_type_id, br.id, br.requested_by, br.reviewed_at
        ORDER BY br.reviewed_at, br.id
        "#,
    )
    .bind(&filter)
    .fetch_all(&mut *conn)
    .await?;

    let mut units_by_type: HashMap<Uuid, Vec<Unit>> = HashMap::new();
    for unit in units {
        units_by_type.entry(unit.equipment_type_id).or_default().push(unit);
    }

    let borrowed: HashMap<Uuid, UnitHolder> = open
        .into_iter()
        .map(|(unit_id, user_id, borrow_request_id)| {
            (
                unit_id,
                UnitHolder {
                    user_id,
                    borrow_request_id,
                },
            )
        })
        .collect();

    let mut reservations_by_type: HashMap<Uuid, Vec<Reservation>> = HashMap::new();
    for (type_id, borrow_request_id, user_id, quantity) in reservations {
        reservations_by_type.entry(type_id).or_default().push(Reservation {
            borrow_request_id,
            user_id,
            quantity: quantity.max(0) as u32,
        });
    }

    Ok(types
        .into_iter()
        .map(|type_id| {
            let units = units_by_type.remove(&type_id).unwrap_or_default();
            let held = units
                .iter()
                .filter_map(|u| borrowed.get(&u.id).map(|h| (u.id, *h)))
                .collect();
            let ledger = TypeLedger::new(
                type_id,
                units,
                held,
                reservations_by_type.remove(&type_id).unwrap_or_default(),
            );
            (type_id, ledger)
        })
        .collect())
}

/// Replace the request's code with a fresh one, retrying on code collisions
pub(crate) async fn issue_otp(
    conn: &mut PgConnection,
    kind: OtpKind,
    request_id: Uuid,
    policy: &OtpPolicy,
    now: DateTime<Utc>,
) -> AppResult<IssuedOtp> {
    sqlx::query(&format!("DELETE FROM {} WHERE {} = $1", kind.table(), kind.key()))
        .bind(request_id)
        .execute(&mut *conn)
        .await?;

    let insert = format!(
        r#"
        INSERT INTO {} ({}, code, expires_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (code) DO NOTHING
        RETURNING code, expires_at
        "#,
        kind.table(),
        kind.key()
    );

    for candidate in policy.candidates(now) {
        let inserted = sqlx::query_as::<_, IssuedOtp>(&insert)
            .bind(request_id)
            .bind(&candidate.code)
            .bind(candidate.expires_at)
            .fetch_optional(&mut *conn)
            .await?;

        if let Some(otp) = inserted {
            return Ok(otp);
        }
        tracing::debug!(%request_id, "One-time code collision, retrying");
    }

    Err(policy.exhausted())
}

pub(crate) async fn delete_otp(conn: &mut PgConnection, kind: OtpKind, request_id: Uuid) -> AppResult<()> {
    sqlx::query(&format!("DELETE FROM {} WHERE {} = $1", kind.table(), kind.key()))
        .bind(request_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Stored code of a request, live or not
pub(crate) async fn find_otp(
    conn: &mut PgConnection,
    kind: OtpKind,
    request_id: Uuid,
) -> AppResult<Option<IssuedOtp>> {
    let otp = sqlx::query_as::<_, IssuedOtp>(&format!(
        "SELECT code, expires_at FROM {} WHERE {} = $1",
        kind.table(),
        kind.key()
    ))
    .bind(request_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(otp)
}

/// Number of unreturned borrow transactions across a whole borrow request
pub(crate) async fn outstanding_units(conn: &mut PgConnection, borrow_request_id: Uuid) -> AppResult<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM borrow_transaction bt
        JOIN borrow_request_item bri ON bri.id = bt.borrow_request_item_id
        WHERE bri.borrow_request_id = $1
          AND NOT EXISTS (
              SELECT 1 FROM return_transaction rt
              WHERE rt.borrow_transaction_id = bt.id
          )
        "#,
    )
    .bind(borrow_request_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

#[derive(FromRow)]
struct BorrowLineRow {
    borrow_request_id: Uuid,
    #[sqlx(flatten)]
    line: BorrowLine,
}

#[derive(FromRow)]
struct ReturnLineRow {
    return_request_id: Uuid,
    #[sqlx(flatten)]
    line: ReturnLine,
}

/// Attach lines, anomaly results and latest return time to borrow request rows
pub(crate) async fn borrow_records(
    pool: &Pool<Postgres>,
    requests: Vec<BorrowRequest>,
) -> AppResult<Vec<BorrowRequestRecord>> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();

    let lines = sqlx::query_as::<_, BorrowLineRow>(
        r#"
        SELECT bri.borrow_request_id, bri.id AS borrow_request_item_id,
               et.id AS equipment_type_id, et.name, et.brand, et.model, et.image_url,
               bri.quantity
        FROM borrow_request_item bri
        JOIN equipment_type et ON et.id = bri.equipment_type_id
        WHERE bri.borrow_request_id = ANY($1)
        ORDER BY bri.id
        "#,
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let anomalies = sqlx::query_as::<_, AnomalyResult>(
        r#"
        SELECT borrow_request_id, score, is_anomaly, is_false_positive
        FROM anomaly_result
        WHERE borrow_request_id = ANY($1)
        "#,
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let returned: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT borrow_request_id, MAX(confirmed_at)
        FROM return_request
        WHERE borrow_request_id = ANY($1) AND confirmed_at IS NOT NULL
        GROUP BY borrow_request_id
        "#,
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let mut lines_by_request: HashMap<Uuid, Vec<BorrowLine>> = HashMap::new();
    for row in lines {
        lines_by_request.entry(row.borrow_request_id).or_default().push(row.line);
    }
    let mut anomalies: HashMap<Uuid, AnomalyResult> = anomalies
        .into_iter()
        .map(|a| (a.borrow_request_id, a))
        .collect();
    let returned: HashMap<Uuid, DateTime<Utc>> = returned.into_iter().collect();

    Ok(requests
        .into_iter()
        .map(|request| BorrowRequestRecord {
            lines: lines_by_request.remove(&request.id).unwrap_or_default(),
            anomaly: anomalies.remove(&request.id),
            returned_at: returned.get(&request.id).copied(),
            request,
        })
        .collect())
}

/// Attach lines and borrower fields to return request rows
pub(crate) async fn return_records(
    pool: &Pool<Postgres>,
    requests: Vec<ReturnRequest>,
) -> AppResult<Vec<ReturnRequestRecord>> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();
    let parent_ids: Vec<Uuid> = requests.iter().map(|r| r.borrow_request_id).collect();

    let lines = sqlx::query_as::<_, ReturnLineRow>(
        r#"
        SELECT rri.return_request_id, rri.id AS return_request_item_id,
               rri.borrow_request_item_id, et.id AS equipment_type_id,
               et.name, et.brand, et.model, et.image_url, rri.quantity
        FROM return_request_item rri
        JOIN borrow_request_item bri ON bri.id = rri.borrow_request_item_id
        JOIN equipment_type et ON et.id = bri.equipment_type_id
        WHERE rri.return_request_id = ANY($1)
        ORDER BY rri.id
        "#,
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let parents: Vec<(Uuid, Uuid, DateTime<Utc>)> = sqlx::query_as(
        "SELECT id, requested_by, expected_return_at FROM borrow_request WHERE id = ANY($1)",
    )
    .bind(&parent_ids)
    .fetch_all(pool)
    .await?;

    let mut lines_by_request: HashMap<Uuid, Vec<ReturnLine>> = HashMap::new();
    for row in lines {
        lines_by_request.entry(row.return_request_id).or_default().push(row.line);
    }
    let parents: HashMap<Uuid, (Uuid, DateTime<Utc>)> = parents
        .into_iter()
        .map(|(id, requested_by, expected)| (id, (requested_by, expected)))
        .collect();

    requests
        .into_iter()
        .map(|request| {
            let (requested_by, expected_return_at) = parents
                .get(&request.borrow_request_id)
                .copied()
                .ok_or_else(|| {
                    AppError::Internal(format!(
                        "Return request {} has no borrow request",
                        request.id
                    ))
                })?;
            Ok(ReturnRequestRecord {
                lines: lines_by_request.remove(&request.id).unwrap_or_default(),
                requested_by,
                expected_return_at,
                request,
            })
        })
        .collect()
}
