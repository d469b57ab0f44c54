//! Claim and return codes on PostgreSQL

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{find_otp, issue_otp, OtpKind};
use crate::{
    error::{AppError, AppResult},
    lending::OtpPolicy,
    models::IssuedOtp,
    repository::OtpRepository,
};

#[derive(Clone)]
pub struct PgOtpRepository {
    pool: Pool<Postgres>,
}

impl PgOtpRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn live(&self, kind: OtpKind, id: Uuid, now: DateTime<Utc>) -> AppResult<IssuedOtp> {
        let mut conn = self.pool.acquire().await?;
        find_otp(&mut conn, kind, id)
            .await?
            .filter(|otp| otp.is_live(now))
            .ok_or_else(|| AppError::NotFound(format!("No live code for request {}", id)))
    }
}

#[async_trait]
impl OtpRepository for PgOtpRepository {
    async fn claim_code(&self, borrow_request_id: Uuid, now: DateTime<Utc>) -> AppResult<IssuedOtp> {
        self.live(OtpKind::Claim, borrow_request_id, now).await
    }

    async fn return_code(&self, return_request_id: Uuid, now: DateTime<Utc>) -> AppResult<IssuedOtp> {
        self.live(OtpKind::Return, return_request_id, now).await
    }

    async fn renew_expired_return_codes(&self, policy: &OtpPolicy, now: DateTime<Utc>) -> AppResult<u32> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT o.return_request_id
            FROM return_request_otp o
            JOIN return_request rr ON rr.id = o.return_request_id
            WHERE o.expires_at <= $1 AND rr.confirmed_at IS NULL
            ORDER BY o.return_request_id
            FOR UPDATE OF rr SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for id in &expired {
            issue_otp(&mut tx, OtpKind::Return, *id, policy, now).await?;
        }

        tx.commit().await?;
        Ok(expired.len() as u32)
    }
}
