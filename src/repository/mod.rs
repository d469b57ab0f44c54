//! Repository layer: one narrow trait per pipeline, two backends
//!
//! `postgres` is the production store; `memory` keeps the whole dataset behind
//! a single lock and is used by tests and local development.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{
    error::AppResult,
    lending::{OtpPolicy, TypeLedger},
    models::{
        borrow::{
            AnomalyResult, BorrowRequest, BorrowRequestRecord, BorrowRequestStatus,
            BorrowedItemsQuery, HistoryQuery, ReviewDecision,
        },
        equipment::{CreateEquipment, CreatedEquipment, EquipmentType, Unit, UpdateEquipment},
        returns::{ConfirmedReturn, CreatedReturnRequest, ReturnRequestQuery, ReturnRequestRecord},
        IssuedOtp, UserBasicInfo,
    },
};

/// Validated borrow request ready to be stored
#[derive(Debug, Clone)]
pub struct NewBorrowRequest {
    pub requested_by: Uuid,
    pub location: String,
    pub purpose: String,
    pub expected_return_at: DateTime<Utc>,
    /// (equipment type, quantity), one entry per type
    pub items: Vec<(Uuid, u32)>,
}

/// Review decision with reviewer metadata
#[derive(Debug, Clone)]
pub struct Review {
    pub reviewed_by: Uuid,
    pub decision: ReviewDecision,
    pub remarks: Option<String>,
}

/// Return confirmation with reviewer metadata
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub confirmed_by: Uuid,
    pub remarks: Option<String>,
    pub code: Option<String>,
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Upsert the type by its catalog key and add `quantity` units
    async fn create_equipment(&self, input: &CreateEquipment, now: DateTime<Utc>) -> AppResult<CreatedEquipment>;

    async fn get_type(&self, id: Uuid) -> AppResult<EquipmentType>;

    async fn update_type(&self, id: Uuid, changes: &UpdateEquipment) -> AppResult<EquipmentType>;

    /// Distinct names of types that own at least one unit
    async fn equipment_names(&self) -> AppResult<Vec<String>>;

    async fn get_unit(&self, id: Uuid) -> AppResult<Unit>;

    /// Current ledger of one type
    async fn ledger(&self, type_id: Uuid) -> AppResult<TypeLedger>;

    /// Every type with its ledger, ordered by name
    async fn ledgers(&self) -> AppResult<Vec<(EquipmentType, TypeLedger)>>;
}

#[async_trait]
pub trait BorrowRepository: Send + Sync {
    /// Insert a pending request after checking every line against truly available stock
    async fn create(&self, request: &NewBorrowRequest, now: DateTime<Utc>) -> AppResult<BorrowRequestRecord>;

    async fn get(&self, id: Uuid) -> AppResult<BorrowRequestRecord>;

    /// Approve or reject a pending request; approval mints the claim code in the same transaction
    async fn review(
        &self,
        id: Uuid,
        review: &Review,
        policy: &OtpPolicy,
        now: DateTime<Utc>,
    ) -> AppResult<(BorrowRequest, Option<IssuedOtp>)>;

    /// Consume the claim code and bind units to every line
    async fn receive(&self, id: Uuid, code: &str, now: DateTime<Utc>) -> AppResult<BorrowRequest>;

    /// Administrative status change
    async fn override_status(
        &self,
        id: Uuid,
        target: BorrowRequestStatus,
        now: DateTime<Utc>,
    ) -> AppResult<BorrowRequest>;

    async fn list_pending(&self) -> AppResult<Vec<BorrowRequestRecord>>;

    /// History matching the filters, unsorted
    async fn history(&self, query: &HistoryQuery) -> AppResult<Vec<BorrowRequestRecord>>;

    /// Received requests; line quantities are the units still out
    async fn borrowed_items(&self, query: &BorrowedItemsQuery) -> AppResult<Vec<BorrowRequestRecord>>;

    async fn record_anomaly(&self, result: &AnomalyResult) -> AppResult<()>;

    /// Move approved requests whose claim code expired at or before `now` to unclaimed
    async fn expire_unclaimed(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>>;
}

#[async_trait]
pub trait ReturnRepository: Send + Sync {
    /// Create one return request per borrow request touched, each with its own code
    async fn create(
        &self,
        items: &[(Uuid, u32)],
        policy: &OtpPolicy,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<CreatedReturnRequest>>;

    /// Close borrow transactions for every line; one-shot
    async fn confirm(&self, id: Uuid, confirmation: &Confirmation, now: DateTime<Utc>) -> AppResult<ConfirmedReturn>;

    async fn get(&self, id: Uuid) -> AppResult<ReturnRequestRecord>;

    /// Unconfirmed return requests matching the filters, unsorted
    async fn list_unconfirmed(&self, query: &ReturnRequestQuery) -> AppResult<Vec<ReturnRequestRecord>>;
}

#[async_trait]
pub trait OtpRepository: Send + Sync {
    /// Live claim code of an approved request
    async fn claim_code(&self, borrow_request_id: Uuid, now: DateTime<Utc>) -> AppResult<IssuedOtp>;

    /// Live return code of an unconfirmed return request
    async fn return_code(&self, return_request_id: Uuid, now: DateTime<Utc>) -> AppResult<IssuedOtp>;

    /// Re-mint every expired return code whose return request is still unconfirmed
    async fn renew_expired_return_codes(&self, policy: &OtpPolicy, now: DateTime<Utc>) -> AppResult<u32>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn basic_info(&self, user_id: Uuid) -> AppResult<UserBasicInfo>;

    /// Resolve several users at once; unknown ids fail the whole lookup
    async fn basic_info_many(&self, user_ids: &[Uuid]) -> AppResult<HashMap<Uuid, UserBasicInfo>> {
        let mut resolved = HashMap::with_capacity(user_ids.len());
        for id in user_ids {
            if !resolved.contains_key(id) {
                resolved.insert(*id, self.basic_info(*id).await?);
            }
        }
        Ok(resolved)
    }
}

/// Main repository struct holding one handle per pipeline
#[derive(Clone)]
pub struct Repository {
    pub pool: Option<Pool<Postgres>>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub borrows: Arc<dyn BorrowRepository>,
    pub returns: Arc<dyn ReturnRepository>,
    pub otps: Arc<dyn OtpRepository>,
    pub users: Arc<dyn UserDirectory>,
}

impl Repository {
    /// Create a repository backed by the given database pool
    pub fn postgres(pool: Pool<Postgres>) -> Self {
        Self {
            catalog: Arc::new(postgres::PgCatalogRepository::new(pool.clone())),
            borrows: Arc::new(postgres::PgBorrowRepository::new(pool.clone())),
            returns: Arc::new(postgres::PgReturnRepository::new(pool.clone())),
            otps: Arc::new(postgres::PgOtpRepository::new(pool.clone())),
            users: Arc::new(postgres::PgUserDirectory::new(pool.clone())),
            pool: Some(pool),
        }
    }

    /// Create a repository over an in-memory store
    pub fn memory(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            pool: None,
            catalog: store.clone(),
            borrows: store.clone(),
            returns: store.clone(),
            otps: store.clone(),
            users: store,
        }
    }

    /// Check the backing store is reachable
    pub async fn ping(&self) -> AppResult<()> {
        if let Some(pool) = &self.pool {
            sqlx::query("SELECT 1").execute(pool).await?;
        }
        Ok(())
    }
}
