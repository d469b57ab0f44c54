//! In-memory backend
//!
//! The whole dataset sits behind one async mutex. Writers work on a cloned
//! draft that replaces the live state only when the operation succeeds, which
//! gives every operation the same all-or-nothing behaviour as a database
//! transaction and serializes them completely.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    lending::{lifecycle, OtpPolicy, OverrideAction, Reservation, TypeLedger},
    models::{
        borrow::{
            AnomalyResult, BorrowLine, BorrowRequest, BorrowRequestItem, BorrowRequestRecord,
            BorrowRequestStatus, BorrowTransaction, BorrowedItemsQuery, HistoryQuery, ReviewDecision,
        },
        equipment::{
            catalog_key, CreateEquipment, CreatedEquipment, EquipmentType, Unit, UnitHolder,
            UpdateEquipment,
        },
        returns::{
            ConfirmedReturn, CreatedReturnRequest, ReturnLine, ReturnRequest, ReturnRequestItem,
            ReturnRequestQuery, ReturnRequestRecord, ReturnTransaction,
        },
        IssuedOtp, UserBasicInfo,
    },
    repository::{
        BorrowRepository, CatalogRepository, Confirmation, NewBorrowRequest, OtpRepository,
        ReturnRepository, Review, UserDirectory,
    },
};

#[derive(Debug, Clone, Default)]
struct State {
    users: HashMap<Uuid, UserBasicInfo>,
    types: HashMap<Uuid, EquipmentType>,
    units: Vec<Unit>,
    borrow_requests: HashMap<Uuid, BorrowRequest>,
    borrow_items: Vec<BorrowRequestItem>,
    borrow_transactions: Vec<BorrowTransaction>,
    claim_codes: HashMap<Uuid, IssuedOtp>,
    return_requests: HashMap<Uuid, ReturnRequest>,
    return_items: Vec<ReturnRequestItem>,
    return_transactions: Vec<ReturnTransaction>,
    return_codes: HashMap<Uuid, IssuedOtp>,
    anomalies: HashMap<Uuid, AnomalyResult>,
}

/// Replace the request's code, skipping candidates already in use
fn issue_code(
    codes: &mut HashMap<Uuid, IssuedOtp>,
    request_id: Uuid,
    policy: &OtpPolicy,
    now: DateTime<Utc>,
) -> AppResult<IssuedOtp> {
    codes.remove(&request_id);
    for candidate in policy.candidates(now) {
        if codes.values().any(|otp| otp.code == candidate.code) {
            tracing::debug!(%request_id, "One-time code collision, retrying");
            continue;
        }
        codes.insert(request_id, candidate.clone());
        return Ok(candidate);
    }
    Err(policy.exhausted())
}

fn type_not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("Equipment type {} not found", id))
}

impl State {
    fn borrow_request(&self, id: Uuid) -> AppResult<&BorrowRequest> {
        self.borrow_requests
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("Borrow request {} not found", id)))
    }

    fn set_status(&mut self, id: Uuid, status: BorrowRequestStatus) -> AppResult<BorrowRequest> {
        let request = self
            .borrow_requests
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Borrow request {} not found", id)))?;
        request.status = status;
        Ok(request.clone())
    }

    fn is_open(&self, transaction_id: Uuid) -> bool {
        !self
            .return_transactions
            .iter()
            .any(|rt| rt.borrow_transaction_id == transaction_id)
    }

    fn items_of(&self, borrow_request_id: Uuid) -> Vec<BorrowRequestItem> {
        let mut items: Vec<BorrowRequestItem> = self
            .borrow_items
            .iter()
            .filter(|i| i.borrow_request_id == borrow_request_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.id);
        items
    }

    fn quantities_by_type(&self, borrow_request_id: Uuid) -> Vec<(Uuid, u32)> {
        let mut totals: HashMap<Uuid, u32> = HashMap::new();
        for item in self.items_of(borrow_request_id) {
            *totals.entry(item.equipment_type_id).or_default() += item.quantity.max(0) as u32;
        }
        let mut totals: Vec<(Uuid, u32)> = totals.into_iter().collect();
        totals.sort();
        totals
    }

    fn ledger(&self, type_id: Uuid) -> AppResult<TypeLedger> {
        if !self.types.contains_key(&type_id) {
            return Err(type_not_found(type_id));
        }

        let units: Vec<Unit> = self
            .units
            .iter()
            .filter(|u| u.equipment_type_id == type_id)
            .cloned()
            .collect();

        let mut borrowed = HashMap::new();
        for bt in self.borrow_transactions.iter().filter(|bt| self.is_open(bt.id)) {
            let Some(item) = self.borrow_items.iter().find(|i| i.id == bt.borrow_request_item_id) else {
                continue;
            };
            if item.equipment_type_id != type_id {
                continue;
            }
            if let Some(request) = self.borrow_requests.get(&item.borrow_request_id) {
                borrowed.insert(
                    bt.equipment_id,
                    UnitHolder {
                        user_id: request.requested_by,
                        borrow_request_id: request.id,
                    },
                );
            }
        }

        let mut approved: Vec<&BorrowRequest> = self
            .borrow_requests
            .values()
            .filter(|r| r.status == BorrowRequestStatus::Approved)
            .collect();
        approved.sort_by_key(|r| (r.reviewed_at, r.id));

        let reservations = approved
            .into_iter()
            .filter_map(|r| {
                let quantity: u32 = self
                    .borrow_items
                    .iter()
                    .filter(|i| i.borrow_request_id == r.id && i.equipment_type_id == type_id)
                    .map(|i| i.quantity.max(0) as u32)
                    .sum();
                (quantity > 0).then_some(Reservation {
                    borrow_request_id: r.id,
                    user_id: r.requested_by,
                    quantity,
                })
            })
            .collect();

        Ok(TypeLedger::new(type_id, units, borrowed, reservations))
    }

    fn allocate(&mut self, borrow_request_id: Uuid, now: DateTime<Utc>) -> AppResult<u32> {
        let mut picks = HashMap::new();
        for (type_id, quantity) in self.quantities_by_type(borrow_request_id) {
            let units = self
                .ledger(type_id)?
                .select_for_claim(quantity)
                .ok_or(AppError::InsufficientQuantity)?;
            picks.insert(type_id, units.into_iter());
        }

        let mut bound = 0u32;
        for item in self.items_of(borrow_request_id) {
            let units = picks
                .get_mut(&item.equipment_type_id)
                .ok_or(AppError::InsufficientQuantity)?;
            for _ in 0..item.quantity {
                let equipment_id = units.next().ok_or(AppError::InsufficientQuantity)?;
                self.borrow_transactions.push(BorrowTransaction {
                    id: Uuid::new_v4(),
                    equipment_id,
                    borrow_request_item_id: item.id,
                    created_at: now,
                });
                bound += 1;
            }
        }
        Ok(bound)
    }

    /// Open borrow transactions of a line, lowest id first
    fn open_transactions(&self, borrow_request_item_id: Uuid) -> Vec<Uuid> {
        let mut open: Vec<Uuid> = self
            .borrow_transactions
            .iter()
            .filter(|bt| bt.borrow_request_item_id == borrow_request_item_id && self.is_open(bt.id))
            .map(|bt| bt.id)
            .collect();
        open.sort();
        open
    }

    fn outstanding_units(&self, borrow_request_id: Uuid) -> usize {
        self.items_of(borrow_request_id)
            .iter()
            .map(|item| self.open_transactions(item.id).len())
            .sum()
    }

    fn already_returned(&self, borrow_request_item_id: Uuid) -> u32 {
        self.return_items
            .iter()
            .filter(|ri| ri.borrow_request_item_id == borrow_request_item_id)
            .filter(|ri| {
                self.return_transactions
                    .iter()
                    .any(|rt| rt.return_request_item_id == ri.id)
            })
            .map(|ri| ri.quantity.max(0) as u32)
            .sum()
    }

    fn lines(&self, borrow_request_id: Uuid) -> Vec<BorrowLine> {
        self.items_of(borrow_request_id)
            .into_iter()
            .filter_map(|item| {
                let t = self.types.get(&item.equipment_type_id)?;
                Some(BorrowLine {
                    borrow_request_item_id: item.id,
                    equipment_type_id: t.id,
                    name: t.name.clone(),
                    brand: t.brand.clone(),
                    model: t.model.clone(),
                    image_url: t.image_url.clone(),
                    quantity: item.quantity,
                })
            })
            .collect()
    }

    fn borrow_record(&self, request: &BorrowRequest) -> BorrowRequestRecord {
        let returned_at = self
            .return_requests
            .values()
            .filter(|rr| rr.borrow_request_id == request.id)
            .filter_map(|rr| rr.confirmed_at)
            .max();

        BorrowRequestRecord {
            request: request.clone(),
            lines: self.lines(request.id),
            anomaly: self.anomalies.get(&request.id).cloned(),
            returned_at,
        }
    }

    fn return_record(&self, request: &ReturnRequest) -> AppResult<ReturnRequestRecord> {
        let parent = self.borrow_request(request.borrow_request_id)?;

        let mut items: Vec<&ReturnRequestItem> = self
            .return_items
            .iter()
            .filter(|ri| ri.return_request_id == request.id)
            .collect();
        items.sort_by_key(|ri| ri.id);

        let lines = items
            .into_iter()
            .filter_map(|ri| {
                let item = self.borrow_items.iter().find(|i| i.id == ri.borrow_request_item_id)?;
                let t = self.types.get(&item.equipment_type_id)?;
                Some(ReturnLine {
                    return_request_item_id: ri.id,
                    borrow_request_item_id: item.id,
                    equipment_type_id: t.id,
                    name: t.name.clone(),
                    brand: t.brand.clone(),
                    model: t.model.clone(),
                    image_url: t.image_url.clone(),
                    quantity: ri.quantity,
                })
            })
            .collect();

        Ok(ReturnRequestRecord {
            request: request.clone(),
            requested_by: parent.requested_by,
            expected_return_at: parent.expected_return_at,
            lines,
        })
    }

    fn has_category(&self, borrow_request_id: Uuid, category: &str) -> bool {
        let category = category.to_lowercase();
        self.lines(borrow_request_id)
            .iter()
            .any(|l| l.name.to_lowercase() == category)
    }

    fn user_matches(&self, user_id: Option<Uuid>, needle: &str) -> bool {
        user_id
            .and_then(|id| self.users.get(&id))
            .map(|u| u.name_matches(needle))
            .unwrap_or(false)
    }
}

/// Single-lock store implementing every repository trait
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user in the directory
    pub async fn add_user(&self, user: UserBasicInfo) {
        self.state.lock().await.users.insert(user.id, user);
    }

    async fn read<T>(&self, f: impl FnOnce(&State) -> AppResult<T> + Send) -> AppResult<T> {
        let state = self.state.lock().await;
        f(&state)
    }

    async fn write<T>(&self, f: impl FnOnce(&mut State) -> AppResult<T> + Send) -> AppResult<T> {
        let mut state = self.state.lock().await;
        let mut draft = state.clone();
        let out = f(&mut draft)?;
        *state = draft;
        Ok(out)
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn create_equipment(&self, input: &CreateEquipment, now: DateTime<Utc>) -> AppResult<CreatedEquipment> {
        self.write(|s| {
            let key = catalog_key(&input.name, input.brand.as_deref(), input.model.as_deref());
            let existing = s
                .types
                .values()
                .find(|t| catalog_key(&t.name, t.brand.as_deref(), t.model.as_deref()) == key)
                .map(|t| t.id);

            let type_id = match existing {
                Some(id) => {
                    if let (Some(t), Some(image)) = (s.types.get_mut(&id), &input.image_url) {
                        t.image_url = Some(image.clone());
                    }
                    id
                }
                None => {
                    let t = EquipmentType {
                        id: Uuid::new_v4(),
                        name: input.name.clone(),
                        brand: input.brand.clone(),
                        model: input.model.clone(),
                        image_url: input.image_url.clone(),
                        created_at: now,
                    };
                    let id = t.id;
                    s.types.insert(id, t);
                    id
                }
            };

            for _ in 0..input.quantity {
                s.units.push(Unit {
                    id: Uuid::new_v4(),
                    equipment_type_id: type_id,
                    acquired_at: input.acquired_at,
                });
            }

            let equipment_type = s.types.get(&type_id).cloned().ok_or_else(|| type_not_found(type_id))?;
            Ok(CreatedEquipment {
                equipment_type,
                acquired_at: input.acquired_at,
                quantity: input.quantity,
            })
        })
        .await
    }

    async fn get_type(&self, id: Uuid) -> AppResult<EquipmentType> {
        self.read(|s| s.types.get(&id).cloned().ok_or_else(|| type_not_found(id)))
            .await
    }

    async fn update_type(&self, id: Uuid, changes: &UpdateEquipment) -> AppResult<EquipmentType> {
        self.write(|s| {
            let mut updated = s.types.get(&id).cloned().ok_or_else(|| type_not_found(id))?;
            if let Some(name) = &changes.name {
                updated.name = name.clone();
            }
            if let Some(brand) = &changes.brand {
                updated.brand = Some(brand.clone());
            }
            if let Some(model) = &changes.model {
                updated.model = Some(model.clone());
            }
            if let Some(image_url) = &changes.image_url {
                updated.image_url = Some(image_url.clone());
            }

            let key = catalog_key(&updated.name, updated.brand.as_deref(), updated.model.as_deref());
            let clash = s.types.values().any(|t| {
                t.id != id && catalog_key(&t.name, t.brand.as_deref(), t.model.as_deref()) == key
            });
            if clash {
                return Err(AppError::Validation(
                    "an equipment type with this name, brand and model already exists".to_string(),
                ));
            }

            s.types.insert(id, updated.clone());
            Ok(updated)
        })
        .await
    }

    async fn equipment_names(&self) -> AppResult<Vec<String>> {
        self.read(|s| {
            let mut names: Vec<String> = s
                .types
                .values()
                .filter(|t| s.units.iter().any(|u| u.equipment_type_id == t.id))
                .map(|t| t.name.clone())
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        })
        .await
    }

    async fn get_unit(&self, id: Uuid) -> AppResult<Unit> {
        self.read(|s| {
            s.units
                .iter()
                .find(|u| u.id == id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("Equipment unit {} not found", id)))
        })
        .await
    }

    async fn ledger(&self, type_id: Uuid) -> AppResult<TypeLedger> {
        self.read(|s| s.ledger(type_id)).await
    }

    async fn ledgers(&self) -> AppResult<Vec<(EquipmentType, TypeLedger)>> {
        self.read(|s| {
            let mut types: Vec<EquipmentType> = s.types.values().cloned().collect();
            types.sort_by(|a, b| (&a.name, &a.brand, &a.model).cmp(&(&b.name, &b.brand, &b.model)));
            types
                .into_iter()
                .map(|t| s.ledger(t.id).map(|l| (t, l)))
                .collect()
        })
        .await
    }
}

#[async_trait]
impl BorrowRepository for MemoryStore {
    async fn create(&self, request: &NewBorrowRequest, now: DateTime<Utc>) -> AppResult<BorrowRequestRecord> {
        self.write(|s| {
            for (type_id, quantity) in &request.items {
                if *quantity > s.ledger(*type_id)?.truly_available() {
                    return Err(AppError::InsufficientQuantity);
                }
            }

            let created = BorrowRequest {
                id: Uuid::new_v4(),
                requested_by: request.requested_by,
                location: request.location.clone(),
                purpose: request.purpose.clone(),
                expected_return_at: request.expected_return_at,
                created_at: now,
                status: BorrowRequestStatus::Pending,
                reviewed_by: None,
                reviewed_at: None,
                remarks: None,
            };
            for (type_id, quantity) in &request.items {
                s.borrow_items.push(BorrowRequestItem {
                    id: Uuid::new_v4(),
                    borrow_request_id: created.id,
                    equipment_type_id: *type_id,
                    quantity: *quantity as i32,
                });
            }
            s.borrow_requests.insert(created.id, created.clone());
            Ok(s.borrow_record(&created))
        })
        .await
    }

    async fn get(&self, id: Uuid) -> AppResult<BorrowRequestRecord> {
        self.read(|s| s.borrow_request(id).map(|r| s.borrow_record(r))).await
    }

    async fn review(
        &self,
        id: Uuid,
        review: &Review,
        policy: &OtpPolicy,
        now: DateTime<Utc>,
    ) -> AppResult<(BorrowRequest, Option<IssuedOtp>)> {
        self.write(|s| {
            lifecycle::check_reviewable(s.borrow_request(id)?.status)?;

            if review.decision == ReviewDecision::Approved {
                for (type_id, quantity) in s.quantities_by_type(id) {
                    if !s.ledger(type_id)?.can_reserve(quantity) {
                        return Err(AppError::InsufficientQuantity);
                    }
                }
            }

            let request = s
                .borrow_requests
                .get_mut(&id)
                .ok_or_else(|| AppError::NotFound(format!("Borrow request {} not found", id)))?;
            request.status = review.decision.into();
            request.reviewed_by = Some(review.reviewed_by);
            request.reviewed_at = Some(now);
            request.remarks = review.remarks.clone();
            let updated = request.clone();

            let claim_code = match review.decision {
                ReviewDecision::Approved => Some(issue_code(&mut s.claim_codes, id, policy, now)?),
                ReviewDecision::Rejected => None,
            };
            Ok((updated, claim_code))
        })
        .await
    }

    async fn receive(&self, id: Uuid, code: &str, now: DateTime<Utc>) -> AppResult<BorrowRequest> {
        self.write(|s| {
            let current = s.borrow_request(id)?.status;
            match s.claim_codes.get(&id) {
                Some(otp) if otp.code == code && otp.is_live(now) => {}
                _ => return Err(AppError::InvalidOrExpiredCode),
            }
            lifecycle::check_claimable(current)?;

            s.allocate(id, now)?;
            let updated = s.set_status(id, BorrowRequestStatus::Received)?;
            s.claim_codes.remove(&id);
            Ok(updated)
        })
        .await
    }

    async fn override_status(
        &self,
        id: Uuid,
        target: BorrowRequestStatus,
        now: DateTime<Utc>,
    ) -> AppResult<BorrowRequest> {
        self.write(|s| {
            let current = s.borrow_request(id)?.status;
            match lifecycle::check_override(current, target)? {
                OverrideAction::Allocate => {
                    s.allocate(id, now)?;
                    s.claim_codes.remove(&id);
                }
                OverrideAction::Fulfil => {
                    if s.outstanding_units(id) > 0 {
                        return Err(AppError::InvalidBorrowRequestStatus(
                            "units are still borrowed".to_string(),
                        ));
                    }
                }
                OverrideAction::Release => {
                    s.claim_codes.remove(&id);
                }
                OverrideAction::Reject => {}
            }
            s.set_status(id, target)
        })
        .await
    }

    async fn list_pending(&self) -> AppResult<Vec<BorrowRequestRecord>> {
        self.read(|s| {
            let mut pending: Vec<&BorrowRequest> = s
                .borrow_requests
                .values()
                .filter(|r| r.status == BorrowRequestStatus::Pending)
                .collect();
            pending.sort_by_key(|r| (r.created_at, r.id));
            Ok(pending.into_iter().map(|r| s.borrow_record(r)).collect())
        })
        .await
    }

    async fn history(&self, query: &HistoryQuery) -> AppResult<Vec<BorrowRequestRecord>> {
        self.read(|s| {
            let search = query
                .search
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty());

            Ok(s.borrow_requests
                .values()
                .filter(|r| query.user_id.map_or(true, |u| r.requested_by == u))
                .filter(|r| query.status.map_or(true, |st| r.status == st))
                .filter(|r| query.from.map_or(true, |from| r.created_at >= from))
                .filter(|r| query.to.map_or(true, |to| r.created_at <= to))
                .filter(|r| {
                    query
                        .category
                        .as_deref()
                        .map_or(true, |c| s.has_category(r.id, c))
                })
                .filter(|r| {
                    search.map_or(true, |needle| {
                        s.items_of(r.id).iter().any(|i| {
                            s.types
                                .get(&i.equipment_type_id)
                                .map(|t| t.matches_search(needle))
                                .unwrap_or(false)
                        }) || s.user_matches(Some(r.requested_by), needle)
                            || s.user_matches(r.reviewed_by, needle)
                    })
                })
                .map(|r| s.borrow_record(r))
                .collect())
        })
        .await
    }

    async fn borrowed_items(&self, query: &BorrowedItemsQuery) -> AppResult<Vec<BorrowRequestRecord>> {
        self.read(|s| {
            let category = query.category.as_deref().map(str::to_lowercase);
            Ok(s.borrow_requests
                .values()
                .filter(|r| r.status == BorrowRequestStatus::Received)
                .filter(|r| query.user_id.map_or(true, |u| r.requested_by == u))
                .map(|r| {
                    let mut record = s.borrow_record(r);
                    record.lines.retain_mut(|line| {
                        line.quantity = s.open_transactions(line.borrow_request_item_id).len() as i32;
                        line.quantity > 0
                            && category
                                .as_deref()
                                .map_or(true, |c| line.name.to_lowercase() == c)
                    });
                    record
                })
                .filter(|r| !r.lines.is_empty())
                .collect())
        })
        .await
    }

    async fn record_anomaly(&self, result: &AnomalyResult) -> AppResult<()> {
        self.write(|s| {
            s.borrow_request(result.borrow_request_id)?;
            s.anomalies.insert(result.borrow_request_id, result.clone());
            Ok(())
        })
        .await
    }

    async fn expire_unclaimed(&self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        self.write(|s| {
            let mut expired: Vec<Uuid> = s
                .borrow_requests
                .values()
                .filter(|r| r.status == BorrowRequestStatus::Approved)
                .filter(|r| s.claim_codes.get(&r.id).is_some_and(|otp| !otp.is_live(now)))
                .map(|r| r.id)
                .collect();
            expired.sort();

            for id in &expired {
                s.set_status(*id, BorrowRequestStatus::Unclaimed)?;
                s.claim_codes.remove(id);
            }
            Ok(expired)
        })
        .await
    }
}

#[async_trait]
impl ReturnRepository for MemoryStore {
    async fn create(
        &self,
        items: &[(Uuid, u32)],
        policy: &OtpPolicy,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<CreatedReturnRequest>> {
        self.write(|s| {
            let mut groups: Vec<(Uuid, Vec<(Uuid, u32)>)> = Vec::new();
            for (item_id, quantity) in items {
                let item = s
                    .borrow_items
                    .iter()
                    .find(|i| i.id == *item_id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Borrowed item {} not found", item_id)))?;
                lifecycle::check_returnable(s.borrow_request(item.borrow_request_id)?.status)?;
                lifecycle::check_return_quantity(
                    item.quantity.max(0) as u32,
                    s.already_returned(item.id),
                    s.open_transactions(item.id).len() as u32,
                    *quantity,
                )?;

                match groups.iter_mut().find(|(p, _)| *p == item.borrow_request_id) {
                    Some((_, group)) => group.push((item.id, *quantity)),
                    None => groups.push((item.borrow_request_id, vec![(item.id, *quantity)])),
                }
            }

            let mut created = Vec::with_capacity(groups.len());
            for (borrow_request_id, group) in groups {
                let request = ReturnRequest {
                    id: Uuid::new_v4(),
                    borrow_request_id,
                    created_at: now,
                    confirmed_by: None,
                    confirmed_at: None,
                    remarks: None,
                };
                let request_items: Vec<ReturnRequestItem> = group
                    .into_iter()
                    .map(|(item_id, quantity)| ReturnRequestItem {
                        id: Uuid::new_v4(),
                        return_request_id: request.id,
                        borrow_request_item_id: item_id,
                        quantity: quantity as i32,
                    })
                    .collect();

                s.return_items.extend(request_items.iter().cloned());
                s.return_requests.insert(request.id, request.clone());
                let code = issue_code(&mut s.return_codes, request.id, policy, now)?;

                created.push(CreatedReturnRequest {
                    id: request.id,
                    borrow_request_id,
                    created_at: now,
                    items: request_items,
                    code,
                });
            }
            Ok(created)
        })
        .await
    }

    async fn confirm(&self, id: Uuid, confirmation: &Confirmation, now: DateTime<Utc>) -> AppResult<ConfirmedReturn> {
        self.write(|s| {
            let request = s
                .return_requests
                .get(&id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("Return request {} not found", id)))?;
            if request.confirmed_at.is_some() {
                return Err(AppError::AlreadyConfirmed);
            }

            let mut items: Vec<ReturnRequestItem> = s
                .return_items
                .iter()
                .filter(|ri| ri.return_request_id == id)
                .cloned()
                .collect();
            items.sort_by_key(|ri| ri.id);

            let confirmed_before = s
                .return_transactions
                .iter()
                .any(|rt| items.iter().any(|ri| ri.id == rt.return_request_item_id));
            if confirmed_before {
                return Err(AppError::AlreadyConfirmed);
            }

            if let Some(code) = &confirmation.code {
                match s.return_codes.get(&id) {
                    Some(otp) if &otp.code == code && otp.is_live(now) => {}
                    _ => return Err(AppError::InvalidOrExpiredCode),
                }
            }

            let mut returned_units = 0u32;
            for item in &items {
                let open = s.open_transactions(item.borrow_request_item_id);
                let quantity = item.quantity.max(0) as usize;
                if quantity > open.len() {
                    return Err(AppError::ExceedsRemainingQuantity);
                }
                for borrow_transaction_id in open.into_iter().take(quantity) {
                    s.return_transactions.push(ReturnTransaction {
                        id: Uuid::new_v4(),
                        borrow_transaction_id,
                        return_request_item_id: item.id,
                        created_at: now,
                    });
                    returned_units += 1;
                }
            }

            let parent = request.borrow_request_id;
            let mut borrow_request_status = s.borrow_request(parent)?.status;
            if s.outstanding_units(parent) == 0 && borrow_request_status == BorrowRequestStatus::Received {
                borrow_request_status = s.set_status(parent, BorrowRequestStatus::Fulfilled)?.status;
            }

            if let Some(stored) = s.return_requests.get_mut(&id) {
                stored.confirmed_by = Some(confirmation.confirmed_by);
                stored.confirmed_at = Some(now);
                stored.remarks = confirmation.remarks.clone();
            }
            s.return_codes.remove(&id);

            Ok(ConfirmedReturn {
                return_request_id: id,
                borrow_request_id: parent,
                returned_units,
                borrow_request_status,
            })
        })
        .await
    }

    async fn get(&self, id: Uuid) -> AppResult<ReturnRequestRecord> {
        self.read(|s| {
            let request = s
                .return_requests
                .get(&id)
                .ok_or_else(|| AppError::NotFound(format!("Return request {} not found", id)))?;
            s.return_record(request)
        })
        .await
    }

    async fn list_unconfirmed(&self, query: &ReturnRequestQuery) -> AppResult<Vec<ReturnRequestRecord>> {
        self.read(|s| {
            let category = query.category.as_deref().map(str::to_lowercase);
            let mut records = Vec::new();
            for request in s.return_requests.values().filter(|rr| rr.confirmed_at.is_none()) {
                let record = s.return_record(request)?;
                if query.user_id.is_some_and(|u| record.requested_by != u) {
                    continue;
                }
                if let Some(c) = &category {
                    if !record.lines.iter().any(|l| &l.name.to_lowercase() == c) {
                        continue;
                    }
                }
                records.push(record);
            }
            Ok(records)
        })
        .await
    }
}

#[async_trait]
impl OtpRepository for MemoryStore {
    async fn claim_code(&self, borrow_request_id: Uuid, now: DateTime<Utc>) -> AppResult<IssuedOtp> {
        self.read(|s| {
            s.claim_codes
                .get(&borrow_request_id)
                .filter(|otp| otp.is_live(now))
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("No live code for request {}", borrow_request_id)))
        })
        .await
    }

    async fn return_code(&self, return_request_id: Uuid, now: DateTime<Utc>) -> AppResult<IssuedOtp> {
        self.read(|s| {
            s.return_codes
                .get(&return_request_id)
                .filter(|otp| otp.is_live(now))
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("No live code for request {}", return_request_id)))
        })
        .await
    }

    async fn renew_expired_return_codes(&self, policy: &OtpPolicy, now: DateTime<Utc>) -> AppResult<u32> {
        self.write(|s| {
            let mut expired: Vec<Uuid> = s
                .return_codes
                .iter()
                .filter(|(_, otp)| !otp.is_live(now))
                .map(|(id, _)| *id)
                .filter(|id| {
                    s.return_requests
                        .get(id)
                        .is_some_and(|rr| rr.confirmed_at.is_none())
                })
                .collect();
            expired.sort();

            for id in &expired {
                issue_code(&mut s.return_codes, *id, policy, now)?;
            }
            Ok(expired.len() as u32)
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn basic_info(&self, user_id: Uuid) -> AppResult<UserBasicInfo> {
        self.read(|s| {
            s.users
                .get(&user_id)
                .cloned()
                .ok_or_else(|| AppError::Collaborator(format!("User {} not found in directory", user_id)))
        })
        .await
    }
}
