//! Borrow request pipeline

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use super::{anomaly::AnomalyScorer, clock::Clock, events, events::EventBus};
use crate::{
    error::{AppError, AppResult},
    lending::{lifecycle, OtpPolicy},
    models::{
        borrow::{
            AnomalyResult, BorrowRequest, BorrowRequestDetails, BorrowRequestRecord,
            BorrowedItemsQuery, CreateBorrowRequest, HistoryQuery, HistorySortBy,
            ReceiveBorrowRequest, ReviewBorrowRequest, ReviewOutcome, SortDirection,
            UpdateBorrowStatus,
        },
        IssuedOtp, UserBasicInfo,
    },
    repository::{NewBorrowRequest, Repository, Review},
};

#[derive(Clone)]
pub struct BorrowService {
    repository: Repository,
    events: EventBus,
    clock: Arc<dyn Clock>,
    otp: OtpPolicy,
    scorer: Option<Arc<dyn AnomalyScorer>>,
}

fn details(
    record: BorrowRequestRecord,
    users: &HashMap<Uuid, UserBasicInfo>,
) -> AppResult<BorrowRequestDetails> {
    let lookup = |id: Uuid| {
        users
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::Collaborator(format!("User {} not found in directory", id)))
    };

    let request = record.request;
    Ok(BorrowRequestDetails {
        id: request.id,
        created_at: request.created_at,
        borrower: lookup(request.requested_by)?,
        equipments: record.lines,
        location: request.location,
        purpose: request.purpose,
        expected_return_at: request.expected_return_at,
        returned_at: record.returned_at,
        status: request.status,
        reviewed_by: request.reviewed_by.map(lookup).transpose()?,
        reviewed_at: request.reviewed_at,
        remarks: request.remarks,
        anomaly_result: record.anomaly,
    })
}

/// Order history rows; status order is pending, approved, received, fulfilled, then closed
pub fn sort_history(rows: &mut [BorrowRequestDetails], by: HistorySortBy, direction: SortDirection) {
    rows.sort_by(|a, b| {
        let ordering = match by {
            HistorySortBy::CreatedAt => a.created_at.cmp(&b.created_at),
            HistorySortBy::ExpectedReturnAt => a.expected_return_at.cmp(&b.expected_return_at),
            HistorySortBy::ReturnedAt => a.returned_at.cmp(&b.returned_at),
            HistorySortBy::Status => a
                .status
                .rank()
                .cmp(&b.status.rank())
                .then_with(|| b.created_at.cmp(&a.created_at)),
        };
        let ordering = ordering.then_with(|| a.id.cmp(&b.id));
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
}

fn by_expected_return(direction: SortDirection) -> impl Fn(&BorrowRequestDetails, &BorrowRequestDetails) -> Ordering {
    move |a, b| {
        let ordering = a.expected_return_at.cmp(&b.expected_return_at);
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}

impl BorrowService {
    pub fn new(
        repository: Repository,
        events: EventBus,
        clock: Arc<dyn Clock>,
        otp: OtpPolicy,
        scorer: Option<Arc<dyn AnomalyScorer>>,
    ) -> Self {
        Self {
            repository,
            events,
            clock,
            otp,
            scorer,
        }
    }

    async fn hydrate(&self, records: Vec<BorrowRequestRecord>) -> AppResult<Vec<BorrowRequestDetails>> {
        let mut ids: Vec<Uuid> = records
            .iter()
            .flat_map(|r| std::iter::once(r.request.requested_by).chain(r.request.reviewed_by))
            .collect();
        ids.sort();
        ids.dedup();

        let users = self.repository.users.basic_info_many(&ids).await?;
        records.into_iter().map(|r| details(r, &users)).collect()
    }

    async fn hydrate_one(&self, record: BorrowRequestRecord) -> AppResult<BorrowRequestDetails> {
        self.hydrate(vec![record])
            .await?
            .pop()
            .ok_or_else(|| AppError::Internal("Hydration dropped a borrow request".to_string()))
    }

    /// Create a pending request. Every line must fit in the type's truly available
    /// stock at submission time; approval checks again.
    pub async fn submit(&self, input: CreateBorrowRequest) -> AppResult<BorrowRequestDetails> {
        input.validate()?;
        let items = lifecycle::normalize_borrow_items(&input.equipments)?;
        // Borrower must resolve in the directory before anything is written
        self.repository.users.basic_info(input.requested_by).await?;

        let record = self
            .repository
            .borrows
            .create(
                &NewBorrowRequest {
                    requested_by: input.requested_by,
                    location: input.location.trim().to_string(),
                    purpose: input.purpose.trim().to_string(),
                    expected_return_at: input.expected_return_at,
                    items,
                },
                self.clock.now(),
            )
            .await?;

        tracing::info!(
            borrow_request_id = %record.request.id,
            requested_by = %record.request.requested_by,
            lines = record.lines.len(),
            "Borrow request submitted"
        );

        let created = self.hydrate_one(record).await?;
        self.events.emit(events::BORROW_CREATE, &created).await;
        self.spawn_scoring(created.clone());
        Ok(created)
    }

    fn spawn_scoring(&self, request: BorrowRequestDetails) {
        let Some(scorer) = self.scorer.clone() else {
            return;
        };
        let service = self.clone();

        tokio::spawn(async move {
            let result = match scorer.score(&request).await {
                Ok(score) => AnomalyResult {
                    borrow_request_id: request.id,
                    score: score.score,
                    is_anomaly: score.is_anomaly,
                    is_false_positive: None,
                },
                Err(e) => {
                    tracing::warn!(borrow_request_id = %request.id, error = %e, "Anomaly scoring failed");
                    return;
                }
            };

            if let Err(e) = service.record_anomaly_result(result).await {
                tracing::warn!(borrow_request_id = %request.id, error = %e, "Failed to store anomaly result");
            }
        });
    }

    /// Store an anomaly score and broadcast it
    pub async fn record_anomaly_result(&self, result: AnomalyResult) -> AppResult<()> {
        self.repository.borrows.record_anomaly(&result).await?;
        tracing::info!(
            borrow_request_id = %result.borrow_request_id,
            score = result.score,
            is_anomaly = result.is_anomaly,
            "Anomaly result recorded"
        );
        self.events.emit(events::EQUIPMENT_ANOMALY, &result).await;
        Ok(())
    }

    /// Approve or reject a pending request. Approval reserves capacity and
    /// returns the claim code.
    pub async fn review(&self, id: Uuid, input: ReviewBorrowRequest) -> AppResult<ReviewOutcome> {
        input.validate()?;
        let review = Review {
            reviewed_by: input.reviewed_by,
            decision: input.status,
            remarks: input.remarks,
        };

        let (request, claim_code) = self
            .repository
            .borrows
            .review(id, &review, &self.otp, self.clock.now())
            .await?;

        tracing::info!(borrow_request_id = %id, status = %request.status, "Borrow request reviewed");
        self.events.emit(events::BORROW_REVIEW, &request).await;
        Ok(ReviewOutcome { request, claim_code })
    }

    /// Claim approved equipment with its one-time code
    pub async fn receive(&self, id: Uuid, input: ReceiveBorrowRequest) -> AppResult<BorrowRequest> {
        input.validate()?;
        let request = self
            .repository
            .borrows
            .receive(id, input.code.trim(), self.clock.now())
            .await?;

        tracing::info!(borrow_request_id = %id, "Equipment received");
        self.events.emit(events::BORROW_RECEIVE, &request).await;
        Ok(request)
    }

    /// Administrative status change; moving an approved request to received
    /// binds units exactly like a claim
    pub async fn update_status(&self, id: Uuid, input: UpdateBorrowStatus) -> AppResult<BorrowRequest> {
        let request = self
            .repository
            .borrows
            .override_status(id, input.status, self.clock.now())
            .await?;

        tracing::info!(borrow_request_id = %id, status = %request.status, "Borrow request status overridden");
        self.events.emit(events::BORROW_STATUS, &request).await;
        Ok(request)
    }

    /// Live claim code of an approved request
    pub async fn claim_code(&self, id: Uuid) -> AppResult<IssuedOtp> {
        self.repository.otps.claim_code(id, self.clock.now()).await
    }

    pub async fn get(&self, id: Uuid) -> AppResult<BorrowRequestDetails> {
        let record = self.repository.borrows.get(id).await?;
        self.hydrate_one(record).await
    }

    pub async fn list_pending(&self) -> AppResult<Vec<BorrowRequestDetails>> {
        let records = self.repository.borrows.list_pending().await?;
        self.hydrate(records).await
    }

    pub async fn history(&self, query: &HistoryQuery) -> AppResult<Vec<BorrowRequestDetails>> {
        let records = self.repository.borrows.history(query).await?;
        let mut rows = self.hydrate(records).await?;
        sort_history(
            &mut rows,
            query.sort_by.unwrap_or_default(),
            query.sort.unwrap_or_default(),
        );
        Ok(rows)
    }

    /// Received requests with the quantity still out per line
    pub async fn borrowed_items(&self, query: &BorrowedItemsQuery) -> AppResult<Vec<BorrowRequestDetails>> {
        let records = self.repository.borrows.borrowed_items(query).await?;
        let mut rows = self.hydrate(records).await?;
        rows.sort_by(by_expected_return(query.sort.unwrap_or(SortDirection::Desc)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::borrow::BorrowRequestStatus;
    use chrono::{Duration, Utc};

    fn row(status: BorrowRequestStatus, age_minutes: i64) -> BorrowRequestDetails {
        let created_at = Utc::now() - Duration::minutes(age_minutes);
        BorrowRequestDetails {
            id: Uuid::new_v4(),
            created_at,
            borrower: UserBasicInfo {
                id: Uuid::new_v4(),
                first_name: "Ana".to_string(),
                middle_name: None,
                last_name: "Reyes".to_string(),
                avatar_url: None,
            },
            equipments: Vec::new(),
            location: "Gym".to_string(),
            purpose: "Practice".to_string(),
            expected_return_at: created_at + Duration::hours(2),
            returned_at: None,
            status,
            reviewed_by: None,
            reviewed_at: None,
            remarks: None,
            anomaly_result: None,
        }
    }

    #[test]
    fn status_sort_follows_lifecycle_rank() {
        let mut rows = vec![
            row(BorrowRequestStatus::Fulfilled, 5),
            row(BorrowRequestStatus::Pending, 10),
            row(BorrowRequestStatus::Unclaimed, 1),
            row(BorrowRequestStatus::Received, 3),
        ];
        sort_history(&mut rows, HistorySortBy::Status, SortDirection::Asc);

        let statuses: Vec<_> = rows.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                BorrowRequestStatus::Pending,
                BorrowRequestStatus::Received,
                BorrowRequestStatus::Fulfilled,
                BorrowRequestStatus::Unclaimed,
            ]
        );
    }

    #[test]
    fn created_at_sort_respects_direction() {
        let mut rows = vec![
            row(BorrowRequestStatus::Pending, 1),
            row(BorrowRequestStatus::Pending, 30),
            row(BorrowRequestStatus::Pending, 10),
        ];
        sort_history(&mut rows, HistorySortBy::CreatedAt, SortDirection::Desc);
        assert!(rows.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }
}
