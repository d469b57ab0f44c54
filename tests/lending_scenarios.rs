//! End-to-end lending scenarios against the in-memory backend

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use equiplend_server::{
    config::LendingConfig,
    error::{AppError, AppResult},
    models::{
        borrow::{
            BorrowItemInput, BorrowRequestDetails, BorrowRequestStatus, BorrowedItemsQuery,
            CreateBorrowRequest, HistoryQuery, HistorySortBy, ReceiveBorrowRequest,
            ReviewBorrowRequest, ReviewDecision, ReviewOutcome, SortDirection, UpdateBorrowStatus,
        },
        equipment::{CreateEquipment, EquipmentQuery, UnitStatus},
        returns::{ConfirmReturnRequest, CreateReturnRequest, CreatedReturnRequest, ReturnItemInput},
        Availability, UserBasicInfo,
    },
    repository::{memory::MemoryStore, Repository},
    services::{
        anomaly::{AnomalyScore, AnomalyScorer},
        clock::{Clock, ManualClock},
        events::{EventBus, Notifier},
        Services,
    },
};

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingNotifier {
    fn names(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, _topic: &str, event: &str, payload: Value) -> AppResult<()> {
        self.events.lock().unwrap().push((event.to_string(), payload));
        Ok(())
    }
}

struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn publish(&self, _topic: &str, _event: &str, _payload: Value) -> AppResult<()> {
        Err(AppError::Collaborator("broker down".to_string()))
    }
}

struct FixedScorer(f32);

#[async_trait]
impl AnomalyScorer for FixedScorer {
    async fn score(&self, _request: &BorrowRequestDetails) -> AppResult<AnomalyScore> {
        Ok(AnomalyScore {
            score: self.0,
            is_anomaly: self.0 > 0.5,
        })
    }
}

struct Harness {
    services: Services,
    repository: Repository,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
    borrower: Uuid,
    reviewer: Uuid,
}

async fn add_user(store: &MemoryStore, first_name: &str, last_name: &str) -> Uuid {
    let id = Uuid::new_v4();
    store
        .add_user(UserBasicInfo {
            id,
            first_name: first_name.to_string(),
            middle_name: None,
            last_name: last_name.to_string(),
            avatar_url: None,
        })
        .await;
    id
}

async fn harness_with(notifier: Arc<dyn Notifier>, scorer: Option<Arc<dyn AnomalyScorer>>) -> Harness {
    harness_with_config(notifier, scorer, &LendingConfig::default()).await
}

async fn harness_with_config(
    notifier: Arc<dyn Notifier>,
    scorer: Option<Arc<dyn AnomalyScorer>>,
    lending: &LendingConfig,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let borrower = add_user(&store, "Ana", "Reyes").await;
    let reviewer = add_user(&store, "Marco", "Santos").await;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let repository = Repository::memory(store.clone());
    let services = Services::new(
        repository.clone(),
        lending,
        EventBus::new(notifier, "equipment"),
        scorer,
        clock.clone(),
    );

    Harness {
        services,
        repository,
        clock,
        notifier: Arc::new(RecordingNotifier::default()),
        borrower,
        reviewer,
    }
}

async fn harness() -> Harness {
    let notifier = Arc::new(RecordingNotifier::default());
    let mut h = harness_with(notifier.clone(), None).await;
    h.notifier = notifier;
    h
}

impl Harness {
    async fn add_equipment(&self, name: &str, quantity: u32) -> Uuid {
        self.services
            .catalog
            .create_equipment(CreateEquipment {
                name: name.to_string(),
                brand: None,
                model: None,
                image_url: None,
                acquired_at: self.clock.now(),
                quantity,
            })
            .await
            .unwrap()
            .equipment_type
            .id
    }

    async fn submit_as(&self, user: Uuid, items: &[(Uuid, i32)]) -> AppResult<BorrowRequestDetails> {
        self.services
            .borrows
            .submit(CreateBorrowRequest {
                requested_by: user,
                location: "Gym".to_string(),
                purpose: "Varsity training".to_string(),
                expected_return_at: self.clock.now() + Duration::days(2),
                equipments: items
                    .iter()
                    .map(|(equipment_type_id, quantity)| BorrowItemInput {
                        equipment_type_id: *equipment_type_id,
                        quantity: *quantity,
                    })
                    .collect(),
            })
            .await
    }

    async fn submit(&self, type_id: Uuid, quantity: i32) -> AppResult<BorrowRequestDetails> {
        self.submit_as(self.borrower, &[(type_id, quantity)]).await
    }

    async fn review(&self, id: Uuid, status: ReviewDecision) -> AppResult<ReviewOutcome> {
        self.services
            .borrows
            .review(
                id,
                ReviewBorrowRequest {
                    reviewed_by: self.reviewer,
                    status,
                    remarks: None,
                },
            )
            .await
    }

    async fn approve(&self, id: Uuid) -> AppResult<String> {
        let outcome = self.review(id, ReviewDecision::Approved).await?;
        Ok(outcome.claim_code.expect("approval issues a claim code").code)
    }

    async fn receive(&self, id: Uuid, code: &str) -> AppResult<()> {
        self.services
            .borrows
            .receive(id, ReceiveBorrowRequest { code: code.to_string() })
            .await
            .map(|_| ())
    }

    /// Submit, approve and claim in one go
    async fn borrow(&self, type_id: Uuid, quantity: i32) -> BorrowRequestDetails {
        let request = self.submit(type_id, quantity).await.unwrap();
        let code = self.approve(request.id).await.unwrap();
        self.receive(request.id, &code).await.unwrap();
        request
    }

    async fn return_items(&self, items: &[(Uuid, i32)]) -> AppResult<Vec<CreatedReturnRequest>> {
        self.services
            .returns
            .submit(CreateReturnRequest {
                items: items
                    .iter()
                    .map(|(borrow_request_item_id, quantity)| ReturnItemInput {
                        borrow_request_item_id: *borrow_request_item_id,
                        quantity: *quantity,
                    })
                    .collect(),
            })
            .await
    }

    async fn confirm(&self, id: Uuid, code: Option<&str>) -> AppResult<BorrowRequestStatus> {
        self.services
            .returns
            .confirm(
                id,
                ConfirmReturnRequest {
                    confirmed_by: self.reviewer,
                    remarks: Some("Checked".to_string()),
                    code: code.map(str::to_string),
                },
            )
            .await
            .map(|c| c.borrow_request_status)
    }

    async fn status(&self, id: Uuid) -> BorrowRequestStatus {
        self.services.borrows.get(id).await.unwrap().status
    }

    async fn availability(&self, type_id: Uuid) -> Availability {
        self.services.catalog.type_availability(type_id).await.unwrap()
    }
}

fn assert_conserved(a: &Availability) {
    assert_eq!(a.available + a.reserved + a.borrowed, a.total, "{:?}", a);
}

#[tokio::test]
async fn approval_rechecks_capacity_against_other_approvals() {
    let h = harness().await;
    let volleyball = h.add_equipment("Volleyball", 4).await;

    let first = h.submit(volleyball, 3).await.unwrap();
    let second = h.submit(volleyball, 2).await.unwrap();

    h.approve(first.id).await.unwrap();
    let err = h.approve(second.id).await.unwrap_err();
    assert!(matches!(err, AppError::InsufficientQuantity));
    assert_eq!(h.status(second.id).await, BorrowRequestStatus::Pending);

    let smaller = h.submit(volleyball, 1).await.unwrap();
    h.approve(smaller.id).await.unwrap();

    let availability = h.availability(volleyball).await;
    assert_eq!(availability.reserved, 4);
    assert_eq!(availability.available, 0);
}

#[tokio::test]
async fn partial_return_keeps_request_received_until_every_unit_is_back() {
    let h = harness().await;
    let racket = h.add_equipment("Badminton Racket", 2).await;

    let request = h.borrow(racket, 2).await;
    let item_id = request.equipments[0].borrow_request_item_id;
    assert_eq!(h.availability(racket).await.borrowed, 2);

    let first = h.return_items(&[(item_id, 1)]).await.unwrap();
    assert_eq!(first.len(), 1);
    let status = h.confirm(first[0].id, Some(&first[0].code.code)).await.unwrap();
    assert_eq!(status, BorrowRequestStatus::Received);

    let availability = h.availability(racket).await;
    assert_eq!(availability.borrowed, 1);
    assert_eq!(availability.available, 1);

    let outstanding = h
        .services
        .borrows
        .borrowed_items(&BorrowedItemsQuery::default())
        .await
        .unwrap();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].equipments[0].quantity, 1);

    let second = h.return_items(&[(item_id, 1)]).await.unwrap();
    let status = h.confirm(second[0].id, None).await.unwrap();
    assert_eq!(status, BorrowRequestStatus::Fulfilled);

    let details = h.services.borrows.get(request.id).await.unwrap();
    assert_eq!(details.status, BorrowRequestStatus::Fulfilled);
    assert!(details.returned_at.is_some());
    assert_eq!(h.availability(racket).await.available, 2);
}

#[tokio::test]
async fn sweep_releases_reservations_whose_claim_code_expired() {
    let h = harness().await;
    let ball = h.add_equipment("Basketball", 3).await;

    let request = h.submit(ball, 2).await.unwrap();
    h.approve(request.id).await.unwrap();
    assert_eq!(h.availability(ball).await.available, 1);
    assert!(matches!(
        h.submit(ball, 2).await.unwrap_err(),
        AppError::InsufficientQuantity
    ));

    h.clock.advance(Duration::minutes(31));
    let report = h.services.sweeper.run_once().await;
    assert_eq!(report.unclaimed, vec![request.id]);

    assert_eq!(h.status(request.id).await, BorrowRequestStatus::Unclaimed);
    assert_eq!(h.availability(ball).await.available, 3);
    assert!(matches!(
        h.services.borrows.claim_code(request.id).await.unwrap_err(),
        AppError::NotFound(_)
    ));
    assert!(h.notifier.names().contains(&"borrow:unclaimed".to_string()));

    h.submit(ball, 2).await.unwrap();

    let again = h.services.sweeper.run_once().await;
    assert!(again.unclaimed.is_empty());
}

#[tokio::test]
async fn live_codes_survive_the_sweep() {
    let h = harness().await;
    let ball = h.add_equipment("Football", 2).await;

    let request = h.submit(ball, 1).await.unwrap();
    let code = h.approve(request.id).await.unwrap();

    h.clock.advance(Duration::minutes(10));
    assert!(h.services.sweeper.run_once().await.unclaimed.is_empty());
    assert_eq!(h.services.borrows.claim_code(request.id).await.unwrap().code, code);
    h.receive(request.id, &code).await.unwrap();
}

#[tokio::test]
async fn claim_code_is_single_use() {
    let h = harness().await;
    let net = h.add_equipment("Volleyball Net", 1).await;

    let request = h.submit(net, 1).await.unwrap();
    let code = h.approve(request.id).await.unwrap();

    assert!(matches!(
        h.receive(request.id, "not-it").await.unwrap_err(),
        AppError::InvalidOrExpiredCode
    ));

    h.receive(request.id, &code).await.unwrap();
    assert_eq!(h.status(request.id).await, BorrowRequestStatus::Received);

    assert!(matches!(
        h.receive(request.id, &code).await.unwrap_err(),
        AppError::InvalidOrExpiredCode
    ));
    assert_eq!(h.availability(net).await.borrowed, 1);
}

#[tokio::test]
async fn expired_claim_code_is_rejected_before_the_sweep() {
    let h = harness().await;
    let mat = h.add_equipment("Yoga Mat", 2).await;

    let request = h.submit(mat, 1).await.unwrap();
    let code = h.approve(request.id).await.unwrap();

    h.clock.advance(Duration::minutes(30));
    assert!(matches!(
        h.receive(request.id, &code).await.unwrap_err(),
        AppError::InvalidOrExpiredCode
    ));
    assert_eq!(h.status(request.id).await, BorrowRequestStatus::Approved);
}

#[tokio::test]
async fn confirmation_is_one_shot() {
    let h = harness().await;
    let cone = h.add_equipment("Training Cone", 3).await;

    let request = h.borrow(cone, 2).await;
    let item_id = request.equipments[0].borrow_request_item_id;
    let created = h.return_items(&[(item_id, 1)]).await.unwrap();

    h.confirm(created[0].id, None).await.unwrap();
    let before = h.availability(cone).await;

    assert!(matches!(
        h.confirm(created[0].id, None).await.unwrap_err(),
        AppError::AlreadyConfirmed
    ));
    assert_eq!(h.availability(cone).await, before);
    assert_eq!(before.borrowed, 1);
}

#[tokio::test]
async fn counts_are_conserved_through_the_lifecycle() {
    let h = harness().await;
    let bat = h.add_equipment("Baseball Bat", 5).await;
    assert_conserved(&h.availability(bat).await);

    let held = h.submit(bat, 2).await.unwrap();
    let code = h.approve(held.id).await.unwrap();
    let a = h.availability(bat).await;
    assert_conserved(&a);
    assert_eq!(a.reserved, 2);

    let waiting = h.submit(bat, 1).await.unwrap();
    h.approve(waiting.id).await.unwrap();
    assert_conserved(&h.availability(bat).await);

    h.receive(held.id, &code).await.unwrap();
    let a = h.availability(bat).await;
    assert_conserved(&a);
    assert_eq!((a.borrowed, a.reserved, a.available), (2, 1, 2));

    let item_id = held.equipments[0].borrow_request_item_id;
    let created = h.return_items(&[(item_id, 2)]).await.unwrap();
    h.confirm(created[0].id, None).await.unwrap();
    let a = h.availability(bat).await;
    assert_conserved(&a);
    assert_eq!((a.borrowed, a.reserved, a.available), (0, 1, 4));
}

#[tokio::test]
async fn unit_status_reports_holder_and_reserver() {
    let h = harness().await;
    let ball = h.add_equipment("Tennis Ball", 3).await;

    let borrowed = h.borrow(ball, 1).await;
    let reserved = h.submit(ball, 1).await.unwrap();
    h.approve(reserved.id).await.unwrap();

    let summary = h
        .services
        .catalog
        .list_equipment(&EquipmentQuery::default())
        .await
        .unwrap();
    let statuses: Vec<(UnitStatus, u32)> = summary.iter().map(|s| (s.status, s.quantity)).collect();
    assert_eq!(
        statuses,
        vec![
            (UnitStatus::Available, 1),
            (UnitStatus::Reserved, 1),
            (UnitStatus::Borrowed, 1)
        ]
    );
    assert_eq!(summary[2].holder.as_ref().map(|u| u.id), Some(h.borrower));

    let ledger = h.repository.catalog.ledger(ball).await.unwrap();
    for resolved in ledger.resolve() {
        let details = h.services.catalog.unit_status(resolved.unit.id).await.unwrap();
        assert_eq!(details.status, resolved.status);
        match details.status {
            UnitStatus::Borrowed => assert_eq!(details.borrow_request_id, Some(borrowed.id)),
            UnitStatus::Reserved => assert_eq!(details.borrow_request_id, Some(reserved.id)),
            UnitStatus::Available => assert!(details.holder.is_none()),
        }
    }
}

#[tokio::test]
async fn concurrent_claims_never_share_a_unit() {
    let h = harness().await;
    let paddle = h.add_equipment("Table Tennis Paddle", 6).await;

    let mut claims = Vec::new();
    for _ in 0..3 {
        let request = h.submit(paddle, 2).await.unwrap();
        let code = h.approve(request.id).await.unwrap();
        claims.push((request.id, code));
    }

    let handles: Vec<_> = claims
        .iter()
        .cloned()
        .map(|(id, code)| {
            let borrows = h.services.borrows.clone();
            tokio::spawn(async move { borrows.receive(id, ReceiveBorrowRequest { code }).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let ledger = h.repository.catalog.ledger(paddle).await.unwrap();
    assert_eq!(ledger.borrowed(), 6);

    let resolved = ledger.resolve();
    for (id, _) in &claims {
        let held = resolved
            .iter()
            .filter(|u| u.holder.map(|holder| holder.borrow_request_id) == Some(*id))
            .count();
        assert_eq!(held, 2);
    }
}

#[tokio::test]
async fn returns_cannot_exceed_what_was_borrowed() {
    let h = harness().await;
    let glove = h.add_equipment("Boxing Glove", 3).await;

    let pending = h.submit(glove, 1).await.unwrap();
    assert!(matches!(
        h.return_items(&[(pending.equipments[0].borrow_request_item_id, 1)])
            .await
            .unwrap_err(),
        AppError::InvalidBorrowRequestStatus(_)
    ));

    let request = h.borrow(glove, 2).await;
    let item_id = request.equipments[0].borrow_request_item_id;

    assert!(matches!(
        h.return_items(&[(item_id, 3)]).await.unwrap_err(),
        AppError::ExceedsRemainingQuantity
    ));
    assert!(matches!(
        h.return_items(&[(item_id, 0)]).await.unwrap_err(),
        AppError::Validation(_)
    ));

    let all = h.return_items(&[(item_id, 2)]).await.unwrap();
    let extra = h.return_items(&[(item_id, 1)]).await.unwrap();

    assert_eq!(h.confirm(all[0].id, None).await.unwrap(), BorrowRequestStatus::Fulfilled);
    assert!(matches!(
        h.confirm(extra[0].id, None).await.unwrap_err(),
        AppError::ExceedsRemainingQuantity
    ));
    assert_eq!(h.availability(glove).await.borrowed, 0);
}

#[tokio::test]
async fn one_submission_creates_a_return_request_per_borrow_request() {
    let h = harness().await;
    let ball = h.add_equipment("Rugby Ball", 2).await;
    let pump = h.add_equipment("Ball Pump", 2).await;

    let first = h.borrow(ball, 1).await;
    let second = h.borrow(pump, 1).await;

    let created = h
        .return_items(&[
            (first.equipments[0].borrow_request_item_id, 1),
            (second.equipments[0].borrow_request_item_id, 1),
        ])
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert_ne!(created[0].code.code, created[1].code.code);

    let parents: Vec<Uuid> = created.iter().map(|c| c.borrow_request_id).collect();
    assert!(parents.contains(&first.id) && parents.contains(&second.id));

    let listed = h
        .services
        .returns
        .list(&Default::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|r| r.borrower.id == h.borrower));
}

#[tokio::test]
async fn return_codes_are_renewed_instead_of_expiring() {
    let h = harness().await;
    let rope = h.add_equipment("Jump Rope", 1).await;

    let request = h.borrow(rope, 1).await;
    let created = h
        .return_items(&[(request.equipments[0].borrow_request_item_id, 1)])
        .await
        .unwrap();
    let return_id = created[0].id;
    let old_code = created[0].code.clone();

    h.clock.advance(Duration::minutes(45));
    assert!(matches!(
        h.confirm(return_id, Some(&old_code.code)).await.unwrap_err(),
        AppError::InvalidOrExpiredCode
    ));

    let report = h.services.sweeper.run_once().await;
    assert_eq!(report.renewed_return_otps, 1);

    let renewed = h.services.returns.return_code(return_id).await.unwrap();
    assert!(renewed.expires_at > h.clock.now());
    assert!(renewed.expires_at > old_code.expires_at);

    assert_eq!(
        h.confirm(return_id, Some(&renewed.code)).await.unwrap(),
        BorrowRequestStatus::Fulfilled
    );
    assert_eq!(h.services.sweeper.run_once().await.renewed_return_otps, 0);
}

#[tokio::test]
async fn status_overrides_follow_the_allowed_transitions() {
    let h = harness().await;
    let kit = h.add_equipment("First Aid Kit", 2).await;
    let set = |status| UpdateBorrowStatus { status };

    let pending = h.submit(kit, 1).await.unwrap();
    assert!(matches!(
        h.services
            .borrows
            .update_status(pending.id, set(BorrowRequestStatus::Approved))
            .await
            .unwrap_err(),
        AppError::InvalidBorrowRequestStatus(_)
    ));

    h.approve(pending.id).await.unwrap();
    h.services
        .borrows
        .update_status(pending.id, set(BorrowRequestStatus::Received))
        .await
        .unwrap();
    assert_eq!(h.availability(kit).await.borrowed, 1);

    assert!(matches!(
        h.services
            .borrows
            .update_status(pending.id, set(BorrowRequestStatus::Fulfilled))
            .await
            .unwrap_err(),
        AppError::InvalidBorrowRequestStatus(_)
    ));

    let released = h.submit(kit, 1).await.unwrap();
    h.approve(released.id).await.unwrap();
    assert_eq!(h.availability(kit).await.reserved, 1);
    h.services
        .borrows
        .update_status(released.id, set(BorrowRequestStatus::Unclaimed))
        .await
        .unwrap();
    assert_eq!(h.availability(kit).await.available, 1);

    let rejected = h.submit(kit, 1).await.unwrap();
    let request = h
        .services
        .borrows
        .update_status(rejected.id, set(BorrowRequestStatus::Rejected))
        .await
        .unwrap();
    assert_eq!(request.status, BorrowRequestStatus::Rejected);
}

#[tokio::test]
async fn rejected_requests_hold_no_capacity() {
    let h = harness().await;
    let whistle = h.add_equipment("Whistle", 2).await;

    let request = h.submit(whistle, 2).await.unwrap();
    let outcome = h.review(request.id, ReviewDecision::Rejected).await.unwrap();
    assert!(outcome.claim_code.is_none());
    assert_eq!(outcome.request.reviewed_by, Some(h.reviewer));
    assert_eq!(h.availability(whistle).await.available, 2);

    assert!(matches!(
        h.approve(request.id).await.unwrap_err(),
        AppError::InvalidBorrowRequestStatus(_)
    ));
}

#[tokio::test]
async fn submission_validates_before_writing() {
    let h = harness().await;
    let ball = h.add_equipment("Volleyball", 4).await;

    assert!(matches!(
        h.submit_as(h.borrower, &[]).await.unwrap_err(),
        AppError::Validation(_)
    ));
    assert!(matches!(h.submit(ball, 0).await.unwrap_err(), AppError::Validation(_)));
    assert!(matches!(h.submit(ball, -1).await.unwrap_err(), AppError::Validation(_)));
    assert!(matches!(h.submit(ball, 5).await.unwrap_err(), AppError::InsufficientQuantity));
    assert!(matches!(
        h.submit(Uuid::new_v4(), 1).await.unwrap_err(),
        AppError::NotFound(_)
    ));

    let stick = h.add_equipment("Hockey Stick", 1).await;
    assert!(matches!(
        h.submit_as(h.borrower, &[(ball, 1), (stick, 2)]).await.unwrap_err(),
        AppError::InsufficientQuantity
    ));
    assert!(h.services.borrows.list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_equipment_lines_are_merged() {
    let h = harness().await;
    let ball = h.add_equipment("Volleyball", 4).await;

    let request = h.submit_as(h.borrower, &[(ball, 1), (ball, 2)]).await.unwrap();
    assert_eq!(request.equipments.len(), 1);
    assert_eq!(request.equipments[0].quantity, 3);
}

#[tokio::test]
async fn acquiring_an_existing_type_adds_units() {
    let h = harness().await;
    let first = h.add_equipment("Volleyball", 2).await;
    let second = h.add_equipment("  Volleyball ", 3).await;

    assert_eq!(first, second);
    assert_eq!(h.availability(first).await.total, 5);
    assert_eq!(
        h.services.catalog.equipment_names().await.unwrap(),
        vec!["Volleyball".to_string()]
    );
}

#[tokio::test]
async fn history_filters_and_sorts() {
    let h = harness().await;
    let ball = h.add_equipment("Volleyball", 4).await;
    let racket = h.add_equipment("Tennis Racket", 2).await;

    let old = h.submit(ball, 1).await.unwrap();
    h.clock.advance(Duration::hours(1));
    let received = h.borrow(racket, 1).await;
    h.clock.advance(Duration::hours(1));
    let newest = h.submit(ball, 1).await.unwrap();

    let by_created = h
        .services
        .borrows
        .history(&HistoryQuery {
            sort_by: Some(HistorySortBy::CreatedAt),
            sort: Some(SortDirection::Desc),
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<Uuid> = by_created.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![newest.id, received.id, old.id]);

    let by_status = h.services.borrows.history(&HistoryQuery::default()).await.unwrap();
    assert_eq!(by_status.last().map(|r| r.id), Some(received.id));

    let rackets = h
        .services
        .borrows
        .history(&HistoryQuery {
            category: Some("tennis racket".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rackets.len(), 1);
    assert_eq!(rackets[0].reviewed_by.as_ref().map(|u| u.id), Some(h.reviewer));

    let by_reviewer = h
        .services
        .borrows
        .history(&HistoryQuery {
            search: Some("santos".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_reviewer.len(), 1);
    assert_eq!(by_reviewer[0].id, received.id);
}

#[tokio::test]
async fn events_follow_committed_mutations() {
    let h = harness().await;
    let ball = h.add_equipment("Volleyball", 2).await;

    let request = h.borrow(ball, 1).await;
    let created = h
        .return_items(&[(request.equipments[0].borrow_request_item_id, 1)])
        .await
        .unwrap();
    h.confirm(created[0].id, None).await.unwrap();

    assert_eq!(
        h.notifier.names(),
        vec![
            "equipment:create",
            "borrow:create",
            "borrow:review",
            "borrow:receive",
            "return:create",
            "return:confirm",
        ]
    );

    let _ = h.submit(ball, 9).await.unwrap_err();
    assert_eq!(h.notifier.names().len(), 6);
}

#[tokio::test]
async fn publish_failures_do_not_fail_the_operation() {
    let h = harness_with(Arc::new(FailingNotifier), None).await;
    let ball = h.add_equipment("Volleyball", 1).await;

    let request = h.borrow(ball, 1).await;
    assert_eq!(h.status(request.id).await, BorrowRequestStatus::Received);
}

#[tokio::test]
async fn anomaly_score_is_recorded_after_submission() {
    let notifier = Arc::new(RecordingNotifier::default());
    let mut h = harness_with(notifier.clone(), Some(Arc::new(FixedScorer(0.9)))).await;
    h.notifier = notifier;
    let ball = h.add_equipment("Volleyball", 2).await;

    let request = h.submit(ball, 1).await.unwrap();

    let mut result = None;
    for _ in 0..100 {
        result = h.services.borrows.get(request.id).await.unwrap().anomaly_result;
        if result.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let result = result.expect("anomaly result stored");
    assert!(result.is_anomaly);
    assert!((result.score - 0.9).abs() < f32::EPSILON);
    assert!(h.notifier.names().contains(&"equipment:anomaly".to_string()));
}

#[tokio::test]
async fn unknown_borrowers_are_rejected_before_anything_is_stored() {
    let h = harness().await;
    let ball = h.add_equipment("Volleyball", 2).await;

    let err = h.submit_as(Uuid::new_v4(), &[(ball, 1)]).await.unwrap_err();
    assert!(matches!(err, AppError::Collaborator(_)));

    // Nothing was stored for the unknown borrower, so other readers are unaffected
    let request = h.submit(ball, 1).await.unwrap();
    let pending = h.services.borrows.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, request.id);
    assert_eq!(h.availability(ball).await.available, 2);
}

#[tokio::test]
async fn claim_code_space_exhaustion_leaves_request_pending() {
    // One-digit codes: at most ten claim codes can be live at once
    let lending = LendingConfig {
        otp_length: 1,
        otp_max_attempts: 5,
        ..LendingConfig::default()
    };
    let h = harness_with_config(Arc::new(RecordingNotifier::default()), None, &lending).await;
    let cones = h.add_equipment("Training cone", 12).await;

    let mut codes = Vec::new();
    let mut exhausted = Vec::new();
    for _ in 0..12 {
        let request = h.submit(cones, 1).await.unwrap();
        match h.approve(request.id).await {
            Ok(code) => codes.push(code),
            Err(AppError::OtpGenerationExhausted(attempts)) => {
                assert_eq!(attempts, 5);
                exhausted.push(request.id);
            }
            Err(e) => panic!("unexpected review error: {:?}", e),
        }
    }

    assert!(codes.len() <= 10);
    assert!(exhausted.len() >= 2);
    let mut unique = codes.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), codes.len(), "live claim codes must be distinct");

    for id in &exhausted {
        assert_eq!(h.status(*id).await, BorrowRequestStatus::Pending);
    }
    let a = h.availability(cones).await;
    assert_eq!(a.reserved as usize, codes.len());
    assert_conserved(&a);
}
