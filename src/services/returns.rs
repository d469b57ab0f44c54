//! Return request pipeline

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use super::{clock::Clock, events, events::EventBus};
use crate::{
    error::{AppError, AppResult},
    lending::{lifecycle, OtpPolicy},
    models::{
        borrow::SortDirection,
        returns::{
            ConfirmReturnRequest, ConfirmedReturn, CreateReturnRequest, CreatedReturnRequest,
            ReturnRequestDetails, ReturnRequestQuery, ReturnRequestRecord,
        },
        IssuedOtp, UserBasicInfo,
    },
    repository::{Confirmation, Repository},
};

#[derive(Clone)]
pub struct ReturnService {
    repository: Repository,
    events: EventBus,
    clock: Arc<dyn Clock>,
    otp: OtpPolicy,
}

fn details(
    record: ReturnRequestRecord,
    users: &HashMap<Uuid, UserBasicInfo>,
) -> AppResult<ReturnRequestDetails> {
    let lookup = |id: Uuid| {
        users
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::Collaborator(format!("User {} not found in directory", id)))
    };

    let request = record.request;
    Ok(ReturnRequestDetails {
        id: request.id,
        borrow_request_id: request.borrow_request_id,
        created_at: request.created_at,
        borrower: lookup(record.requested_by)?,
        equipments: record.lines,
        expected_return_at: record.expected_return_at,
        confirmed_by: request.confirmed_by.map(lookup).transpose()?,
        confirmed_at: request.confirmed_at,
        remarks: request.remarks,
    })
}

impl ReturnService {
    pub fn new(repository: Repository, events: EventBus, clock: Arc<dyn Clock>, otp: OtpPolicy) -> Self {
        Self {
            repository,
            events,
            clock,
            otp,
        }
    }

    async fn hydrate(&self, records: Vec<ReturnRequestRecord>) -> AppResult<Vec<ReturnRequestDetails>> {
        let mut ids: Vec<Uuid> = records
            .iter()
            .flat_map(|r| std::iter::once(r.requested_by).chain(r.request.confirmed_by))
            .collect();
        ids.sort();
        ids.dedup();

        let users = self.repository.users.basic_info_many(&ids).await?;
        records.into_iter().map(|r| details(r, &users)).collect()
    }

    /// Hand back borrowed units. Lines may span several borrow requests; one
    /// return request (and one code) is created per borrow request.
    pub async fn submit(&self, input: CreateReturnRequest) -> AppResult<Vec<CreatedReturnRequest>> {
        let items = lifecycle::normalize_return_items(&input.items)?;

        let created = self
            .repository
            .returns
            .create(&items, &self.otp, self.clock.now())
            .await?;

        for request in &created {
            tracing::info!(
                return_request_id = %request.id,
                borrow_request_id = %request.borrow_request_id,
                lines = request.items.len(),
                "Return request submitted"
            );
            self.events.emit(events::RETURN_CREATE, request).await;
        }
        Ok(created)
    }

    /// Close the borrow transactions of a return request. A second confirmation fails.
    pub async fn confirm(&self, id: Uuid, input: ConfirmReturnRequest) -> AppResult<ConfirmedReturn> {
        input.validate()?;
        let confirmation = Confirmation {
            confirmed_by: input.confirmed_by,
            remarks: input.remarks,
            code: input.code.map(|c| c.trim().to_string()),
        };

        let confirmed = self
            .repository
            .returns
            .confirm(id, &confirmation, self.clock.now())
            .await?;

        tracing::info!(
            return_request_id = %id,
            returned_units = confirmed.returned_units,
            borrow_request_status = %confirmed.borrow_request_status,
            "Return confirmed"
        );
        self.events.emit(events::RETURN_CONFIRM, &confirmed).await;
        Ok(confirmed)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<ReturnRequestDetails> {
        let record = self.repository.returns.get(id).await?;
        self.hydrate(vec![record])
            .await?
            .pop()
            .ok_or_else(|| AppError::Internal("Hydration dropped a return request".to_string()))
    }

    /// Unconfirmed return requests, ordered on expected return time
    pub async fn list(&self, query: &ReturnRequestQuery) -> AppResult<Vec<ReturnRequestDetails>> {
        let records = self.repository.returns.list_unconfirmed(query).await?;
        let mut rows = self.hydrate(records).await?;

        let direction = query.sort.unwrap_or(SortDirection::Desc);
        rows.sort_by(|a, b| {
            let ordering = a
                .expected_return_at
                .cmp(&b.expected_return_at)
                .then_with(|| a.created_at.cmp(&b.created_at));
            match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
        Ok(rows)
    }

    /// Live return code of an unconfirmed return request
    pub async fn return_code(&self, id: Uuid) -> AppResult<IssuedOtp> {
        self.repository.otps.return_code(id, self.clock.now()).await
    }
}
