//! External anomaly scoring of new borrow requests

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::AnomalyConfig,
    error::{AppError, AppResult},
    models::borrow::BorrowRequestDetails,
};

/// Score returned by the scoring service
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyScore {
    pub score: f32,
    pub is_anomaly: bool,
}

#[async_trait]
pub trait AnomalyScorer: Send + Sync {
    async fn score(&self, request: &BorrowRequestDetails) -> AppResult<AnomalyScore>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoredEquipment<'a> {
    borrow_request_item_id: Uuid,
    equipment_type_id: Uuid,
    name: &'a str,
    brand: Option<&'a str>,
    model: Option<&'a str>,
    image_url: Option<&'a str>,
    quantity: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoredBorrower<'a> {
    id: Uuid,
    first_name: &'a str,
    middle_name: Option<&'a str>,
    last_name: &'a str,
    avatar_url: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoringRequest<'a> {
    borrow_request_id: Uuid,
    created_at: DateTime<FixedOffset>,
    expected_return_at: DateTime<FixedOffset>,
    borrower: ScoredBorrower<'a>,
    equipments: Vec<ScoredEquipment<'a>>,
    location: &'a str,
    purpose: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoringResponse {
    score: f32,
    is_anomaly: bool,
}

/// Scores requests over HTTP; the service answers a JSON array with one result per request
#[derive(Clone)]
pub struct HttpAnomalyScorer {
    client: reqwest::Client,
    url: String,
    offset: FixedOffset,
}

impl HttpAnomalyScorer {
    pub fn new(config: &AnomalyConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        // Hour-of-day features are computed in local time
        let offset = FixedOffset::east_opt(config.utc_offset_hours * 3600).ok_or_else(|| {
            AppError::Internal(format!("Invalid UTC offset: {}", config.utc_offset_hours))
        })?;

        Ok(Self {
            client,
            url: config.url.clone(),
            offset,
        })
    }
}

#[async_trait]
impl AnomalyScorer for HttpAnomalyScorer {
    async fn score(&self, request: &BorrowRequestDetails) -> AppResult<AnomalyScore> {
        let body = [ScoringRequest {
            borrow_request_id: request.id,
            created_at: request.created_at.with_timezone(&self.offset),
            expected_return_at: request.expected_return_at.with_timezone(&self.offset),
            borrower: ScoredBorrower {
                id: request.borrower.id,
                first_name: &request.borrower.first_name,
                middle_name: request.borrower.middle_name.as_deref(),
                last_name: &request.borrower.last_name,
                avatar_url: request.borrower.avatar_url.as_deref(),
            },
            equipments: request
                .equipments
                .iter()
                .map(|line| ScoredEquipment {
                    borrow_request_item_id: line.borrow_request_item_id,
                    equipment_type_id: line.equipment_type_id,
                    name: &line.name,
                    brand: line.brand.as_deref(),
                    model: line.model.as_deref(),
                    image_url: line.image_url.as_deref(),
                    quantity: line.quantity,
                })
                .collect(),
            location: &request.location,
            purpose: &request.purpose,
        }];

        let results: Vec<ScoringResponse> = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AppError::Collaborator(format!("Anomaly service request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| AppError::Collaborator(format!("Invalid anomaly service response: {}", e)))?;

        results
            .into_iter()
            .next()
            .map(|r| AnomalyScore {
                score: r.score,
                is_anomaly: r.is_anomaly,
            })
            .ok_or_else(|| AppError::Collaborator("Anomaly service returned no result".to_string()))
    }
}
