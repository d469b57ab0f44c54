//! Business logic services

pub mod anomaly;
pub mod borrow;
pub mod catalog;
pub mod clock;
pub mod events;
pub mod redis;
pub mod returns;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use crate::{config::LendingConfig, lending::OtpPolicy, repository::Repository};

use self::{anomaly::AnomalyScorer, clock::Clock, events::EventBus};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub catalog: catalog::CatalogService,
    pub borrows: borrow::BorrowService,
    pub returns: returns::ReturnService,
    pub sweeper: sweeper::ExpirationSweeper,
}

impl Services {
    /// Create all services over the given repository
    pub fn new(
        repository: Repository,
        lending: &LendingConfig,
        events: EventBus,
        scorer: Option<Arc<dyn AnomalyScorer>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let otp = OtpPolicy::from_config(lending);

        Self {
            catalog: catalog::CatalogService::new(repository.clone(), events.clone(), clock.clone()),
            borrows: borrow::BorrowService::new(
                repository.clone(),
                events.clone(),
                clock.clone(),
                otp.clone(),
                scorer,
            ),
            returns: returns::ReturnService::new(repository.clone(), events.clone(), clock.clone(), otp.clone()),
            sweeper: sweeper::ExpirationSweeper::new(
                repository,
                events,
                clock,
                otp,
                Duration::from_secs(lending.sweep_interval_seconds.max(1)),
            ),
        }
    }
}
