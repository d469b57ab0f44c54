//! Background expiration of claim and return codes

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{clock::Clock, events, events::EventBus};
use crate::{lending::OtpPolicy, repository::Repository};

/// What one sweep changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Approved requests moved to unclaimed
    pub unclaimed: Vec<Uuid>,
    /// Return codes re-minted for unconfirmed return requests
    pub renewed_return_otps: u32,
}

#[derive(Clone)]
pub struct ExpirationSweeper {
    repository: Repository,
    events: EventBus,
    clock: Arc<dyn Clock>,
    otp: OtpPolicy,
    interval: Duration,
}

impl ExpirationSweeper {
    pub fn new(
        repository: Repository,
        events: EventBus,
        clock: Arc<dyn Clock>,
        otp: OtpPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            events,
            clock,
            otp,
            interval,
        }
    }

    /// Run both duties once. A failure in one does not skip the other.
    pub async fn run_once(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        match self.repository.borrows.expire_unclaimed(now).await {
            Ok(ids) => {
                if !ids.is_empty() {
                    info!("expiration sweep: {} approved requests unclaimed", ids.len());
                }
                for id in &ids {
                    self.events
                        .emit(events::BORROW_UNCLAIMED, &serde_json::json!({ "id": id }))
                        .await;
                }
                report.unclaimed = ids;
            }
            Err(e) => error!("expiration sweep error (claim codes): {e}"),
        }

        match self
            .repository
            .otps
            .renew_expired_return_codes(&self.otp, now)
            .await
        {
            Ok(0) => {}
            Ok(n) => {
                info!("expiration sweep: renewed {n} return codes");
                report.renewed_return_otps = n;
            }
            Err(e) => error!("expiration sweep error (return codes): {e}"),
        }

        report
    }

    /// Run the sweep every `interval` until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.interval;
            info!("expiration sweeper started (interval={interval:?})");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("expiration sweeper stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        debug!("expiration sweep");
                        self.run_once().await;
                    }
                }
            }
        })
    }
}
