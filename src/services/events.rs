//! Change notifications published after a mutation commits

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::AppResult;

pub const EQUIPMENT_CREATE: &str = "equipment:create";
pub const EQUIPMENT_UPDATE: &str = "equipment:update";
pub const EQUIPMENT_ANOMALY: &str = "equipment:anomaly";
pub const BORROW_CREATE: &str = "borrow:create";
pub const BORROW_REVIEW: &str = "borrow:review";
pub const BORROW_RECEIVE: &str = "borrow:receive";
pub const BORROW_STATUS: &str = "borrow:status";
pub const BORROW_UNCLAIMED: &str = "borrow:unclaimed";
pub const RETURN_CREATE: &str = "return:create";
pub const RETURN_CONFIRM: &str = "return:confirm";

/// Message published on the notification channel
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope<'a> {
    pub event: &'a str,
    pub data: &'a Value,
}

/// Fire-and-forget broadcast of state changes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, event: &str, payload: Value) -> AppResult<()>;
}

/// Notifier used when no broker is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, topic: &str, event: &str, payload: Value) -> AppResult<()> {
        tracing::info!(topic, event, %payload, "Event");
        Ok(())
    }
}

/// Publishes events on one topic; failures are logged and never reach the caller
#[derive(Clone)]
pub struct EventBus {
    notifier: Arc<dyn Notifier>,
    topic: String,
}

impl EventBus {
    pub fn new(notifier: Arc<dyn Notifier>, topic: impl Into<String>) -> Self {
        Self {
            notifier,
            topic: topic.into(),
        }
    }

    pub async fn emit<T: Serialize + ?Sized>(&self, event: &str, data: &T) {
        let payload = match serde_json::to_value(data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(event, error = %e, "Failed to serialize event payload");
                return;
            }
        };

        if let Err(e) = self.notifier.publish(&self.topic, event, payload).await {
            tracing::warn!(event, error = %e, "Failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use mockall::predicate::eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_publishes_on_configured_topic() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_publish()
            .with(eq("lending"), eq(BORROW_CREATE), eq(json!({ "id": 7 })))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let bus = EventBus::new(Arc::new(notifier), "lending");
        bus.emit(BORROW_CREATE, &json!({ "id": 7 })).await;
    }

    #[test]
    fn test_publish_failure_is_swallowed() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Err(AppError::Internal("broker down".into())));

        let bus = EventBus::new(Arc::new(notifier), "lending");
        tokio_test::block_on(bus.emit(RETURN_CONFIRM, &json!({ "id": 1 })));
    }
}
