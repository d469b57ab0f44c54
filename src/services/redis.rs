//! Redis pub/sub notifier

use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use serde_json::Value;

use super::events::{EventEnvelope, Notifier};
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct RedisNotifier {
    client: Client,
}

impl RedisNotifier {
    /// Create a new Redis notifier and check the server answers
    pub async fn new(url: &str) -> AppResult<Self> {
        let client = Client::open(url)
            .map_err(|e| AppError::Internal(format!("Failed to create Redis client: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to connect to Redis: {}", e)))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| AppError::Internal(format!("Redis connection test failed: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn publish(&self, topic: &str, event: &str, payload: Value) -> AppResult<()> {
        let message = serde_json::to_string(&EventEnvelope {
            event,
            data: &payload,
        })
        .map_err(|e| AppError::Internal(format!("Failed to encode event: {}", e)))?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Collaborator(format!("Failed to get Redis connection: {}", e)))?;

        conn.publish::<_, _, ()>(topic, message)
            .await
            .map_err(|e| AppError::Collaborator(format!("Failed to publish to Redis: {}", e)))?;

        Ok(())
    }
}
