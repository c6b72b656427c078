//! Terminal delivery channels
//!
//! At session end the lifecycle controller must land the final record
//! exactly once through one of two channels: the retrying async path when
//! the page will stay alive (explicit destroy), or the guaranteed beacon
//! when teardown is already underway and nothing can await a round trip.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::api::{fields, JourneyApi};
use crate::error::TelemetryError;
use crate::retry::RetryPolicy;
use crate::types::{CriticalData, SessionStatus};

/// A way to land the terminal critical payload.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(
        &self,
        journey_id: &str,
        critical: &CriticalData,
    ) -> Result<(), TelemetryError>;
}

/// Awaited delivery with bounded retry. Used when the host page survives
/// session end.
pub struct RetryingAsyncChannel {
    api: Arc<dyn JourneyApi>,
    policy: RetryPolicy,
}

impl RetryingAsyncChannel {
    pub fn new(api: Arc<dyn JourneyApi>, policy: RetryPolicy) -> Self {
        Self { api, policy }
    }
}

#[async_trait]
impl DeliveryChannel for RetryingAsyncChannel {
    async fn deliver(
        &self,
        journey_id: &str,
        critical: &CriticalData,
    ) -> Result<(), TelemetryError> {
        let status = SessionStatus {
            is_active: false,
            end_time: Some(critical.end_time),
            duration: Some(critical.duration_secs),
        };
        self.policy
            .execute("session_status", |_| {
                let api = self.api.clone();
                let status = status.clone();
                let id = journey_id.to_string();
                async move { api.update_session_status(&id, &status).await }
            })
            .await?;

        let final_fields = fields(&[
            ("engagement.engagement_score", json!(critical.engagement_score)),
            ("journey.page_views", json!(critical.page_views)),
            ("journey.bounce_rate", json!(critical.bounce_rate)),
            ("session.duration", json!(critical.duration_secs)),
        ]);
        self.policy
            .execute("final_fields", |_| {
                let api = self.api.clone();
                let final_fields = final_fields.clone();
                let id = journey_id.to_string();
                async move { api.update_journey(&id, &final_fields).await }
            })
            .await
    }
}

/// Fire-and-forget beacon delivery. The send keeps running after the page
/// begins teardown; there is no response to await and no retry.
pub struct GuaranteedBeaconChannel {
    api: Arc<dyn JourneyApi>,
}

impl GuaranteedBeaconChannel {
    pub fn new(api: Arc<dyn JourneyApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl DeliveryChannel for GuaranteedBeaconChannel {
    async fn deliver(
        &self,
        journey_id: &str,
        critical: &CriticalData,
    ) -> Result<(), TelemetryError> {
        if !self.api.sync_critical_data_beacon(journey_id, critical) {
            warn!(journey_id, "Beacon dispatch was not accepted");
        }
        Ok(())
    }
}
