//! Remote journey store client
//!
//! [`JourneyApi`] is the contract the engine depends on; [`HttpJourneyApi`]
//! is the production implementation over REST. All partial-update calls
//! accept dotted-path field maps (e.g. `"engagement.engagement_score"`) so
//! concurrent writers never clobber unrelated fields.
//!
//! The beacon call is the one deliberate exception to async discipline: it
//! spawns the request and returns immediately, because it is used while the
//! page is being torn down and nothing can await a response there.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::conversion::ConversionConfig;
use crate::error::TelemetryError;
use crate::types::{BounceEvent, ConversionEvent, CriticalData, Journey, PageVisit, SessionStatus};

/// Dotted-path partial field updates.
pub type JourneyFields = serde_json::Map<String, serde_json::Value>;

/// The remote journey store contract.
#[async_trait]
pub trait JourneyApi: Send + Sync {
    /// Create the journey record; returns the remote id.
    async fn create_journey(&self, journey: &Journey) -> Result<String, TelemetryError>;

    /// Apply dotted-path field updates to the record.
    async fn update_journey(&self, id: &str, fields: &JourneyFields)
        -> Result<(), TelemetryError>;

    async fn add_page_to_journey(&self, id: &str, page: &PageVisit) -> Result<(), TelemetryError>;

    async fn add_conversion_event(
        &self,
        id: &str,
        event: &ConversionEvent,
    ) -> Result<(), TelemetryError>;

    async fn add_bounce_event(&self, id: &str, event: &BounceEvent) -> Result<(), TelemetryError>;

    async fn update_session_status(
        &self,
        id: &str,
        status: &SessionStatus,
    ) -> Result<(), TelemetryError>;

    /// Look up an existing record by session id.
    async fn get_journey_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Journey>, TelemetryError>;

    /// Fire-and-forget delivery of the critical payload. Must not await a
    /// response; returns whether the send was accepted for dispatch.
    fn sync_critical_data_beacon(&self, id: &str, critical: &CriticalData) -> bool;

    /// Fetch the organization's conversion config; `None` when the feature
    /// is not configured.
    async fn get_conversion_config(
        &self,
        org_id: &str,
    ) -> Result<Option<ConversionConfig>, TelemetryError>;
}

/// HTTP implementation of [`JourneyApi`].
#[derive(Clone)]
pub struct HttpJourneyApi {
    http: Client,
    base_url: String,
}

impl HttpJourneyApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .user_agent(format!("{}/{}", crate::PRODUCER_NAME, crate::PULSE_VERSION))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TelemetryError> {
        let res = self.http.post(self.url(path)).json(body).send().await?;
        Self::decode(res).await
    }

    async fn post_unit<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), TelemetryError> {
        let res = self.http.post(self.url(path)).json(body).send().await?;
        Self::expect_success(res).await
    }

    async fn patch_unit<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), TelemetryError> {
        let res = self.http.patch(self.url(path)).json(body).send().await?;
        Self::expect_success(res).await
    }

    async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, TelemetryError> {
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(TelemetryError::UnexpectedStatus { status, body })
        }
    }

    async fn expect_success(res: reqwest::Response) -> Result<(), TelemetryError> {
        if res.status().is_success() {
            Ok(())
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(TelemetryError::UnexpectedStatus { status, body })
        }
    }
}

/// Response envelope for journey creation.
#[derive(serde::Deserialize)]
struct CreatedResponse {
    id: String,
}

#[async_trait]
impl JourneyApi for HttpJourneyApi {
    async fn create_journey(&self, journey: &Journey) -> Result<String, TelemetryError> {
        let created: CreatedResponse = self.post_json("/journeys", journey).await?;
        Ok(created.id)
    }

    async fn update_journey(
        &self,
        id: &str,
        fields: &JourneyFields,
    ) -> Result<(), TelemetryError> {
        self.patch_unit(&format!("/journeys/{id}"), fields).await
    }

    async fn add_page_to_journey(&self, id: &str, page: &PageVisit) -> Result<(), TelemetryError> {
        self.post_unit(&format!("/journeys/{id}/pages"), page).await
    }

    async fn add_conversion_event(
        &self,
        id: &str,
        event: &ConversionEvent,
    ) -> Result<(), TelemetryError> {
        self.post_unit(&format!("/journeys/{id}/conversions"), event)
            .await
    }

    async fn add_bounce_event(&self, id: &str, event: &BounceEvent) -> Result<(), TelemetryError> {
        self.post_unit(&format!("/journeys/{id}/bounces"), event)
            .await
    }

    async fn update_session_status(
        &self,
        id: &str,
        status: &SessionStatus,
    ) -> Result<(), TelemetryError> {
        self.patch_unit(&format!("/journeys/{id}/session"), status)
            .await
    }

    async fn get_journey_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Journey>, TelemetryError> {
        let res = self
            .http
            .get(self.url(&format!("/journeys/by-session/{session_id}")))
            .send()
            .await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(res).await.map(Some)
    }

    fn sync_critical_data_beacon(&self, id: &str, critical: &CriticalData) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let http = self.http.clone();
        let url = self.url(&format!("/journeys/{id}/beacon"));
        let payload = match serde_json::to_value(critical) {
            Ok(payload) => payload,
            Err(_) => return false,
        };
        // Dispatched without awaiting; the page may be gone before any
        // response arrives and that is fine.
        handle.spawn(async move {
            if let Err(err) = http
                .post(url)
                .json(&payload)
                .timeout(std::time::Duration::from_secs(5))
                .send()
                .await
            {
                debug!(error = %err, "Beacon send failed");
            }
        });
        true
    }

    async fn get_conversion_config(
        &self,
        org_id: &str,
    ) -> Result<Option<ConversionConfig>, TelemetryError> {
        let res = self
            .http
            .get(self.url(&format!("/organizations/{org_id}/conversion-config")))
            .send()
            .await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(res).await.map(Some)
    }
}

/// Build a dotted-path field map from key/value pairs.
///
/// Convenience for callers issuing narrow updates:
/// `fields(&[("engagement.engagement_score", json!(42))])`.
pub fn fields(pairs: &[(&str, serde_json::Value)]) -> JourneyFields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
