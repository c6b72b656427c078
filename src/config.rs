//! Engine configuration
//!
//! All timing windows the engine depends on live here so embedders can tune
//! them instead of relying on hardcoded constants. Defaults match the
//! documented behavior of the engine.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Session staleness window: a device-scoped session mirror older than this
/// is ignored and a new session is minted.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A prior remote record that ended within this window is not reactivated;
/// a new session is started instead. Prevents zombie sessions from rapid
/// tab toggling.
pub const DEFAULT_RESUME_SUPPRESSION: Duration = Duration::from_secs(5);

/// Interval between periodic engagement score recomputations and syncs.
pub const DEFAULT_SCORE_INTERVAL: Duration = Duration::from_secs(30);

/// Debounce window for scroll depth recomputation.
pub const DEFAULT_SCROLL_DEBOUNCE: Duration = Duration::from_millis(500);

/// Trailing debounce before interaction counters are synced to the backend.
pub const DEFAULT_INTERACTION_SYNC_DEBOUNCE: Duration = Duration::from_secs(1);

/// Configuration for a single engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the remote journey store.
    pub base_url: String,
    /// Organization identifier; `None` disables conversion-config features.
    pub organization_id: Option<String>,
    /// Session mirror staleness window.
    pub session_timeout: Duration,
    /// Recently-ended resumption suppression window.
    pub resume_suppression: Duration,
    /// Periodic score sync interval.
    pub score_interval: Duration,
    /// Scroll recomputation debounce.
    pub scroll_debounce: Duration,
    /// Interaction sync trailing debounce.
    pub interaction_sync_debounce: Duration,
    /// Retry policy for remote writes.
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Create a configuration with defaults for the given backend URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            organization_id: None,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            resume_suppression: DEFAULT_RESUME_SUPPRESSION,
            score_interval: DEFAULT_SCORE_INTERVAL,
            scroll_debounce: DEFAULT_SCROLL_DEBOUNCE,
            interaction_sync_debounce: DEFAULT_INTERACTION_SYNC_DEBOUNCE,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the organization id used to fetch conversion configuration.
    pub fn with_organization_id(mut self, org_id: impl Into<String>) -> Self {
        self.organization_id = Some(org_id.into());
        self
    }

    /// Override the session staleness window.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Override the recently-ended resumption suppression window.
    pub fn with_resume_suppression(mut self, window: Duration) -> Self {
        self.resume_suppression = window;
        self
    }

    /// Override the periodic score sync interval.
    pub fn with_score_interval(mut self, interval: Duration) -> Self {
        self.score_interval = interval;
        self
    }

    /// Override the retry policy for remote writes.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
