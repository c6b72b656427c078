//! Core types for the Visitor Pulse engine
//!
//! This module defines the data structures that flow through the engine:
//! visitor and session identity, the captured entry snapshot, the aggregate
//! Journey record, and the events buffered before the remote record exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable identity of an anonymous visitor.
///
/// `visitor_id` is minted once and persisted in device-scoped storage with no
/// expiry; it is never rotated. `is_returning` captures whether the identifier
/// existed *before* this resolution, never after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorIdentity {
    pub visitor_id: String,
    pub is_returning: bool,
    pub visit_count: u32,
    pub last_visit: DateTime<Utc>,
}

/// Identity of a single browsing session.
///
/// Exactly one `session_id` is active per tab-lifetime; reuse across reloads
/// within the 30-minute window is intentional to avoid fragmenting sessions
/// on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
}

/// How a session identifier was obtained during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResolution {
    /// Read from the tab-scoped store (same tab, same session).
    ReusedTab,
    /// Recovered from the device-scoped mirror within the timeout window.
    ReusedMirror,
    /// No usable prior identifier; a fresh one was minted.
    Minted,
}

impl SessionResolution {
    /// Whether this resolution started a brand-new session.
    pub fn is_new(&self) -> bool {
        matches!(self, SessionResolution::Minted)
    }
}

/// Traffic source classification, frozen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficType {
    Direct,
    Internal,
    Search,
    Social,
    Email,
    Referral,
    Paid,
    Campaign,
}

impl TrafficType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficType::Direct => "direct",
            TrafficType::Internal => "internal",
            TrafficType::Search => "search",
            TrafficType::Social => "social",
            TrafficType::Email => "email",
            TrafficType::Referral => "referral",
            TrafficType::Paid => "paid",
            TrafficType::Campaign => "campaign",
        }
    }
}

/// Where the visitor came from, classified once from UTM parameters or the
/// referrer. Immutable for the lifetime of the engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSource {
    #[serde(rename = "type")]
    pub source_type: TrafficType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

impl TrafficSource {
    /// Direct traffic with no attribution facts.
    pub fn direct() -> Self {
        Self {
            source_type: TrafficType::Direct,
            source: None,
            medium: None,
            campaign: None,
            keyword: None,
        }
    }
}

/// The entry-page facts captured verbatim in the constructor, before any
/// navigation can erase them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub url: String,
    pub title: String,
    pub referrer: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub query_params: Vec<(String, String)>,
}

/// Host-reported device facts. The engine never fingerprints; anything the
/// embedder does not supply stays `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Host-reported coarse location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// One visited page within the session. The previous entry is finalized
/// (time/scroll/interaction totals frozen) before a new one is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageVisit {
    pub url: String,
    pub title: String,
    /// Foreground time spent on this page, seconds.
    pub time_spent: f64,
    /// Maximum scroll depth reached on this page, percent.
    pub scroll_depth: f64,
    /// Interactions recorded while this page was current.
    pub interactions: u32,
}

impl PageVisit {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            time_spent: 0.0,
            scroll_depth: 0.0,
            interactions: 0,
        }
    }
}

/// Per-kind interaction counters feeding the scorer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionCounts {
    pub clicks: u32,
    pub form_interactions: u32,
    pub key_presses: u32,
    pub total: u32,
}

/// A recorded conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub goal_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Bounce classification emitted at session termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceKind {
    /// Left within 3 seconds having barely scrolled.
    Immediate,
    /// Left within 5 minutes without meaningful scroll depth.
    Quick,
}

/// A bounce event recorded against the journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceEvent {
    pub kind: BounceKind,
    pub duration_secs: f64,
    pub scroll_depth: f64,
    pub timestamp: DateTime<Utc>,
}

/// Navigation and page-view facts within the journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyPath {
    pub entry_page: String,
    pub current_page: String,
    pub pages: Vec<PageVisit>,
    pub page_views: u32,
    pub bounce_rate: f64,
}

/// Accumulated engagement signals within the journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engagement {
    pub is_returning: bool,
    pub visit_count: u32,
    pub engagement_score: u32,
    pub conversion_events: Vec<ConversionEvent>,
    pub bounce_events: Vec<BounceEvent>,
    pub chat_interactions: u32,
    pub interaction_counts: InteractionCounts,
}

/// Session lifetime facts within the journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Total session duration in seconds, set once at finalization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
}

/// The aggregate per-session behavioral record.
///
/// Owned exclusively by the session lifecycle controller; every other
/// component reads it or requests narrow field-level updates, never holds a
/// second authoritative copy. Created once per session remote-side, mutated
/// via incremental field updates, finalized exactly once at termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    /// Remote record id, known only once `createJourney` has succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub session_id: String,
    pub identity: VisitorIdentity,
    pub traffic_source: TrafficSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    pub journey: JourneyPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    pub engagement: Engagement,
    pub session: SessionInfo,
}

/// A tracking call buffered until the remote journey record exists, then
/// replayed in arrival order and discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum QueuedEvent {
    ChatInteraction {
        interaction_type: String,
        timestamp: DateTime<Utc>,
    },
    PageView {
        url: String,
        title: String,
        timestamp: DateTime<Utc>,
    },
    Conversion(ConversionEvent),
}

/// What caused the session to end. Teardown triggers select the beacon
/// delivery channel because the page may be gone before an awaited request
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndTrigger {
    VisibilityHidden,
    PageHide,
    BeforeUnload,
    Destroy,
}

impl EndTrigger {
    /// Teardown triggers cannot wait on an async round trip.
    pub fn is_teardown(&self) -> bool {
        !matches!(self, EndTrigger::Destroy)
    }
}

/// The minimal payload that must survive page teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalData {
    pub session_id: String,
    pub engagement_score: u32,
    pub page_views: u32,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounce: Option<BounceKind>,
    pub bounce_rate: f64,
    pub is_active: bool,
    pub end_time: DateTime<Utc>,
}

/// Session status fields sent to `updateSessionStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}
