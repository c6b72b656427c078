//! Identity resolution
//!
//! Derives and persists the visitor and session identifiers across the two
//! storage tiers. Resolution never fails: storage problems degrade to
//! in-memory identifiers via the fallback built into [`StorageTiers`].
//!
//! Session identity lives in the tab-scoped store, with a timestamped mirror
//! in the device-scoped store. The mirror is honored only while younger than
//! the session timeout (30 minutes by default) and its timestamp is refreshed
//! on acceptance, giving the window sliding-expiry semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::storage::StorageTiers;
use crate::types::{SessionIdentity, SessionResolution, VisitorIdentity};

/// Device-scoped key holding the visitor record.
const VISITOR_KEY: &str = "vp_visitor";
/// Tab-scoped key holding the active session id.
const SESSION_KEY: &str = "vp_session";
/// Device-scoped key holding the timestamped session mirror.
const SESSION_MIRROR_KEY: &str = "vp_session_mirror";

/// Persisted visitor record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredVisitor {
    visitor_id: String,
    visit_count: u32,
    last_visit: DateTime<Utc>,
}

/// Persisted session mirror with the timestamp that drives staleness.
#[derive(Debug, Serialize, Deserialize)]
struct SessionMirror {
    session_id: String,
    start_time: DateTime<Utc>,
    timestamp: DateTime<Utc>,
}

/// Resolve the session identifier.
///
/// Order of preference: tab-scoped store, then the device-scoped mirror if
/// its age is under `timeout`, then a freshly minted UUID written to both
/// tiers.
pub fn resolve_session_id(
    tiers: &StorageTiers,
    timeout: Duration,
    now: DateTime<Utc>,
) -> (SessionIdentity, SessionResolution) {
    if let Some(raw) = tiers.tab_get(SESSION_KEY) {
        if let Ok(identity) = serde_json::from_str::<SessionIdentity>(&raw) {
            refresh_mirror(tiers, &identity, now);
            return (identity, SessionResolution::ReusedTab);
        }
    }

    if let Some(raw) = tiers.device_get(SESSION_MIRROR_KEY) {
        if let Ok(mirror) = serde_json::from_str::<SessionMirror>(&raw) {
            let age = now.signed_duration_since(mirror.timestamp);
            let within_window = age >= chrono::Duration::zero()
                && age.to_std().map(|a| a < timeout).unwrap_or(false);
            if within_window {
                let identity = SessionIdentity {
                    session_id: mirror.session_id,
                    start_time: mirror.start_time,
                };
                write_session(tiers, &identity, now);
                return (identity, SessionResolution::ReusedMirror);
            }
            debug!(session_id = %mirror.session_id, "Session mirror expired, minting new session");
        }
    }

    let identity = SessionIdentity {
        session_id: Uuid::new_v4().to_string(),
        start_time: now,
    };
    write_session(tiers, &identity, now);
    (identity, SessionResolution::Minted)
}

/// Rotate to a brand-new session id, replacing both tiers.
///
/// Used when the lifecycle controller refuses to reactivate a just-closed
/// remote record.
pub fn rotate_session_id(tiers: &StorageTiers, now: DateTime<Utc>) -> SessionIdentity {
    let identity = SessionIdentity {
        session_id: Uuid::new_v4().to_string(),
        start_time: now,
    };
    write_session(tiers, &identity, now);
    identity
}

/// Resolve the visitor identifier.
///
/// `is_returning` is the boolean "a visitor record existed before this call".
/// The visit count advances only when this resolution belongs to a new
/// session, so reloads within a session do not inflate it.
pub fn resolve_visitor_id(
    tiers: &StorageTiers,
    new_session: bool,
    now: DateTime<Utc>,
) -> VisitorIdentity {
    let existing = tiers
        .device_get(VISITOR_KEY)
        .and_then(|raw| serde_json::from_str::<StoredVisitor>(&raw).ok());

    match existing {
        Some(mut stored) => {
            if new_session {
                stored.visit_count = stored.visit_count.saturating_add(1);
                stored.last_visit = now;
                persist_visitor(tiers, &stored);
            }
            VisitorIdentity {
                visitor_id: stored.visitor_id,
                is_returning: true,
                visit_count: stored.visit_count,
                last_visit: stored.last_visit,
            }
        }
        None => {
            let stored = StoredVisitor {
                visitor_id: Uuid::new_v4().to_string(),
                visit_count: 1,
                last_visit: now,
            };
            persist_visitor(tiers, &stored);
            VisitorIdentity {
                visitor_id: stored.visitor_id,
                is_returning: false,
                visit_count: 1,
                last_visit: now,
            }
        }
    }
}

fn persist_visitor(tiers: &StorageTiers, stored: &StoredVisitor) {
    if let Ok(raw) = serde_json::to_string(stored) {
        tiers.device_set(VISITOR_KEY, &raw);
    }
}

fn write_session(tiers: &StorageTiers, identity: &SessionIdentity, now: DateTime<Utc>) {
    if let Ok(raw) = serde_json::to_string(identity) {
        tiers.tab_set(SESSION_KEY, &raw);
    }
    refresh_mirror(tiers, identity, now);
}

fn refresh_mirror(tiers: &StorageTiers, identity: &SessionIdentity, now: DateTime<Utc>) {
    let mirror = SessionMirror {
        session_id: identity.session_id.clone(),
        start_time: identity.start_time,
        timestamp: now,
    };
    if let Ok(raw) = serde_json::to_string(&mirror) {
        tiers.device_set(SESSION_MIRROR_KEY, &raw);
    }
}
