//! Engagement scoring and bounce classification
//!
//! The engagement score is a deterministic, order-independent function of
//! four accumulated counters, each capped so the total is bounded at 100.
//! Logarithmic terms give diminishing returns for repeated cheap actions;
//! the linear time term rewards dwell time up to a 10-minute cap; chat is
//! weighted most heavily per unit because it is the strongest intent signal.
//!
//! Bounce classification runs only at session termination and only for
//! single-page sessions.

use crate::types::BounceKind;

/// Page-view contribution cap.
const PAGE_SCORE_CAP: f64 = 30.0;
/// Dwell-time contribution cap (reached at 10 minutes).
const TIME_SCORE_CAP: f64 = 30.0;
/// Interaction contribution cap.
const INTERACTION_SCORE_CAP: f64 = 25.0;
/// Chat contribution cap.
const CHAT_SCORE_CAP: f64 = 15.0;

/// An immediate bounce leaves within this many seconds.
const IMMEDIATE_BOUNCE_MAX_SECS: f64 = 3.0;
/// An immediate bounce scrolls less than this percentage.
const IMMEDIATE_BOUNCE_MAX_SCROLL: f64 = 10.0;
/// A quick bounce leaves within this many seconds.
const QUICK_BOUNCE_MAX_SECS: f64 = 300.0;
/// A quick bounce scrolls less than this percentage.
const QUICK_BOUNCE_MAX_SCROLL: f64 = 50.0;

/// Compute the bounded 0-100 engagement score.
///
/// ```text
/// page_score        = min(30, ln(page_views + 1) * 15)
/// time_score        = min(30, duration_secs / 20)
/// interaction_score = min(25, ln(interactions + 1) * 10)
/// chat_score        = min(15, chat_interactions * 5)
/// score             = round(sum)
/// ```
pub fn compute_engagement_score(
    page_views: u32,
    duration_secs: f64,
    interactions: u32,
    chat_interactions: u32,
) -> u32 {
    let page_score = ((page_views as f64 + 1.0).ln() * 15.0).min(PAGE_SCORE_CAP);
    let time_score = (duration_secs.max(0.0) / 20.0).min(TIME_SCORE_CAP);
    let interaction_score = ((interactions as f64 + 1.0).ln() * 10.0).min(INTERACTION_SCORE_CAP);
    let chat_score = (chat_interactions as f64 * 5.0).min(CHAT_SCORE_CAP);

    let score = (page_score + time_score + interaction_score + chat_score).round();
    score.clamp(0.0, 100.0) as u32
}

/// Classify a terminating session as a bounce.
///
/// Sessions with more than one page view are never a bounce, regardless of
/// duration or scroll depth. A long single-page dwell or a deep scroll
/// signals engagement, not abandonment.
pub fn classify_bounce(
    page_views: u32,
    duration_secs: f64,
    scroll_depth_pct: f64,
) -> Option<BounceKind> {
    if page_views > 1 {
        return None;
    }
    if duration_secs < IMMEDIATE_BOUNCE_MAX_SECS && scroll_depth_pct < IMMEDIATE_BOUNCE_MAX_SCROLL {
        return Some(BounceKind::Immediate);
    }
    if duration_secs < QUICK_BOUNCE_MAX_SECS && scroll_depth_pct < QUICK_BOUNCE_MAX_SCROLL {
        return Some(BounceKind::Quick);
    }
    None
}
