//! Conversion goal configuration and tracking
//!
//! Conversion goals are configured per organization and fetched once at
//! initialization. A missing organization id or an absent remote config
//! means the feature is disabled, not an error. Goals whose CSS selector
//! the host cannot resolve are reported to the backend once as a
//! validation failure, then skipped for the rest of the session.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A single configured conversion goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionGoal {
    pub id: String,
    pub name: String,
    /// CSS selector the host watches; goals without a selector are fired
    /// programmatically via `track_conversion_event`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Organization-level conversion configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub goals: Vec<ConversionGoal>,
}

/// Tracks which goals have already been reported as misconfigured so each
/// validation failure reaches the operator exactly once.
#[derive(Debug, Default)]
pub struct SelectorValidation {
    reported: HashSet<String>,
}

impl SelectorValidation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this goal's missing selector still needs reporting. Marks it
    /// reported on the first call.
    pub fn should_report(&mut self, goal_id: &str) -> bool {
        self.reported.insert(goal_id.to_string())
    }
}
