//! Active page-time tracking
//!
//! Accumulates time only while the page is the foreground tab. Visibility
//! transitions pause and resume the accumulator; a flush freezes the total
//! for the current page visit on page change or teardown.

use chrono::{DateTime, Utc};

/// Foreground-time accumulator for the current page.
#[derive(Debug)]
pub struct PageTimeTracker {
    visible_since: Option<DateTime<Utc>>,
    accumulated: chrono::Duration,
}

impl PageTimeTracker {
    /// Start tracking. The page is assumed visible at construction.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            visible_since: Some(now),
            accumulated: chrono::Duration::zero(),
        }
    }

    /// Handle a visibility transition. Repeated transitions to the same
    /// state are no-ops.
    pub fn on_visibility(&mut self, visible: bool, now: DateTime<Utc>) {
        match (visible, self.visible_since) {
            (true, None) => self.visible_since = Some(now),
            (false, Some(since)) => {
                self.accumulated = self.accumulated + span_since(since, now);
                self.visible_since = None;
            }
            _ => {}
        }
    }

    /// Active seconds accumulated so far, including the open interval.
    pub fn active_secs(&self, now: DateTime<Utc>) -> f64 {
        let mut total = self.accumulated;
        if let Some(since) = self.visible_since {
            total = total + span_since(since, now);
        }
        total.num_milliseconds() as f64 / 1000.0
    }

    /// Freeze and return the active seconds for this page, restarting the
    /// accumulator for the next page.
    pub fn flush(&mut self, now: DateTime<Utc>) -> f64 {
        let total = self.active_secs(now);
        self.accumulated = chrono::Duration::zero();
        if self.visible_since.is_some() {
            self.visible_since = Some(now);
        }
        total
    }
}

fn span_since(since: DateTime<Utc>, now: DateTime<Utc>) -> chrono::Duration {
    let span = now.signed_duration_since(since);
    if span < chrono::Duration::zero() {
        chrono::Duration::zero()
    } else {
        span
    }
}
