//! Scroll depth tracking
//!
//! Tracks the percentage of scrollable height reached on the current page.
//! Depth is a monotonic maximum, recomputed on scroll samples with a
//! debounce window, and milestone events fire once each at 25/50/75/100%.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Milestone thresholds in percent, fired once each.
const MILESTONES: [f64; 4] = [25.0, 50.0, 75.0, 100.0];

/// Result of an accepted scroll sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollUpdate {
    /// Maximum depth reached so far, percent.
    pub depth_pct: f64,
    /// Milestones newly crossed by this sample, in ascending order.
    pub milestones: Vec<u8>,
}

/// Scroll depth state machine for the current page.
#[derive(Debug)]
pub struct ScrollTracker {
    max_depth_pct: f64,
    fired: [bool; 4],
    debounce: Duration,
    last_accepted: Option<DateTime<Utc>>,
}

impl ScrollTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            max_depth_pct: 0.0,
            fired: [false; 4],
            debounce,
            last_accepted: None,
        }
    }

    /// Feed a raw scroll sample.
    ///
    /// Samples arriving inside the debounce window are dropped. Accepted
    /// samples update the monotonic maximum and report newly crossed
    /// milestones.
    pub fn observe(
        &mut self,
        scroll_top: f64,
        viewport_height: f64,
        document_height: f64,
        now: DateTime<Utc>,
    ) -> Option<ScrollUpdate> {
        if let Some(last) = self.last_accepted {
            let elapsed = now.signed_duration_since(last);
            if elapsed < chrono::Duration::from_std(self.debounce).unwrap_or_default() {
                return None;
            }
        }
        self.last_accepted = Some(now);

        let depth = compute_depth_pct(scroll_top, viewport_height, document_height);
        if depth > self.max_depth_pct {
            self.max_depth_pct = depth;
        }

        let mut milestones = Vec::new();
        for (i, &threshold) in MILESTONES.iter().enumerate() {
            if !self.fired[i] && self.max_depth_pct >= threshold {
                self.fired[i] = true;
                milestones.push(threshold as u8);
            }
        }

        Some(ScrollUpdate {
            depth_pct: self.max_depth_pct,
            milestones,
        })
    }

    /// Maximum depth reached so far, percent.
    pub fn depth_pct(&self) -> f64 {
        self.max_depth_pct
    }

    /// Reset for a new page. Milestones and depth start over.
    pub fn reset(&mut self) {
        self.max_depth_pct = 0.0;
        self.fired = [false; 4];
        self.last_accepted = None;
    }
}

/// Percentage of scrollable height reached by the bottom of the viewport.
///
/// A page with no scrollable overflow counts as fully scrolled.
fn compute_depth_pct(scroll_top: f64, viewport_height: f64, document_height: f64) -> f64 {
    let scrollable = document_height - viewport_height;
    if scrollable <= 0.0 {
        return 100.0;
    }
    ((scroll_top / scrollable) * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
    }

    fn tracker() -> ScrollTracker {
        ScrollTracker::new(Duration::from_millis(500))
    }

    #[test]
    fn depth_is_monotonic_max() {
        let mut tracker = tracker();
        tracker.observe(500.0, 800.0, 1800.0, t0());
        let update = tracker
            .observe(100.0, 800.0, 1800.0, t0() + chrono::Duration::seconds(1))
            .unwrap();
        // Scrolling back up does not reduce the recorded depth.
        assert_eq!(update.depth_pct, 50.0);
    }

    #[test]
    fn milestones_fire_once_each() {
        let mut tracker = tracker();
        let first = tracker.observe(550.0, 800.0, 1800.0, t0()).unwrap();
        assert_eq!(first.milestones, vec![25, 50]);

        let second = tracker
            .observe(1000.0, 800.0, 1800.0, t0() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(second.milestones, vec![75, 100]);

        let third = tracker
            .observe(1000.0, 800.0, 1800.0, t0() + chrono::Duration::seconds(2))
            .unwrap();
        assert!(third.milestones.is_empty());
    }

    #[test]
    fn samples_inside_debounce_window_are_dropped() {
        let mut tracker = tracker();
        assert!(tracker.observe(100.0, 800.0, 1800.0, t0()).is_some());
        assert!(tracker
            .observe(900.0, 800.0, 1800.0, t0() + chrono::Duration::milliseconds(200))
            .is_none());
        assert!(tracker
            .observe(900.0, 800.0, 1800.0, t0() + chrono::Duration::milliseconds(600))
            .is_some());
    }

    #[test]
    fn unscrollable_page_counts_as_fully_scrolled() {
        let mut tracker = tracker();
        let update = tracker.observe(0.0, 800.0, 600.0, t0()).unwrap();
        assert_eq!(update.depth_pct, 100.0);
        assert_eq!(update.milestones, vec![25, 50, 75, 100]);
    }

    #[test]
    fn reset_clears_depth_and_milestones() {
        let mut tracker = tracker();
        tracker.observe(1000.0, 800.0, 1800.0, t0());
        tracker.reset();
        assert_eq!(tracker.depth_pct(), 0.0);

        let update = tracker
            .observe(550.0, 800.0, 1800.0, t0() + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(update.milestones, vec![25, 50]);
    }
}
