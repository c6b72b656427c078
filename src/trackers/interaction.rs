//! Interaction counting
//!
//! Counts clicks, form interactions and keyboard activations, each also
//! incrementing a running total. A trailing debounce decides when the
//! counters are due for a backend sync: the sync fires after one second of
//! inactivity, not on a fixed throttle.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::types::InteractionCounts;

/// The interaction families the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Click,
    FormInput,
    KeyPress,
}

/// Interaction counter state machine.
#[derive(Debug)]
pub struct InteractionTracker {
    counts: InteractionCounts,
    sync_debounce: Duration,
    last_interaction: Option<DateTime<Utc>>,
    dirty: bool,
    /// Bumps on every interaction so a scheduled sync can tell whether it is
    /// still the latest one.
    generation: u64,
}

impl InteractionTracker {
    pub fn new(sync_debounce: Duration) -> Self {
        Self {
            counts: InteractionCounts::default(),
            sync_debounce,
            last_interaction: None,
            dirty: false,
            generation: 0,
        }
    }

    /// Record an interaction. Returns the generation stamp for trailing
    /// debounce bookkeeping.
    pub fn record(&mut self, kind: InteractionKind, now: DateTime<Utc>) -> u64 {
        match kind {
            InteractionKind::Click => self.counts.clicks += 1,
            InteractionKind::FormInput => self.counts.form_interactions += 1,
            InteractionKind::KeyPress => self.counts.key_presses += 1,
        }
        self.counts.total += 1;
        self.last_interaction = Some(now);
        self.dirty = true;
        self.generation += 1;
        self.generation
    }

    /// Whether a sync for the given generation should still run: the
    /// counters are dirty, no later interaction superseded it, and the
    /// debounce window has elapsed.
    pub fn sync_due(&self, generation: u64, now: DateTime<Utc>) -> bool {
        if !self.dirty || generation != self.generation {
            return false;
        }
        match self.last_interaction {
            Some(last) => {
                now.signed_duration_since(last)
                    >= chrono::Duration::from_std(self.sync_debounce).unwrap_or_default()
            }
            None => false,
        }
    }

    /// Snapshot the counters for a sync and clear the dirty flag.
    pub fn take_snapshot(&mut self) -> InteractionCounts {
        self.dirty = false;
        self.counts
    }

    pub fn counts(&self) -> InteractionCounts {
        self.counts
    }

    pub fn total(&self) -> u32 {
        self.counts.total
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
