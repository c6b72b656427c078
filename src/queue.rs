//! Pre-creation event queue
//!
//! Tracking calls that arrive before the remote journey record exists are
//! buffered here instead of sent. Once the record is created or resumed, the
//! queue is drained strictly in arrival order and cleared.

use std::collections::VecDeque;

use crate::types::QueuedEvent;

/// FIFO buffer of tracking calls awaiting the remote journey id.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<QueuedEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: QueuedEvent) {
        self.events.push_back(event);
    }

    /// Remove and return all buffered events in arrival order.
    pub fn drain(&mut self) -> Vec<QueuedEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
