//! Behavioral signal trackers
//!
//! Four independent, synchronous counters feed the engagement scorer and the
//! bounce classifier. Each tracker is a clock-injected state machine with no
//! I/O: the host adapter feeds raw browser observations in, and the session
//! lifecycle controller reads the accumulated signals out.

pub mod interaction;
pub mod navigation;
pub mod page_time;
pub mod scroll;

pub use interaction::{InteractionKind, InteractionTracker};
pub use navigation::{NavigationEvent, NavigationKind, NavigationObserver};
pub use page_time::PageTimeTracker;
pub use scroll::{ScrollTracker, ScrollUpdate};
