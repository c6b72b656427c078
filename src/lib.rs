//! Visitor Pulse - Session telemetry engine for embedded customer-facing widgets
//!
//! Pulse turns raw host-page observations into a per-session behavioral
//! record through a deterministic pipeline: identity resolution → entry
//! capture → traffic classification → signal tracking → engagement scoring
//! → terminal delivery.
//!
//! ## Modules
//!
//! - **Identity**: Visitor and session resolution across tab and device storage tiers
//! - **Trackers**: Clock-injected scroll, dwell-time, interaction, and navigation state machines
//! - **Session**: The lifecycle controller that owns the journey record end to end

pub mod api;
pub mod config;
pub mod conversion;
pub mod delivery;
pub mod error;
pub mod guard;
pub mod identity;
pub mod queue;
pub mod retry;
pub mod score;
pub mod session;
pub mod storage;
pub mod trackers;
pub mod traffic;
pub mod types;

pub use config::EngineConfig;
pub use error::TelemetryError;
pub use session::{PageContext, PulseEngine, SessionPhase};

// API exports
pub use api::{HttpJourneyApi, JourneyApi, JourneyFields};

// Storage exports
pub use storage::{KeyValueStore, MemoryStore, StorageTiers};

// Scoring exports
pub use score::{classify_bounce, compute_engagement_score};

/// Pulse version reported to the journey store
pub const PULSE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported to the journey store
pub const PRODUCER_NAME: &str = "visitor-pulse";
