//! Error types for Visitor Pulse

use thiserror::Error;

/// Errors that can occur inside the telemetry engine.
///
/// None of these escape the public tracking surface: every entry point
/// logs and swallows, so a telemetry failure can never break the host page.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Storage access failed: {0}")]
    Storage(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("No remote journey record exists yet")]
    MissingJourney,

    #[error("Remote write failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}
