//! Unified error handling for the heatline library.
//!
//! Only structural and environmental failures are errors. Bad trajectory
//! samples (low accuracy, out of bounds, unmatched) are reported as
//! [`SegmentOutcome`](crate::aggregator::SegmentOutcome) variants so the
//! GPS stream never fails on data it receives.

use thiserror::Error;

/// Unified error type for heatline operations.
#[derive(Debug, Clone, Error)]
pub enum HeatlineError {
    /// The device denied or cannot supply location updates
    #[error("Location unavailable: {reason}")]
    LocationUnavailable { reason: String },

    /// Venue boundary or path edge failed structural validation at load time
    #[error("Venue '{venue_id}' has malformed geometry: {message}")]
    MalformedGeometry { venue_id: String, message: String },

    /// Operation referenced a venue that was never registered
    #[error("Unknown venue '{venue_id}'")]
    UnknownVenue { venue_id: String },

    /// Venue id registered twice
    #[error("Venue '{venue_id}' is already registered")]
    DuplicateVenue { venue_id: String },

    /// Configuration value out of range
    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },

    /// Clustering batch exceeds the configured maximum
    #[error("Batch of {size} points exceeds maximum of {maximum}")]
    BatchTooLarge { size: usize, maximum: usize },

    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Encoding or decoding of stored or exported data failed
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// HTTP/API error
    #[error("HTTP error{}: {message}", status_suffix(.status_code))]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code
        .map(|code| format!(" ({})", code))
        .unwrap_or_default()
}

impl HeatlineError {
    pub(crate) fn persistence(message: impl Into<String>) -> Self {
        HeatlineError::Persistence {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(venue_id: &str, message: impl Into<String>) -> Self {
        HeatlineError::MalformedGeometry {
            venue_id: venue_id.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        HeatlineError::InvalidConfig {
            message: message.into(),
        }
    }

    /// True for failures that a later retry may fix.
    pub fn is_transient(&self) -> bool {
        match self {
            HeatlineError::Persistence { .. } => true,
            HeatlineError::Http { status_code, .. } => match status_code {
                None => true,
                Some(code) => *code == 429 || *code >= 500,
            },
            _ => false,
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for HeatlineError {
    fn from(err: rusqlite::Error) -> Self {
        HeatlineError::persistence(err.to_string())
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::encode::Error> for HeatlineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        HeatlineError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::decode::Error> for HeatlineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        HeatlineError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HeatlineError {
    fn from(err: serde_json::Error) -> Self {
        HeatlineError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for heatline operations.
pub type Result<T> = std::result::Result<T, HeatlineError>;

/// Extension trait for converting Option to HeatlineError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an unknown venue error.
    fn ok_or_unknown_venue(self, venue_id: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unknown_venue(self, venue_id: &str) -> Result<T> {
        self.ok_or_else(|| HeatlineError::UnknownVenue {
            venue_id: venue_id.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| HeatlineError::Internal {
            message: message.to_string(),
        })
    }
}
