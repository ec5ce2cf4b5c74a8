//! Throttle error types

use thiserror::Error;

/// Errors raised while configuring or feeding a throttle
///
/// Contract violations inside the scheduling algorithms are not represented
/// here; those panic, since they can only come from a programming defect.
#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("Invalid range: from {from} follows to {to}")]
    InvalidRange { from: String, to: String },

    #[error("Range too wide: [{from}, {to}] holds more points than an i64 can count")]
    RangeTooWide { from: String, to: String },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl ThrottleError {
    /// Check if this error came from configuration
    pub fn is_config(&self) -> bool {
        matches!(self, ThrottleError::InvalidConfig(_))
    }
}
