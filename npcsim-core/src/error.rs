//! Error types for the npcsim core library.
//!
//! Capacity refusals from the tier manager are not errors: they come back as
//! [`crate::tier::TierOutcome::Rejected`] so callers can retry later.

use thiserror::Error;

use crate::config::ConfigIssue;

/// Top-level error type for all npcsim operations.
#[derive(Error, Debug)]
pub enum SimError {
    /// A memory candidate failed validation.
    #[error("Invalid event: {reason}")]
    InvalidEvent {
        /// What was wrong with the candidate.
        reason: String,
    },

    /// Configuration failed validation; the component refused to start or reload.
    #[error("Invalid configuration: {}", format_issues(.issues))]
    InvalidConfig {
        /// Every issue found, in field order.
        issues: Vec<ConfigIssue>,
    },

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded resource has reached its configured capacity.
    #[error("Capacity exceeded: {resource} (limit: {limit}, current: {current})")]
    CapacityExceeded {
        /// Which resource hit the limit.
        resource: String,
        /// Maximum allowed.
        limit: usize,
        /// Current count.
        current: usize,
    },

    /// The service was used before `start` or after `stop`.
    #[error("Service is not running")]
    NotRunning,

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IssueKind;

    #[test]
    fn invalid_config_lists_every_issue() {
        let err = SimError::InvalidConfig {
            issues: vec![
                ConfigIssue::new("tiers.tier_1_duration_hours", IssueKind::Ordering, "tier 1 must be shorter than tier 2"),
                ConfigIssue::new("tiers.emergency_reserve_ratio", IssueKind::OutOfRange, "must be below 1.0"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("tier_1_duration_hours"));
        assert!(msg.contains("emergency_reserve_ratio"));
    }
}
