use thiserror::Error;

/// Failure reported by an [`IssueTracker`](crate::tracker::IssueTracker) adapter.
///
/// Carries the HTTP-style status when the remote reported one so callers can
/// tell a missing resource from a rate limit from a transport failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TrackerError {
    pub status: Option<u16>,
    pub message: String,
}

impl TrackerError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Some(404), message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    pub fn is_precondition_failed(&self) -> bool {
        self.status == Some(412)
    }

    /// Secondary rate limits come back as 403 with a "rate limit" body.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self.status, Some(403) | Some(429))
            || self.message.to_lowercase().contains("rate limit")
    }

    pub fn is_transient(&self) -> bool {
        self.is_rate_limit() || matches!(self.status, None | Some(500..=599))
    }
}

#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Budget error: {0}")]
    Budget(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("Cost limit exceeded: {0}")]
    CostLimit(String),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Model call timed out after {0}s")]
    Timeout(u64),

    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}

impl GovernorError {
    /// Status code carried by a wrapped tracker failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Tracker(e) => e.status,
            _ => None,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::Tracker(e) => e.is_rate_limit(),
            other => other.to_string().to_lowercase().contains("rate limit"),
        }
    }
}

pub type Result<T> = std::result::Result<T, GovernorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_error_classification() {
        assert!(TrackerError::not_found("gone").is_not_found());
        assert!(TrackerError::new(Some(403), "Forbidden").is_rate_limit());
        assert!(TrackerError::new(Some(429), "slow down").is_rate_limit());
        assert!(TrackerError::new(Some(400), "API Rate Limit exceeded").is_rate_limit());
        assert!(!TrackerError::new(Some(422), "validation").is_rate_limit());
        assert!(TrackerError::new(Some(503), "unavailable").is_transient());
        assert!(!TrackerError::new(Some(422), "validation").is_transient());
    }

    #[test]
    fn test_governor_error_rate_limit_detection() {
        let err: GovernorError = TrackerError::new(Some(403), "secondary").into();
        assert!(err.is_rate_limit());
        assert_eq!(err.status(), Some(403));

        let err = GovernorError::Executor("upstream rate limit hit".into());
        assert!(err.is_rate_limit());
        assert!(err.status().is_none());
    }
}
