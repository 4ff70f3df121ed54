use std::fmt;

use serde::Serialize;

/// Failure classes reported by the robot base during navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NavigationTimeout,
    PathBlocked,
    HardwareFailure,
    LocalizationLost,
    CommunicationError,
    Unknown,
}

impl ErrorKind {
    /// Maps a robot-base error message to a failure class.
    ///
    /// Matching is case-insensitive and ordered: the first group with a hit wins,
    /// so "motor timeout" is a timeout, not a hardware failure. The base only
    /// reports free-form text, which is why this works on substrings.
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        if has(&["timeout", "timed out"]) {
            ErrorKind::NavigationTimeout
        } else if has(&["obstacle", "blocked", "path", "cannot find path"]) {
            ErrorKind::PathBlocked
        } else if has(&["hardware", "motor", "wheel", "lidar"]) {
            ErrorKind::HardwareFailure
        } else if has(&["localization", "lost", "position"]) {
            ErrorKind::LocalizationLost
        } else if has(&["communication", "connection", "disconnected"]) {
            ErrorKind::CommunicationError
        } else {
            ErrorKind::Unknown
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NavigationTimeout => "navigation_timeout",
            ErrorKind::PathBlocked => "path_blocked",
            ErrorKind::HardwareFailure => "hardware_failure",
            ErrorKind::LocalizationLost => "localization_lost",
            ErrorKind::CommunicationError => "communication_error",
            ErrorKind::Unknown => "unknown_error",
        };
        f.write_str(name)
    }
}

/// True when an error message points at an expired or rejected token.
pub fn is_token_error(message: &str) -> bool {
    let message = message.to_lowercase();
    ["token", "unauthorized", "401"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Errors that reach the operator as a terminal `Error` mode.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Auth(String),

    #[error("Navigation failed: {message}")]
    Navigation { kind: ErrorKind, message: String },

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Startup(String),
}

impl OrchestratorError {
    pub fn session_expired() -> Self {
        OrchestratorError::Auth("Session expired. Please try again.".to_string())
    }

    pub fn no_patrol_points() -> Self {
        OrchestratorError::Config("No patrol points configured".to_string())
    }
}
