//! Tracker error taxonomy. Every variant carries the message shown to clients.

/// Error returned by tracker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// Missing or malformed request fields.
    #[error("{0}")]
    Validation(String),
    /// Unknown peer or channel.
    #[error("{0}")]
    NotFound(String),
    /// Channel name taken, or peer already a member.
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl TrackerError {
    /// HTTP status used when this error is returned over the tracker API.
    pub fn status_code(&self) -> u16 {
        match self {
            TrackerError::Validation(_) | TrackerError::NotFound(_) | TrackerError::Conflict(_) => {
                400
            }
            TrackerError::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TrackerError::Validation(m)
            | TrackerError::NotFound(m)
            | TrackerError::Conflict(m)
            | TrackerError::Internal(m) => m,
        }
    }

    pub(crate) fn peer_not_registered(peer_id: &str) -> Self {
        TrackerError::NotFound(format!("Peer ID '{}' not registered.", peer_id))
    }
}
