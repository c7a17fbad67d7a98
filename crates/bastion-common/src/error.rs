//! Common error types for Bastion components.

use thiserror::Error;

/// Common errors across Bastion components.
///
/// The variants deliberately mirror the boundaries the gatekeeper cares
/// about: configuration problems are fatal at startup, input problems map
/// to 400, challenge-state problems trigger a transparent reissue, and a
/// wrong proof is a 403.
#[derive(Debug, Error)]
pub enum BastionError {
    /// Policy or server configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Malformed client input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A required submission field is missing
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A submission field failed to parse
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Challenge or resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Challenge expired before submission
    #[error("Expired: {0}")]
    Expired(String),

    /// Challenge was already spent by an earlier submission
    #[error("Already spent: {0}")]
    AlreadySpent(String),

    /// The submitted proof is wrong
    #[error("Challenge failed: {0}")]
    Failed(String),

    /// Upstream origin could not be reached
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Store backend error
    #[error("Store error: {0}")]
    Store(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BastionError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidConfig(_) => 500,
            Self::InvalidInput(_) => 400,
            Self::MissingField(_) => 400,
            Self::InvalidFormat(_) => 400,
            Self::NotFound(_) => 404,
            Self::Expired(_) => 403,
            Self::AlreadySpent(_) => 403,
            Self::Failed(_) => 403,
            Self::UpstreamUnavailable(_) => 502,
            Self::Store(_) => 500,
            Self::Internal(_) => 500,
        }
    }

    /// Returns true if the client should transparently receive a fresh
    /// challenge instead of an error page.
    pub fn should_reissue(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Expired(_) | Self::AlreadySpent(_)
        )
    }
}
