//! Discord platform adapter.
//!
//! `rest` drives the HTTP API (channel CRUD, permission overwrites,
//! messages, members); `gateway` maintains the WebSocket event stream;
//! `format` holds chunking and naming helpers.

pub mod format;
pub mod gateway;
pub mod rest;

/// Result type for Discord operations.
pub type DiscordResult<T> = Result<T, DiscordError>;

/// Discord adapter error type.
#[derive(Debug, thiserror::Error)]
pub enum DiscordError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl DiscordError {
    /// Whether the failure is a permission denial from the host.
    ///
    /// These are soft degradations per the error-handling policy: log and
    /// keep going, or surface a refusal message to the user.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Api { status: 403, .. })
    }

    /// Whether the failure is a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_is_permission_denied() {
        let err = DiscordError::Api {
            status: 403,
            body: "Missing Permissions".into(),
        };
        assert!(err.is_permission_denied());
        assert!(!err.is_not_found());
    }

    #[test]
    fn not_found_classified() {
        let err = DiscordError::Api {
            status: 404,
            body: "Unknown Member".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_permission_denied());
    }
}
