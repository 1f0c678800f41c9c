//! Error types for the SIGAA portal engine.

/// Errors surfaced by the portal engine.
///
/// `SecurityViolation` is always fatal: it is raised before any network I/O
/// toward the offending host and is never suppressed or retried.
#[derive(Debug, thiserror::Error)]
pub enum SigaaError {
    /// Transport-level failure, or a redirect chain that exceeded the hop cap.
    #[error("connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// A request or redirect target resolved to a host outside the
    /// session's configured origin.
    #[error("security violation: request to '{host}' outside origin '{origin}' blocked")]
    SecurityViolation { origin: String, host: String },

    /// The portal redirected to its session-expiration resource. The caller
    /// must re-authenticate; the engine does not retry this.
    #[error("session expired")]
    SessionExpired,

    /// The portal rejected the supplied credentials.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// An inline-script navigation handler did not match either of the
    /// recognized handler shapes, or referenced a form the page lacks.
    #[error("malformed navigation handler: {0}")]
    MalformedNavigation(String),

    /// An expected menu entry or clickable element is absent from the page.
    #[error("navigation target not found: {0}")]
    NavigationNotFound(String),
}

impl SigaaError {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn connection_with(
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<reqwest::Error> for SigaaError {
    fn from(err: reqwest::Error) -> Self {
        Self::Connection {
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}

pub type Result<T, E = SigaaError> = std::result::Result<T, E>;
