//! Error types for `OAuth2` operations.

/// Result type alias for `OAuth2` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Grant error codes after which the stored grant can never be used again.
const PERMANENT_GRANT_ERRORS: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "access_denied",
];

/// `OAuth2` error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP transport error (connect failure, timeout, broken body).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `OAuth2` error returned by the authorization server.
    #[error("OAuth2 error ({status}): {error} - {description}")]
    OAuth {
        /// HTTP status of the response.
        status: u16,
        /// Error code (e.g., `invalid_grant`).
        error: String,
        /// Human-readable description.
        description: String,
    },

    /// The access token was rejected by a resource endpoint.
    #[error("Access token rejected ({status})")]
    InvalidToken {
        /// HTTP status of the response.
        status: u16,
    },

    /// The server answered with an unexpected status and no `OAuth2` error body.
    #[error("Unexpected HTTP status {status}")]
    Status {
        /// HTTP status of the response.
        status: u16,
    },

    /// Invalid token or identity response.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// URL parsing error.
    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),
}

impl Error {
    /// Creates an OAuth error from status, error code and description.
    #[must_use]
    pub fn oauth_error(
        status: u16,
        error: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::OAuth {
            status,
            error: error.into(),
            description: description.into(),
        }
    }

    /// Returns true if retrying with the same grant can never succeed.
    ///
    /// The user has to go through the authorization flow again.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::OAuth { error, .. } => PERMANENT_GRANT_ERRORS.contains(&error.as_str()),
            Self::InvalidToken { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the failure was caused by an expired or revoked access token.
    #[must_use]
    pub const fn is_invalid_token(&self) -> bool {
        matches!(self, Self::InvalidToken { .. })
    }

    /// Returns true if the request timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_timeout())
    }
}
