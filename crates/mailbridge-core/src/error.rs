//! Error types for the core library.

use std::error::Error as StdError;

use thiserror::Error;

use crate::account::ValidationError;
use crate::account::credentials::CryptoError;

/// Boxed cause carried by system-class errors.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input supplied by the caller.
    #[error("Validation failed: {}", join_messages(.0))]
    Validation(Vec<ValidationError>),

    /// Uniqueness or invariant violation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing, or not owned by the caller.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored credentials are invalid or revoked; the user must reconnect.
    #[error("Re-authorization required: {0}")]
    Auth(String),

    /// Transient or infrastructure failure, retryable by the caller.
    #[error("System error: {message}")]
    System {
        /// What was being attempted.
        message: String,
        /// Original cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored JSON column could not be read or written.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification of an [`Error`] for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied bad input.
    Validation,
    /// Uniqueness or invariant violation.
    Conflict,
    /// Missing or not owned.
    NotFound,
    /// User must re-authorize.
    Auth,
    /// Infrastructure failure; may be retried.
    System,
}

impl Error {
    /// Creates a system error without an underlying cause.
    #[must_use]
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a system error wrapping `source`.
    #[must_use]
    pub fn system_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::System {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a not-found error for an account.
    #[must_use]
    pub fn account_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("email account {id}"))
    }

    /// Returns the taxonomy class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Auth(_) => ErrorKind::Auth,
            Self::System { .. } | Self::Database(_) | Self::Json(_) => ErrorKind::System,
        }
    }

    /// Returns true if the caller may retry the operation later.
    ///
    /// Credentials that no longer decrypt stay unreadable on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::System) && self.as_crypto().is_none()
    }

    /// Returns true if the user has to reconnect the account interactively.
    #[must_use]
    pub const fn requires_reauth(&self) -> bool {
        matches!(self.kind(), ErrorKind::Auth)
    }

    /// Returns true if an operational (caller-side) error.
    ///
    /// These are returned to the caller and are not failures of the subsystem.
    #[must_use]
    pub const fn is_operational(&self) -> bool {
        !matches!(self.kind(), ErrorKind::System)
    }

    /// Returns the wrapped [`CryptoError`] if this error originated in the cipher.
    #[must_use]
    pub fn as_crypto(&self) -> Option<&CryptoError> {
        match self {
            Self::System {
                source: Some(source),
                ..
            } => source.downcast_ref::<CryptoError>(),
            _ => None,
        }
    }

    /// Returns an owned copy with the same kind, details and crypto cause.
    ///
    /// Used to hand one failure to several waiters. Database and JSON
    /// causes are carried as text.
    #[must_use]
    pub fn replicate(&self) -> Self {
        match self {
            Self::Validation(errors) => Self::Validation(errors.clone()),
            Self::Conflict(msg) => Self::Conflict(msg.clone()),
            Self::NotFound(msg) => Self::NotFound(msg.clone()),
            Self::Auth(msg) => Self::Auth(msg.clone()),
            Self::System { message, source } => {
                let source = source.as_ref().map(|cause| {
                    cause.downcast_ref::<CryptoError>().map_or_else(
                        || BoxError::from(cause.to_string()),
                        |crypto| BoxError::from(crypto.replicate()),
                    )
                });
                Self::System {
                    message: message.clone(),
                    source,
                }
            }
            Self::Database(_) | Self::Json(_) => Self::system(self.to_string()),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        Self::system_with("stored credential could not be decrypted", err)
    }
}

impl From<Vec<ValidationError>> for Error {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self::Validation(errors)
    }
}

impl From<ValidationError> for Error {
    fn from(error: ValidationError) -> Self {
        Self::Validation(vec![error])
    }
}

fn join_messages(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
