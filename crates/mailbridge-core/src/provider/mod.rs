//! External provider collaborators.
//!
//! The lifecycle manager never talks to a mail provider directly. Token
//! grants and identity lookups go through [`OAuthProvider`]; SMTP/IMAP
//! credential checks go through [`MailProbe`].

mod oauth;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use oauth::OAuthClients;

use crate::Error;
use crate::account::{MailProvider, ServerSettings};

/// Classified failure of a provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The grant is revoked or invalid; only re-authorization helps.
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// The access token was rejected; a refresh may help.
    #[error("Invalid access token: {0}")]
    InvalidToken(String),

    /// Network failure, timeout or provider-side error.
    #[error("Provider unavailable: {0}")]
    Transient(String),
}

impl ProviderError {
    /// Returns true if retrying cannot succeed without user interaction.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidGrant(_))
    }

    /// Stable code stored as the account's last error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidGrant(_) => "invalid_grant",
            Self::InvalidToken(_) => "invalid_token",
            Self::Transient(_) => "provider_unavailable",
        }
    }

    /// Caller-facing error: rejected credentials need re-authorization,
    /// everything else is retryable.
    pub(crate) fn into_error(self, context: &str) -> Error {
        match self {
            Self::InvalidGrant(_) | Self::InvalidToken(_) => {
                Error::Auth(format!("{context}: {self}"))
            }
            Self::Transient(_) => Error::system_with(context.to_string(), self),
        }
    }
}

/// Runs a provider call, treating a timeout as a transient failure.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
        Err(ProviderError::Transient(format!(
            "no response within {}s",
            timeout.as_secs()
        )))
    })
}

/// Tokens returned by a code exchange or refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// New access token.
    pub access_token: String,
    /// New refresh token; `None` keeps the stored one.
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds.
    pub expires_in: Option<u64>,
    /// Granted scopes.
    pub scopes: Vec<String>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Mailbox owner as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Mailbox address.
    pub email: String,
    /// Whether the provider verified the address.
    pub verified: bool,
    /// Provider-side subject identifier.
    pub provider_id: String,
}

/// Result of an SMTP or IMAP probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Whether the probe authenticated.
    pub success: bool,
    /// Human-readable detail.
    pub detail: String,
    /// The probe was not run.
    #[serde(default)]
    pub skipped: bool,
}

impl ProbeReport {
    /// A successful probe.
    #[must_use]
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
            skipped: false,
        }
    }

    /// A failed probe.
    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
            skipped: false,
        }
    }

    /// A probe that was deliberately not run.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            success: true,
            detail: "skipped".into(),
            skipped: true,
        }
    }
}

/// `OAuth2` operations against a mailbox provider.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Exchanges an authorization code for tokens.
    async fn exchange_code(
        &self,
        provider: MailProvider,
        code: &str,
    ) -> Result<TokenGrant, ProviderError>;

    /// Obtains a new access token with a refresh token.
    async fn refresh(
        &self,
        provider: MailProvider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError>;

    /// Resolves the mailbox owner; also serves as a minimal authenticated call.
    async fn get_identity(
        &self,
        provider: MailProvider,
        access_token: &str,
    ) -> Result<Identity, ProviderError>;
}

/// Login checks against SMTP and IMAP servers.
#[async_trait]
pub trait MailProbe: Send + Sync {
    /// Authenticates against the outgoing server.
    async fn test_send(
        &self,
        server: &ServerSettings,
        username: &str,
        password: &str,
    ) -> ProbeReport;

    /// Authenticates against the incoming server.
    async fn test_receive(
        &self,
        server: &ServerSettings,
        username: &str,
        password: &str,
    ) -> ProbeReport;
}
