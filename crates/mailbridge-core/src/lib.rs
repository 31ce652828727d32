//! # mailbridge-core
//!
//! Credential store and lifecycle manager for connected mailboxes.
//!
//! This crate provides:
//! - Account storage (`SQLite`) with credentials sealed by AES-256-GCM
//! - `OAuth` and SMTP/IMAP account onboarding
//! - Token refresh with single-flight per account
//! - Health tracking and automatic deactivation of failing accounts
//! - Exactly one default account per user
//! - Connection testing and cleanup of failed accounts
//!
//! Everything a caller needs goes through [`AccountManager`]:
//!
//! ```ignore
//! use mailbridge_core::{AccountManager, Config, CredentialCipher, OAuthClients, UserId};
//!
//! let config = Config::from_env()?;
//! let key = load_encryption_key()?.ok_or("no master key")?;
//! let manager = AccountManager::open(
//!     &config,
//!     CredentialCipher::new(&key),
//!     Arc::new(config.oauth_clients()?),
//!     probe,
//! )
//! .await?;
//!
//! let page = manager.list(&UserId::new("user-1"), ListRequest::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod config;
mod error;
pub mod provider;
pub mod service;

pub use account::credentials;
pub use account::{
    AccountFilter, AccountId, AccountRepository, AccountSettings, AutoReply, ConnectionType,
    DefaultCoordinator, EmailAccount, HealthPolicy, HealthStatus, HealthTracker, LastError,
    MailProvider, Security, ServerSettings, UserId,
};
pub use account::{
    CredentialCipher, CryptoError, EncryptionKey, SmtpSubmission, ValidationError,
    ValidationResult, normalize_email, validate_settings, validate_smtp_submission,
};
pub use config::{Config, OAuthRegistration, load_encryption_key};
pub use error::{BoxError, Error, ErrorKind, Result};
pub use provider::{
    Identity, MailProbe, OAuthClients, OAuthProvider, ProbeReport, ProviderError, TokenGrant,
};
pub use service::{
    AccountDetail, AccountManager, AccountPage, AccountSummary, AccountView, ConnectionReport,
    ListRequest, OAuthConnection, RefreshReport, RefreshStatus, TokenRefresher,
};
