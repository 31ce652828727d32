//! Account management module.
//!
//! Provides the account model, encrypted storage, validation, health
//! bookkeeping and default-account coordination.

pub mod credentials;
mod defaults;
mod health;
mod model;
mod repository;
mod validation;

pub use credentials::{CredentialCipher, CryptoError, CryptoResult, EncryptionKey};
pub use defaults::DefaultCoordinator;
pub use health::{HealthPolicy, HealthStatus, HealthTracker};
pub use model::{
    AccountId, AccountSettings, AutoReply, ConnectionType, Credentials, EmailAccount, LastError,
    MailProvider, NewAccount, Security, ServerSettings, UserId,
};
pub use repository::{AccountFilter, AccountRepository, ErrorRecord};
pub use validation::{
    MAX_PAGE_LIMIT, SmtpSubmission, ValidationError, ValidationResult, normalize_email,
    validate_pagination, validate_settings, validate_smtp_submission,
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_support {
    use chrono::{Duration, Utc};

    use super::model::SealedSecrets;
    use super::*;

    pub fn key() -> EncryptionKey {
        EncryptionKey::from_bytes([7; credentials::KEY_LEN])
    }

    pub async fn repository() -> AccountRepository {
        AccountRepository::in_memory(CredentialCipher::new(&key()))
            .await
            .unwrap()
    }

    pub fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    pub fn oauth_account(user_id: &str, email: &str) -> NewAccount {
        NewAccount {
            user_id: user(user_id),
            email: email.to_string(),
            display_name: None,
            provider: MailProvider::Gmail,
            credentials: Credentials::OAuth {
                access_token: "access-1".into(),
                refresh_token: Some("refresh-1".into()),
            },
            token_expiry: Some(Utc::now() + Duration::hours(1)),
            scopes: vec!["https://mail.google.com/".into()],
            is_verified: true,
            settings: AccountSettings::default(),
        }
    }

    pub fn smtp_account(user_id: &str, email: &str) -> NewAccount {
        NewAccount {
            user_id: user(user_id),
            email: email.to_string(),
            display_name: Some("Me".into()),
            provider: MailProvider::Smtp,
            credentials: Credentials::Password {
                username: email.to_string(),
                password: "app-password".into(),
            },
            token_expiry: None,
            scopes: Vec::new(),
            is_verified: false,
            settings: AccountSettings {
                smtp: Some(ServerSettings::new("smtp.example.com", 465, Security::Tls)),
                imap: Some(ServerSettings::new("imap.example.com", 993, Security::Tls)),
                ..AccountSettings::default()
            },
        }
    }

    /// Replaces the stored envelopes with ones that fail authentication.
    pub async fn tamper_credentials(repo: &AccountRepository, id: AccountId) {
        let forged = format!("{}:{}:{}", "00".repeat(12), "00".repeat(16), "00".repeat(8));
        sqlx::query(
            "UPDATE email_accounts SET primary_secret = ?, secondary_secret = ? WHERE id = ?",
        )
        .bind(&forged)
        .bind(&forged)
        .bind(id.to_string())
        .execute(repo.pool())
        .await
        .unwrap();
    }

    /// An active `OAuth` record that was never stored.
    pub fn record() -> EmailAccount {
        let now = Utc::now();
        EmailAccount {
            id: AccountId::generate(),
            user_id: user("u1"),
            email: "a@gmail.com".into(),
            display_name: None,
            provider: MailProvider::Gmail,
            connection_type: ConnectionType::OAuth,
            secrets: SealedSecrets::default(),
            token_expiry: Some(now + Duration::hours(1)),
            scopes: Vec::new(),
            is_active: true,
            is_verified: true,
            is_default: false,
            error_count: 0,
            last_error: None,
            emails_sent: 0,
            last_used: None,
            last_sync_at: None,
            settings: AccountSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
