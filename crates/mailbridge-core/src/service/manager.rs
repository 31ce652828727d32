//! Caller-facing account operations.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use super::query::{AccountPage, AccountQuery, AccountView, ListRequest};
use super::refresh::{RefreshReport, TokenRefresher, expiry_after, needs_refresh};
use super::tester::{ConnectionReport, ConnectionTester};
use crate::account::{
    AccountId, AccountRepository, AccountSettings, CredentialCipher, Credentials,
    DefaultCoordinator, EmailAccount, HealthTracker, MailProvider, NewAccount,
    SmtpSubmission, UserId, ValidationError, normalize_email, validate_settings,
    validate_smtp_submission,
};
use crate::config::Config;
use crate::provider::{MailProbe, OAuthProvider, bounded};
use crate::{Error, Result};

/// Completed consent flow, ready to become an account.
#[derive(Clone)]
pub struct OAuthConnection {
    /// Provider that issued the code.
    pub provider: MailProvider,
    /// Authorization code from the redirect.
    pub code: String,
    /// Display name for the new account.
    pub display_name: Option<String>,
}

impl fmt::Debug for OAuthConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConnection")
            .field("provider", &self.provider)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Secure projection of one account with token details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountDetail {
    /// The account.
    #[serde(flatten)]
    pub account: AccountView,
    /// Granted `OAuth` scopes.
    pub scopes: Vec<String>,
    /// Whether the access token is expired or about to expire.
    pub needs_refresh: bool,
}

/// Entry point for every account lifecycle operation.
#[derive(Clone)]
pub struct AccountManager {
    repository: AccountRepository,
    defaults: DefaultCoordinator,
    refresher: TokenRefresher,
    tester: ConnectionTester,
    query: AccountQuery,
    oauth: Arc<dyn OAuthProvider>,
    timeout: Duration,
}

impl fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountManager")
            .field("repository", &self.repository)
            .field("refresher", &self.refresher)
            .finish_non_exhaustive()
    }
}

impl AccountManager {
    /// Wires the services around an open repository.
    #[must_use]
    pub fn new(
        repository: AccountRepository,
        config: &Config,
        oauth: Arc<dyn OAuthProvider>,
        probe: Arc<dyn MailProbe>,
    ) -> Self {
        let policy = config.health_policy();
        let health = HealthTracker::new(repository.clone(), policy);
        let defaults = DefaultCoordinator::new(repository.clone());
        let refresher = TokenRefresher::new(
            repository.clone(),
            health.clone(),
            defaults.clone(),
            Arc::clone(&oauth),
            config.provider_timeout,
            config.refresh_lookahead,
        );
        let tester = ConnectionTester::new(
            repository.clone(),
            health,
            defaults.clone(),
            refresher.clone(),
            Arc::clone(&oauth),
            probe,
            config.provider_timeout,
        );

        Self {
            query: AccountQuery::new(repository.clone(), policy),
            repository,
            defaults,
            refresher,
            tester,
            oauth,
            timeout: config.provider_timeout,
        }
    }

    /// Opens the database named in `config` and wires the services.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the database
    /// cannot be opened.
    pub async fn open(
        config: &Config,
        cipher: CredentialCipher,
        oauth: Arc<dyn OAuthProvider>,
        probe: Arc<dyn MailProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let repository = AccountRepository::new(&config.database_path, cipher).await?;
        info!(path = %config.database_path, "Opened account store");
        Ok(Self::new(repository, config, oauth, probe))
    }

    /// Connects an `OAuth` mailbox from a completed consent flow.
    ///
    /// The first active account of a user becomes the default.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a non-`OAuth` provider or empty code,
    /// `Auth` if the provider rejects the code, `Conflict` if the mailbox is
    /// already connected, and `System` on provider outages.
    pub async fn create_from_oauth(
        &self,
        user_id: &UserId,
        connection: OAuthConnection,
    ) -> Result<AccountView> {
        let mut errors = Vec::new();
        if !connection.provider.is_oauth() {
            errors.push(ValidationError::UnsupportedProvider);
        }
        if connection.code.trim().is_empty() {
            errors.push(ValidationError::EmptyAuthorizationCode);
        }
        if !errors.is_empty() {
            return Err(errors.into());
        }

        let provider = connection.provider;
        let grant = bounded(self.timeout, self.oauth.exchange_code(provider, &connection.code))
            .await
            .map_err(|e| e.into_error("authorization code exchange failed"))?;
        let identity = bounded(self.timeout, self.oauth.get_identity(provider, &grant.access_token))
            .await
            .map_err(|e| e.into_error("identity lookup failed"))?;

        let account = self
            .repository
            .create(NewAccount {
                user_id: user_id.clone(),
                email: identity.email,
                display_name: connection.display_name,
                provider,
                credentials: Credentials::OAuth {
                    access_token: grant.access_token,
                    refresh_token: grant.refresh_token,
                },
                token_expiry: Some(expiry_after(grant.expires_in)),
                scopes: grant.scopes,
                is_verified: identity.verified,
                settings: AccountSettings::default(),
            })
            .await?;

        info!(account_id = %account.id, user_id = %user_id, %provider, "Connected OAuth account");
        self.promote_if_first(user_id, account).await
    }

    /// Connects an SMTP/IMAP mailbox after probing its servers.
    ///
    /// Servers of well-known domains are filled in when omitted.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for malformed input, `Auth` if a server rejects
    /// the login, and `Conflict` if the mailbox is already connected.
    pub async fn create_from_smtp(
        &self,
        user_id: &UserId,
        submission: SmtpSubmission,
    ) -> Result<AccountView> {
        let submission = submission.with_detected_servers();
        validate_smtp_submission(&submission)?;
        if self
            .repository
            .find_by_user_and_email(user_id, &submission.email)
            .await?
            .is_some()
        {
            return Err(Error::Conflict(format!(
                "email account {} is already connected",
                normalize_email(&submission.email)
            )));
        }

        let report = self
            .tester
            .probe_servers(
                submission.smtp.as_ref(),
                submission.imap.as_ref(),
                &submission.username,
                &submission.password,
                submission.skip_imap_test,
            )
            .await;
        if !report.healthy {
            debug!(user_id = %user_id, detail = %report.detail, "SMTP account rejected by server");
            return Err(Error::Auth(report.detail));
        }

        let account = self
            .repository
            .create(NewAccount {
                user_id: user_id.clone(),
                email: submission.email,
                display_name: submission.display_name,
                provider: MailProvider::Smtp,
                credentials: Credentials::Password {
                    username: submission.username,
                    password: submission.password,
                },
                token_expiry: None,
                scopes: Vec::new(),
                is_verified: true,
                settings: AccountSettings {
                    smtp: submission.smtp,
                    imap: submission.imap,
                    ..AccountSettings::default()
                },
            })
            .await?;

        info!(account_id = %account.id, user_id = %user_id, "Connected SMTP account");
        self.promote_if_first(user_id, account).await
    }

    async fn promote_if_first(
        &self,
        user_id: &UserId,
        account: EmailAccount,
    ) -> Result<AccountView> {
        let account = match self.defaults.ensure_default(user_id).await? {
            Some(default) if default.id == account.id => default,
            _ => account,
        };
        Ok(self.query.view(account))
    }

    /// Removes an account and its credentials.
    ///
    /// If it was the default, another active account is promoted.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing or not owned.
    pub async fn disconnect(&self, user_id: &UserId, id: AccountId) -> Result<()> {
        let account = self.repository.get_owned(user_id, id).await?;
        self.repository.delete(user_id, id).await?;
        if account.is_default {
            self.defaults.ensure_default(user_id).await?;
        }
        info!(account_id = %id, user_id = %user_id, "Disconnected email account");
        Ok(())
    }

    /// Lists a user's accounts.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for bad pagination, or a database error.
    pub async fn list(&self, user_id: &UserId, request: ListRequest) -> Result<AccountPage> {
        self.query.list(user_id, request).await
    }

    /// One account with token details.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing or not owned.
    pub async fn get_detail(&self, user_id: &UserId, id: AccountId) -> Result<AccountDetail> {
        let account = self.repository.get_owned(user_id, id).await?;
        let needs_refresh = needs_refresh(&account, Utc::now(), self.refresher.lookahead());
        let scopes = account.scopes.clone();
        Ok(AccountDetail {
            account: self.query.view(account),
            scopes,
            needs_refresh,
        })
    }

    /// Replaces an account's settings and, if given, its display name.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for invalid settings and `NotFound` if the
    /// account is missing or not owned.
    pub async fn update_settings(
        &self,
        user_id: &UserId,
        id: AccountId,
        display_name: Option<&str>,
        settings: AccountSettings,
    ) -> Result<AccountView> {
        validate_settings(&settings, display_name)?;
        let account = self
            .repository
            .update_settings(user_id, id, display_name, &settings)
            .await?;
        Ok(self.query.view(account))
    }

    /// Makes an account the user's default.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing, inactive or not owned.
    pub async fn set_default(&self, user_id: &UserId, id: AccountId) -> Result<AccountView> {
        let account = self.defaults.set_default(user_id, id).await?;
        Ok(self.query.view(account))
    }

    /// The user's default account, promoting one if none is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn default_account(&self, user_id: &UserId) -> Result<Option<AccountView>> {
        Ok(self
            .defaults
            .ensure_default(user_id)
            .await?
            .map(|a| self.query.view(a)))
    }

    /// Refreshes an account's access token now.
    ///
    /// # Errors
    ///
    /// Returns `Auth` if the user must reconnect, `System` on transient
    /// failures, and `NotFound` if the account is missing, inactive or not owned.
    pub async fn refresh_now(&self, user_id: &UserId, id: AccountId) -> Result<AccountView> {
        self.repository.get_owned(user_id, id).await?;
        let account = self.refresher.refresh(id).await?;
        Ok(self.query.view(account))
    }

    /// Refreshes every stale `OAuth` account of a user.
    ///
    /// # Errors
    ///
    /// Returns an error only if the accounts cannot be read.
    pub async fn refresh_all_for_user(&self, user_id: &UserId) -> Result<RefreshReport> {
        self.refresher.refresh_all(user_id).await
    }

    /// Deletes deactivated accounts with at least `max_errors` failures,
    /// across all users.
    ///
    /// Returns the number of accounts removed.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `max_errors` is zero, or a database error.
    pub async fn cleanup_failed_accounts(&self, max_errors: u32) -> Result<u64> {
        if max_errors == 0 {
            return Err(ValidationError::InvalidErrorThreshold.into());
        }

        let owners = self.repository.delete_failed(max_errors).await?;
        let removed = u64::try_from(owners.len()).unwrap_or(u64::MAX);
        for user_id in owners.into_iter().collect::<BTreeSet<_>>() {
            self.defaults.ensure_default(&user_id).await?;
        }

        info!(removed, max_errors, "Cleaned up failed email accounts");
        Ok(removed)
    }

    /// Tests an account's stored credentials.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing or not owned.
    pub async fn test_connection(
        &self,
        user_id: &UserId,
        id: AccountId,
    ) -> Result<ConnectionReport> {
        self.tester.test(user_id, id).await
    }

    /// Counts a sent message against an active account.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing, inactive or not owned.
    pub async fn record_usage(&self, user_id: &UserId, id: AccountId) -> Result<AccountView> {
        let account = self.repository.record_usage(user_id, id).await?;
        Ok(self.query.view(account))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::account::test_support::{oauth_account, repository, user};
    use crate::account::{HealthPolicy, Security, ServerSettings};
    use crate::service::test_support::{MockOAuth, MockProbe};

    async fn manager_with(
        oauth: MockOAuth,
        probe: MockProbe,
    ) -> (AccountManager, AccountRepository) {
        let repo = repository().await;
        let config = Config::default();
        let manager = AccountManager::new(repo.clone(), &config, Arc::new(oauth), Arc::new(probe));
        (manager, repo)
    }

    fn gmail(code: &str) -> OAuthConnection {
        OAuthConnection {
            provider: MailProvider::Gmail,
            code: code.to_string(),
            display_name: Some("Personal".into()),
        }
    }

    fn submission(email: &str) -> SmtpSubmission {
        SmtpSubmission {
            email: email.to_string(),
            password: "app-password".into(),
            ..SmtpSubmission::default()
        }
    }

    #[tokio::test]
    async fn first_oauth_account_becomes_default() {
        let oauth = MockOAuth::default().with_identity("Alice@Gmail.com");
        let (manager, _) = manager_with(oauth, MockProbe::default()).await;

        let view = manager.create_from_oauth(&user("u1"), gmail("code-1")).await.unwrap();
        assert_eq!(view.email, "alice@gmail.com");
        assert!(view.is_default);
        assert!(view.is_verified);
        assert!(view.token_expiry.is_some());

        let err = manager.create_from_oauth(&user("u1"), gmail("code-2")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn rejected_code_requires_reauth() {
        let (manager, _) = manager_with(MockOAuth::default(), MockProbe::default()).await;
        let err = manager.create_from_oauth(&user("u1"), gmail("bad-code")).await.unwrap_err();
        assert!(err.requires_reauth());

        let err = manager.create_from_oauth(&user("u1"), gmail("  ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let smtp = OAuthConnection {
            provider: MailProvider::Smtp,
            ..gmail("code")
        };
        assert_eq!(
            manager.create_from_oauth(&user("u1"), smtp).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn smtp_account_uses_detected_servers() {
        let (manager, repo) = manager_with(MockOAuth::default(), MockProbe::default()).await;
        let view = manager
            .create_from_smtp(&user("u1"), submission("me@icloud.com"))
            .await
            .unwrap();
        assert!(view.is_default);
        assert_eq!(view.settings.smtp.as_ref().unwrap().host, "smtp.mail.me.com");

        let stored = repo.get(view.id).await.unwrap().unwrap();
        assert_eq!(
            repo.credentials(&stored).unwrap(),
            Credentials::Password {
                username: "me@icloud.com".into(),
                password: "app-password".into(),
            }
        );
    }

    #[tokio::test]
    async fn smtp_account_rejected_by_server() {
        let probe = MockProbe::rejecting_send();
        let (manager, repo) = manager_with(MockOAuth::default(), probe).await;
        let mut input = submission("me@example.com");
        input.smtp = Some(ServerSettings::new("smtp.example.com", 587, Security::StartTls));
        input.imap = Some(ServerSettings::new("imap.example.com", 993, Security::Tls));

        let err = manager.create_from_smtp(&user("u1"), input).await.unwrap_err();
        assert!(err.requires_reauth());
        assert!(repo.find_active_by_user(&user("u1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn smtp_validation_collects_errors() {
        let (manager, _) = manager_with(MockOAuth::default(), MockProbe::default()).await;
        let err = manager
            .create_from_smtp(&user("u1"), SmtpSubmission::default())
            .await
            .unwrap_err();
        match err {
            Error::Validation(errors) => assert!(errors.len() > 1),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_promotes_another_default() {
        let (manager, repo) = manager_with(MockOAuth::default(), MockProbe::default()).await;
        let first = manager.create_from_oauth(&user("u1"), gmail("code")).await.unwrap();
        let second = repo.create(oauth_account("u1", "b@gmail.com")).await.unwrap();

        manager.disconnect(&user("u1"), first.id).await.unwrap();
        assert!(repo.get(first.id).await.unwrap().is_none());
        let detail = manager.get_detail(&user("u1"), second.id).await.unwrap();
        assert!(detail.account.is_default);
        assert!(!detail.needs_refresh);
        assert_eq!(detail.scopes, vec!["https://mail.google.com/".to_string()]);

        assert_eq!(
            manager.disconnect(&user("u2"), second.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn cleanup_removes_only_failed_inactive_accounts() {
        let (manager, repo) = manager_with(MockOAuth::default(), MockProbe::default()).await;
        let health = HealthTracker::new(repo.clone(), HealthPolicy::default());
        let dead = repo.create(oauth_account("u1", "dead@gmail.com")).await.unwrap();
        let flaky = repo.create(oauth_account("u1", "flaky@gmail.com")).await.unwrap();
        let other = repo.create(oauth_account("u2", "other@gmail.com")).await.unwrap();
        manager.set_default(&user("u1"), dead.id).await.unwrap();
        for _ in 0..10 {
            health.record_error(dead.id, "revoked", None).await.unwrap();
            health.record_error(other.id, "revoked", None).await.unwrap();
        }
        health.record_error(flaky.id, "timeout", None).await.unwrap();

        assert_eq!(manager.cleanup_failed_accounts(10).await.unwrap(), 2);
        assert!(repo.get(dead.id).await.unwrap().is_none());
        assert!(repo.get(other.id).await.unwrap().is_none());
        let flaky = repo.get(flaky.id).await.unwrap().unwrap();
        assert!(flaky.is_default);

        assert_eq!(
            manager.cleanup_failed_accounts(0).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn update_settings_validates() {
        let (manager, repo) = manager_with(MockOAuth::default(), MockProbe::default()).await;
        let account = repo.create(oauth_account("u1", "a@gmail.com")).await.unwrap();

        let bad = AccountSettings {
            aliases: vec!["not-an-address".into()],
            ..AccountSettings::default()
        };
        let err = manager
            .update_settings(&user("u1"), account.id, None, bad)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let good = AccountSettings {
            aliases: vec!["alias@gmail.com".into()],
            signature: Some("Cheers".into()),
            ..AccountSettings::default()
        };
        let view = manager
            .update_settings(&user("u1"), account.id, Some("Main"), good.clone())
            .await
            .unwrap();
        assert_eq!(view.settings, good);
        assert_eq!(view.display_name.as_deref(), Some("Main"));
    }

    #[tokio::test]
    async fn refresh_now_checks_ownership() {
        let (manager, repo) = manager_with(MockOAuth::default(), MockProbe::default()).await;
        let account = repo.create(oauth_account("u1", "a@gmail.com")).await.unwrap();

        let err = manager.refresh_now(&user("u2"), account.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        manager.refresh_now(&user("u1"), account.id).await.unwrap();
    }

    #[tokio::test]
    async fn usage_and_default_lookup() {
        let (manager, repo) = manager_with(MockOAuth::default(), MockProbe::default()).await;
        let account = repo.create(oauth_account("u1", "a@gmail.com")).await.unwrap();

        let used = manager.record_usage(&user("u1"), account.id).await.unwrap();
        assert_eq!(used.emails_sent, 1);
        let default = manager.default_account(&user("u1")).await.unwrap().unwrap();
        assert_eq!(default.id, account.id);
        assert!(manager.default_account(&user("nobody")).await.unwrap().is_none());
    }
}
