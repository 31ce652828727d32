//! Integration tests for the account lifecycle.
//!
//! These tests drive [`AccountManager`] through its public API with
//! scripted providers, without network access.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use mailbridge_core::{
    AccountId, AccountManager, AccountRepository, Config, CredentialCipher, EncryptionKey,
    ErrorKind, HealthPolicy, HealthStatus, HealthTracker, Identity, ListRequest, MailProbe,
    MailProvider, OAuthConnection, OAuthProvider, ProbeReport, ProviderError, RefreshStatus,
    ServerSettings, SmtpSubmission, TokenGrant, UserId,
};

/// Provider that hands out one identity per exchanged code.
struct ScriptedProvider {
    refresh_calls: AtomicUsize,
    refresh_delay: Duration,
    revoked: bool,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            refresh_delay: Duration::ZERO,
            revoked: false,
        }
    }

    fn slow() -> Self {
        Self {
            refresh_delay: Duration::from_millis(200),
            ..Self::new()
        }
    }

    fn revoked() -> Self {
        Self {
            revoked: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl OAuthProvider for ScriptedProvider {
    async fn exchange_code(
        &self,
        _provider: MailProvider,
        code: &str,
    ) -> Result<TokenGrant, ProviderError> {
        // Codes double as the mailbox local part
        Ok(TokenGrant {
            access_token: format!("access:{code}"),
            refresh_token: Some(format!("refresh:{code}")),
            expires_in: Some(60),
            scopes: vec!["https://mail.google.com/".into()],
        })
    }

    async fn refresh(
        &self,
        _provider: MailProvider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.refresh_delay).await;
        if self.revoked {
            return Err(ProviderError::InvalidGrant("Token has been expired or revoked".into()));
        }
        Ok(TokenGrant {
            access_token: format!("fresh:{refresh_token}"),
            refresh_token: None,
            expires_in: Some(3600),
            scopes: Vec::new(),
        })
    }

    async fn get_identity(
        &self,
        _provider: MailProvider,
        access_token: &str,
    ) -> Result<Identity, ProviderError> {
        let local = access_token.rsplit(':').next().unwrap_or("unknown");
        Ok(Identity {
            email: format!("{local}@gmail.com"),
            verified: true,
            provider_id: local.to_string(),
        })
    }
}

/// Probe accepting every login.
struct AcceptingProbe;

#[async_trait]
impl MailProbe for AcceptingProbe {
    async fn test_send(&self, server: &ServerSettings, _: &str, _: &str) -> ProbeReport {
        ProbeReport::ok(format!("authenticated with {}", server.host))
    }

    async fn test_receive(&self, server: &ServerSettings, _: &str, _: &str) -> ProbeReport {
        ProbeReport::ok(format!("logged in to {}", server.host))
    }
}

fn cipher() -> CredentialCipher {
    CredentialCipher::new(&EncryptionKey::from_bytes([42; 32]))
}

fn config() -> Config {
    Config {
        provider_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

async fn setup(provider: Arc<ScriptedProvider>) -> (AccountManager, AccountRepository) {
    let repo = AccountRepository::in_memory(cipher()).await.unwrap();
    let manager = AccountManager::new(repo.clone(), &config(), provider, Arc::new(AcceptingProbe));
    (manager, repo)
}

async fn connect(manager: &AccountManager, user: &UserId, local: &str) -> AccountId {
    let connection = OAuthConnection {
        provider: MailProvider::Gmail,
        code: local.to_string(),
        display_name: None,
    };
    manager.create_from_oauth(user, connection).await.unwrap().id
}

#[tokio::test]
async fn default_follows_usage_then_explicit_choice() {
    let (manager, _) = setup(Arc::new(ScriptedProvider::new())).await;
    let user = UserId::new("alice");
    let a1 = connect(&manager, &user, "a1").await;
    let a2 = connect(&manager, &user, "a2").await;
    let a3 = connect(&manager, &user, "a3").await;

    // The first connection became the default; drop it to force an election
    manager.disconnect(&user, a1).await.unwrap();
    manager.record_usage(&user, a3).await.unwrap();
    let page = manager.list(&user, ListRequest::default()).await.unwrap();
    let default = page.summary.default_account.unwrap();
    assert!(default == a2 || default == a3);

    manager.set_default(&user, a3).await.unwrap();
    manager.set_default(&user, a2).await.unwrap();
    let page = manager.list(&user, ListRequest::default()).await.unwrap();
    let defaults: Vec<_> = page.accounts.iter().filter(|a| a.is_default).collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].id, a2);
}

#[tokio::test]
async fn concurrent_set_default_leaves_one_default() {
    let path = std::env::temp_dir().join(format!("mailbridge-{}.db", uuid::Uuid::new_v4()));
    let repo = AccountRepository::new(path.to_str().unwrap(), cipher()).await.unwrap();
    let manager = AccountManager::new(
        repo,
        &config(),
        Arc::new(ScriptedProvider::new()),
        Arc::new(AcceptingProbe),
    );
    let user = UserId::new("alice");
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(connect(&manager, &user, &format!("box{i}")).await);
    }

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let manager = manager.clone();
            let user = user.clone();
            let id = ids[i % ids.len()];
            tokio::spawn(async move { manager.set_default(&user, id).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let page = manager.list(&user, ListRequest::default()).await.unwrap();
    assert_eq!(page.accounts.iter().filter(|a| a.is_default).count(), 1);
    drop(manager);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn concurrent_refreshes_share_one_provider_call() {
    let provider = Arc::new(ScriptedProvider::slow());
    let (manager, _) = setup(Arc::clone(&provider)).await;
    let user = UserId::new("alice");
    let id = connect(&manager, &user, "a1").await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let user = user.clone();
            tokio::spawn(async move { manager.refresh_now(&user, id).await })
        })
        .collect();
    for task in tasks {
        let view = task.await.unwrap().unwrap();
        assert_eq!(view.error_count, 0);
    }
    assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);

    let detail = manager.get_detail(&user, id).await.unwrap();
    assert!(!detail.needs_refresh);
}

#[tokio::test]
async fn stale_tokens_are_refreshed_in_bulk() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, _) = setup(Arc::clone(&provider)).await;
    let user = UserId::new("alice");
    // Granted tokens live 60s, inside the refresh window
    connect(&manager, &user, "a1").await;
    connect(&manager, &user, "a2").await;

    let report = manager.refresh_all_for_user(&user).await.unwrap();
    assert_eq!(report.refreshed(), 2);
    assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 2);

    let report = manager.refresh_all_for_user(&user).await.unwrap();
    assert!(report.accounts.is_empty());
}

#[tokio::test]
async fn revoked_grant_degrades_then_deactivates() {
    let (manager, repo) = setup(Arc::new(ScriptedProvider::revoked())).await;
    let user = UserId::new("alice");
    let id = connect(&manager, &user, "a1").await;
    let backup = connect(&manager, &user, "a2").await;

    let report = manager.refresh_all_for_user(&user).await.unwrap();
    assert!(report.accounts.iter().all(|r| r.status == RefreshStatus::ReauthRequired));

    let err = manager.refresh_now(&user, id).await.unwrap_err();
    assert!(err.requires_reauth());
    let detail = manager.get_detail(&user, id).await.unwrap();
    assert_eq!(detail.account.error_count, 2);
    assert_eq!(detail.account.health, HealthStatus::Warning);

    let health = HealthTracker::new(repo, HealthPolicy::default());
    for _ in 0..8 {
        health.record_error(id, "invalid_grant", Some("invalid_grant")).await.unwrap();
    }
    let detail = manager.get_detail(&user, id).await.unwrap();
    assert!(!detail.account.is_active);
    assert!(!detail.account.is_default);
    assert_eq!(detail.account.health, HealthStatus::Inactive);

    let default = manager.default_account(&user).await.unwrap().unwrap();
    assert_eq!(default.id, backup);

    let err = manager.set_default(&user, id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn cleanup_purges_dead_accounts_and_reelects() {
    let (manager, repo) = setup(Arc::new(ScriptedProvider::new())).await;
    let user = UserId::new("alice");
    let dead = connect(&manager, &user, "a1").await;
    let alive = connect(&manager, &user, "a2").await;

    let health = HealthTracker::new(repo, HealthPolicy::default());
    for _ in 0..10 {
        health.record_error(dead, "auth failed", None).await.unwrap();
    }
    assert_eq!(manager.cleanup_failed_accounts(10).await.unwrap(), 1);
    assert_eq!(manager.cleanup_failed_accounts(10).await.unwrap(), 0);

    let page = manager.list(&user, ListRequest::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.summary.default_account, Some(alive));
}

#[tokio::test]
async fn duplicate_mailbox_conflicts_across_flows() {
    let (manager, _) = setup(Arc::new(ScriptedProvider::new())).await;
    let user = UserId::new("alice");
    connect(&manager, &user, "shared").await;

    let submission = SmtpSubmission {
        email: "Shared@Gmail.com".into(),
        password: "app-password".into(),
        ..SmtpSubmission::default()
    };
    let err = manager.create_from_smtp(&user, submission.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Another user may connect the same mailbox
    let other = UserId::new("bob");
    let view = manager.create_from_smtp(&other, submission).await.unwrap();
    assert!(view.is_default);
    assert_eq!(view.email, "shared@gmail.com");
}

#[tokio::test]
async fn connection_test_reports_health() {
    let (manager, _) = setup(Arc::new(ScriptedProvider::new())).await;
    let user = UserId::new("alice");
    let id = connect(&manager, &user, "a1").await;

    let report = manager.test_connection(&user, id).await.unwrap();
    assert!(report.healthy);
    assert!(report.detail.contains("a1@gmail.com"));

    let err = manager
        .test_connection(&UserId::new("mallory"), id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn pages_are_disjoint_and_complete() {
    let (manager, _) = setup(Arc::new(ScriptedProvider::new())).await;
    let user = UserId::new("alice");
    for i in 0..5 {
        connect(&manager, &user, &format!("box{i}")).await;
    }

    let mut seen = HashSet::new();
    let mut sizes = Vec::new();
    for page in 1..=3 {
        let request = ListRequest {
            page,
            limit: 2,
            ..ListRequest::default()
        };
        let result = manager.list(&user, request).await.unwrap();
        assert_eq!(result.total, 5);
        sizes.push(result.accounts.len());
        seen.extend(result.accounts.into_iter().map(|a| a.id));
    }
    assert_eq!(sizes, [2, 2, 1]);
    assert_eq!(seen.len(), 5);
}

#[test]
fn sealed_credentials_are_bound_to_their_account() {
    let cipher = cipher();
    let a = AccountId::generate();
    let b = AccountId::generate();

    let sealed = cipher.encrypt(&a, "refresh-token").unwrap();
    assert_eq!(cipher.decrypt(&a, &sealed).unwrap(), "refresh-token");
    assert!(cipher.decrypt(&b, &sealed).is_err());
    // Already sealed values pass through unchanged
    assert_eq!(cipher.encrypt(&a, &sealed).unwrap(), sealed);
}
