//! `OAuth2` token refresh.
//!
//! At most one provider refresh runs per account. A caller arriving while a
//! refresh is in flight waits for that refresh and shares its outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::account::{
    AccountId, AccountRepository, ConnectionType, Credentials, DefaultCoordinator, EmailAccount,
    HealthTracker, UserId, ValidationError,
};
use crate::provider::{OAuthProvider, ProviderError, bounded};
use crate::{Error, Result};

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Upper bound on a reported token lifetime (one year).
const MAX_TOKEN_LIFETIME_SECS: u64 = 365 * 24 * 3600;

/// Outcome shared with callers that waited on an in-flight refresh.
type Shared = std::result::Result<(), Arc<RefreshFailure>>;
type InFlight = Arc<Mutex<HashMap<AccountId, watch::Receiver<Option<Shared>>>>>;

/// Expiry of a token issued now with the reported lifetime.
pub(crate) fn expiry_after(expires_in: Option<u64>) -> DateTime<Utc> {
    let lifetime = expires_in
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
        .min(MAX_TOKEN_LIFETIME_SECS);
    Utc::now() + chrono::Duration::seconds(i64::try_from(lifetime).unwrap_or_default())
}

/// Returns true if an active `OAuth` account's token is expired or expires
/// within `lookahead`.
#[must_use]
pub fn needs_refresh(account: &EmailAccount, now: DateTime<Utc>, lookahead: Duration) -> bool {
    let lookahead =
        chrono::Duration::from_std(lookahead).unwrap_or_else(|_| chrono::Duration::zero());
    account.is_active
        && account.connection_type == ConnectionType::OAuth
        && account
            .token_expiry
            .is_some_and(|exp| exp <= now.checked_add_signed(lookahead).unwrap_or(now))
}

/// Result of refreshing one account in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    /// New tokens stored.
    Refreshed,
    /// Grant revoked; the user must reconnect.
    ReauthRequired,
    /// Transient failure; may be retried later.
    Failed,
    /// Retrying will not help: the stored credentials no longer decrypt
    /// or the account went away.
    Unrecoverable,
}

/// Per-account entry of a [`RefreshReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountRefresh {
    /// Account identifier.
    pub account_id: AccountId,
    /// Mailbox address.
    pub email: String,
    /// What happened.
    pub status: RefreshStatus,
    /// Failure detail.
    pub detail: Option<String>,
}

/// Outcome of refreshing every stale account of a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// One entry per attempted account.
    pub accounts: Vec<AccountRefresh>,
}

impl RefreshReport {
    fn count(&self, status: RefreshStatus) -> usize {
        self.accounts.iter().filter(|a| a.status == status).count()
    }

    /// Accounts with new tokens.
    #[must_use]
    pub fn refreshed(&self) -> usize {
        self.count(RefreshStatus::Refreshed)
    }

    /// Accounts that need interactive re-authorization.
    #[must_use]
    pub fn reauth_required(&self) -> usize {
        self.count(RefreshStatus::ReauthRequired)
    }

    /// Accounts that failed transiently.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(RefreshStatus::Failed)
    }

    /// Accounts that cannot be refreshed by retrying.
    #[must_use]
    pub fn unrecoverable(&self) -> usize {
        self.count(RefreshStatus::Unrecoverable)
    }
}

/// A failed refresh, and whether it was already counted against the account.
#[derive(Debug)]
pub(crate) struct RefreshFailure {
    pub(crate) error: Error,
    pub(crate) recorded: bool,
}

impl RefreshFailure {
    fn replicate(&self) -> Self {
        Self {
            error: self.error.replicate(),
            recorded: self.recorded,
        }
    }
}

impl From<Error> for RefreshFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            recorded: false,
        }
    }
}

/// Refreshes access tokens and classifies failures.
#[derive(Clone)]
pub struct TokenRefresher {
    repository: AccountRepository,
    health: HealthTracker,
    defaults: DefaultCoordinator,
    provider: Arc<dyn OAuthProvider>,
    timeout: Duration,
    lookahead: Duration,
    in_flight: InFlight,
}

impl fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("timeout", &self.timeout)
            .field("lookahead", &self.lookahead)
            .finish_non_exhaustive()
    }
}

enum Lease {
    Leader(watch::Sender<Option<Shared>>, LeaseGuard),
    Follower(watch::Receiver<Option<Shared>>),
}

/// Releases the in-flight entry on every exit path, including cancellation.
struct LeaseGuard {
    in_flight: InFlight,
    id: AccountId,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl TokenRefresher {
    /// Creates a refresher.
    ///
    /// `timeout` bounds every provider call; `lookahead` is the window in
    /// which tokens count as stale.
    #[must_use]
    pub fn new(
        repository: AccountRepository,
        health: HealthTracker,
        defaults: DefaultCoordinator,
        provider: Arc<dyn OAuthProvider>,
        timeout: Duration,
        lookahead: Duration,
    ) -> Self {
        Self {
            repository,
            health,
            defaults,
            provider,
            timeout,
            lookahead,
            in_flight: Arc::default(),
        }
    }

    /// Refreshes the tokens of one account.
    ///
    /// Concurrent calls for the same account share one provider call.
    ///
    /// # Errors
    ///
    /// Returns `Auth` if the grant is revoked, `System` on transient
    /// failures, and `NotFound` if the account is missing or inactive.
    /// Waiting callers receive the same error kind and details.
    pub async fn refresh(&self, id: AccountId) -> Result<EmailAccount> {
        self.refresh_tracked(id).await.map_err(|failure| failure.error)
    }

    /// Like [`Self::refresh`], reporting whether the failure was recorded.
    pub(crate) async fn refresh_tracked(
        &self,
        id: AccountId,
    ) -> std::result::Result<EmailAccount, RefreshFailure> {
        match self.acquire(id) {
            Lease::Leader(sender, _guard) => {
                let result = self.refresh_exclusive(id).await;
                let shared = result
                    .as_ref()
                    .map(|_| ())
                    .map_err(|failure| Arc::new(failure.replicate()));
                sender.send_replace(Some(shared));
                result
            }
            Lease::Follower(mut receiver) => {
                debug!(account_id = %id, "Waiting for in-flight token refresh");
                let shared = receiver
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| Error::system("in-flight token refresh was abandoned"))?
                    .clone();
                match shared {
                    Some(Ok(())) => Ok(self
                        .repository
                        .get(id)
                        .await?
                        .ok_or_else(|| Error::account_not_found(id))?),
                    Some(Err(failure)) => Err(failure.replicate()),
                    None => Err(Error::system("in-flight token refresh was abandoned").into()),
                }
            }
        }
    }

    fn acquire(&self, id: AccountId) -> Lease {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(receiver) = in_flight.get(&id) {
            return Lease::Follower(receiver.clone());
        }
        let (sender, receiver) = watch::channel(None);
        in_flight.insert(id, receiver);
        Lease::Leader(
            sender,
            LeaseGuard {
                in_flight: Arc::clone(&self.in_flight),
                id,
            },
        )
    }

    async fn refresh_exclusive(
        &self,
        id: AccountId,
    ) -> std::result::Result<EmailAccount, RefreshFailure> {
        let account = self
            .repository
            .get(id)
            .await?
            .filter(|a| a.is_active)
            .ok_or_else(|| Error::account_not_found(id))?;
        if account.connection_type != ConnectionType::OAuth {
            return Err(Error::from(ValidationError::UnsupportedProvider).into());
        }

        let Credentials::OAuth {
            refresh_token: Some(refresh_token),
            ..
        } = self.repository.credentials(&account)?
        else {
            let missing = ProviderError::InvalidGrant("no refresh token stored".into());
            return Err(self.fail(&account, &missing).await);
        };

        let call = self.provider.refresh(account.provider, &refresh_token);
        let result = bounded(self.timeout, call).await;

        match result {
            Ok(grant) => {
                let expiry = expiry_after(grant.expires_in);
                let refresh_token = grant.refresh_token.as_deref();
                self.repository
                    .store_tokens(id, &grant.access_token, refresh_token, expiry)
                    .await?;
                self.health.clear_errors(id).await?;

                info!(account_id = %id, provider = %account.provider, "Refreshed access token");
                Ok(self
                    .repository
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::account_not_found(id))?)
            }
            Err(e) => Err(self.fail(&account, &e).await),
        }
    }

    /// Records a provider failure and turns it into the caller-facing error.
    async fn fail(&self, account: &EmailAccount, error: &ProviderError) -> RefreshFailure {
        let recorded = match self
            .health
            .record_error(account.id, error.to_string(), Some(error.code()))
            .await
        {
            Ok(record) => {
                if record.deactivated
                    && let Err(e) = self.defaults.ensure_default(&account.user_id).await
                {
                    warn!(user_id = %account.user_id, error = %e, "Failed to re-elect default");
                }
                true
            }
            Err(e) => {
                warn!(account_id = %account.id, error = %e, "Failed to record refresh error");
                false
            }
        };

        let error = if error.is_permanent() {
            debug!(account_id = %account.id, "Refresh grant rejected, re-authorization required");
            Error::Auth(format!("{}: {error}", account.email))
        } else {
            warn!(account_id = %account.id, error = %error, "Token refresh failed");
            Error::system(format!("refreshing {} failed: {error}", account.email))
        };
        RefreshFailure { error, recorded }
    }

    /// Active `OAuth` accounts of a user whose token is stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn candidates(&self, user_id: &UserId) -> Result<Vec<EmailAccount>> {
        let now = Utc::now();
        Ok(self
            .repository
            .find_active_by_user(user_id)
            .await?
            .into_iter()
            .filter(|a| needs_refresh(a, now, self.lookahead))
            .collect())
    }

    /// Staleness window in use.
    #[must_use]
    pub const fn lookahead(&self) -> Duration {
        self.lookahead
    }

    /// Refreshes every stale account of a user.
    ///
    /// Failures are collected in the report instead of aborting the batch.
    ///
    /// # Errors
    ///
    /// Returns an error only if the candidate query fails.
    pub async fn refresh_all(&self, user_id: &UserId) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();
        for account in self.candidates(user_id).await? {
            let (status, detail) = match self.refresh(account.id).await {
                Ok(_) => (RefreshStatus::Refreshed, None),
                Err(e) => {
                    let status = if e.requires_reauth() {
                        RefreshStatus::ReauthRequired
                    } else if e.is_retryable() {
                        RefreshStatus::Failed
                    } else {
                        RefreshStatus::Unrecoverable
                    };
                    (status, Some(e.to_string()))
                }
            };
            report.accounts.push(AccountRefresh {
                account_id: account.id,
                email: account.email,
                status,
                detail,
            });
        }

        info!(
            user_id = %user_id,
            refreshed = report.refreshed(),
            reauth_required = report.reauth_required(),
            failed = report.failed(),
            unrecoverable = report.unrecoverable(),
            "Refreshed stale accounts"
        );
        Ok(report)
    }
}
