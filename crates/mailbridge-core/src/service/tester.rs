//! Connection testing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::refresh::TokenRefresher;
use crate::account::{
    AccountId, AccountRepository, Credentials, DefaultCoordinator, EmailAccount, HealthTracker,
    ServerSettings, UserId,
};
use crate::provider::{MailProbe, OAuthProvider, ProbeReport, ProviderError, bounded};
use crate::Result;

const TEST_FAILED_CODE: &str = "connection_test_failed";

/// Outcome of a connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    /// Whether the account is usable.
    pub healthy: bool,
    /// Human-readable detail.
    pub detail: String,
    /// A token refresh was needed and attempted.
    pub refreshed: bool,
    /// Outgoing server probe (SMTP accounts).
    pub send: Option<ProbeReport>,
    /// Incoming server probe (SMTP accounts).
    pub receive: Option<ProbeReport>,
}

impl ConnectionReport {
    fn oauth(healthy: bool, detail: impl Into<String>, refreshed: bool) -> Self {
        Self {
            healthy,
            detail: detail.into(),
            refreshed,
            send: None,
            receive: None,
        }
    }
}

/// Verifies that stored credentials still authenticate.
#[derive(Clone)]
pub struct ConnectionTester {
    repository: AccountRepository,
    health: HealthTracker,
    defaults: DefaultCoordinator,
    refresher: TokenRefresher,
    oauth: Arc<dyn OAuthProvider>,
    probe: Arc<dyn MailProbe>,
    timeout: Duration,
}

impl fmt::Debug for ConnectionTester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTester")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionTester {
    /// Creates a tester; `timeout` bounds every provider call.
    #[must_use]
    pub fn new(
        repository: AccountRepository,
        health: HealthTracker,
        defaults: DefaultCoordinator,
        refresher: TokenRefresher,
        oauth: Arc<dyn OAuthProvider>,
        probe: Arc<dyn MailProbe>,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            health,
            defaults,
            refresher,
            oauth,
            probe,
            timeout,
        }
    }

    /// Tests an account owned by `user_id`.
    ///
    /// A success clears the error counter, re-activating the account. Every
    /// failure is recorded against it exactly once. An `OAuth` account whose
    /// access token is rejected gets exactly one refresh attempt, whose
    /// outcome is reported.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing or not owned, or a
    /// system error if its credentials cannot be opened.
    pub async fn test(&self, user_id: &UserId, id: AccountId) -> Result<ConnectionReport> {
        let account = self.repository.get_owned(user_id, id).await?;
        let credentials = match self.repository.credentials(&account) {
            Ok(credentials) => credentials,
            Err(e) => {
                self.record_failure(&account, &e.to_string()).await?;
                return Err(e);
            }
        };

        let report = match credentials {
            Credentials::OAuth { access_token, .. } => {
                let call = self.oauth.get_identity(account.provider, &access_token);
                match bounded(self.timeout, call).await {
                    Ok(identity) => {
                        let detail = format!("authenticated as {}", identity.email);
                        ConnectionReport::oauth(true, detail, false)
                    }
                    Err(ProviderError::InvalidToken(_)) => {
                        debug!(account_id = %id, "Access token rejected, refreshing once");
                        return self.refresh_once(&account).await;
                    }
                    Err(e) => ConnectionReport::oauth(false, e.to_string(), false),
                }
            }
            Credentials::Password { username, password } => {
                self.probe_servers(
                    account.settings.smtp.as_ref(),
                    account.settings.imap.as_ref(),
                    &username,
                    &password,
                    false,
                )
                .await
            }
        };

        if report.healthy {
            self.health.clear_errors(id).await?;
            self.repository.touch_sync(id, Utc::now()).await?;
            info!(account_id = %id, "Connection test passed");
        } else {
            self.record_failure(&account, &report.detail).await?;
        }
        Ok(report)
    }

    /// Refreshes after a rejected access token.
    ///
    /// Provider failures are recorded by the refresher; anything it did not
    /// record, such as an inactive account or unreadable credentials, is
    /// recorded here.
    async fn refresh_once(&self, account: &EmailAccount) -> Result<ConnectionReport> {
        match self.refresher.refresh_tracked(account.id).await {
            Ok(_) => {
                self.repository.touch_sync(account.id, Utc::now()).await?;
                info!(account_id = %account.id, "Connection test passed after refresh");
                Ok(ConnectionReport::oauth(true, "access token refreshed", true))
            }
            Err(failure) => {
                let detail = failure.error.to_string();
                if !failure.recorded {
                    self.record_failure(account, &detail).await?;
                }
                Ok(ConnectionReport::oauth(false, detail, true))
            }
        }
    }

    /// Runs the SMTP probe, then the IMAP probe unless skipped or unconfigured.
    pub(crate) async fn probe_servers(
        &self,
        smtp: Option<&ServerSettings>,
        imap: Option<&ServerSettings>,
        username: &str,
        password: &str,
        skip_receive: bool,
    ) -> ConnectionReport {
        let send = match smtp {
            Some(server) => self
                .bounded_probe(self.probe.test_send(server, username, password))
                .await,
            None => ProbeReport::failed("no SMTP server configured"),
        };

        let receive = match imap {
            _ if !send.success => None,
            Some(server) if !skip_receive => Some(
                self.bounded_probe(self.probe.test_receive(server, username, password))
                    .await,
            ),
            _ => Some(ProbeReport::skipped()),
        };

        let (healthy, detail) = match &receive {
            Some(r) if !r.success => (false, format!("IMAP: {}", r.detail)),
            Some(_) => (true, send.detail.clone()),
            None => (false, format!("SMTP: {}", send.detail)),
        };

        ConnectionReport {
            healthy,
            detail,
            refreshed: false,
            send: Some(send),
            receive,
        }
    }

    async fn record_failure(&self, account: &EmailAccount, detail: &str) -> Result<()> {
        let record = self
            .health
            .record_error(account.id, detail, Some(TEST_FAILED_CODE))
            .await?;
        if record.deactivated {
            self.defaults.ensure_default(&account.user_id).await?;
        }
        warn!(account_id = %account.id, "Connection test failed");
        Ok(())
    }

    async fn bounded_probe(&self, call: impl Future<Output = ProbeReport>) -> ProbeReport {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| {
                ProbeReport::failed(format!("no response within {}s", self.timeout.as_secs()))
            })
    }
}
