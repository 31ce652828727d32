//! Account listing.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::account::{
    AccountFilter, AccountId, AccountRepository, AccountSettings, ConnectionType, EmailAccount,
    HealthPolicy, HealthStatus, LastError, MailProvider, UserId, validate_pagination,
};
use crate::Result;

/// Default page size of [`ListRequest`].
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Secure projection of an account.
///
/// Carries no secret material, sealed or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountView {
    /// Account identifier.
    pub id: AccountId,
    /// Mailbox address.
    pub email: String,
    /// Display name.
    pub display_name: Option<String>,
    /// Provider.
    pub provider: MailProvider,
    /// Connection type.
    pub connection_type: ConnectionType,
    /// Whether the account may be used.
    pub is_active: bool,
    /// Whether the provider verified the address.
    pub is_verified: bool,
    /// Whether this is the user's default account.
    pub is_default: bool,
    /// Derived health.
    pub health: HealthStatus,
    /// Consecutive failures.
    pub error_count: u32,
    /// Last failure.
    pub last_error: Option<LastError>,
    /// Messages sent.
    pub emails_sent: u64,
    /// Last use.
    pub last_used: Option<DateTime<Utc>>,
    /// Last successful sync or connection test.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Access token expiry.
    pub token_expiry: Option<DateTime<Utc>>,
    /// Provider-specific settings.
    pub settings: AccountSettings,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl AccountView {
    /// Projects `account` with its health at `now`.
    #[must_use]
    pub fn new(account: EmailAccount, policy: &HealthPolicy, now: DateTime<Utc>) -> Self {
        let health = policy.evaluate(&account, now);
        Self {
            id: account.id,
            email: account.email,
            display_name: account.display_name,
            provider: account.provider,
            connection_type: account.connection_type,
            is_active: account.is_active,
            is_verified: account.is_verified,
            is_default: account.is_default,
            health,
            error_count: account.error_count,
            last_error: account.last_error,
            emails_sent: account.emails_sent,
            last_used: account.last_used,
            last_sync_at: account.last_sync_at,
            token_expiry: account.token_expiry,
            settings: account.settings,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

/// Paging and filtering of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListRequest {
    /// Filter.
    pub filter: AccountFilter,
    /// 1-based page number.
    pub page: u32,
    /// Page size, 1 to 100.
    pub limit: u32,
}

impl Default for ListRequest {
    fn default() -> Self {
        Self {
            filter: AccountFilter::default(),
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Counts over all of a user's accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountSummary {
    /// All accounts.
    pub total: u64,
    /// Active accounts.
    pub active: u64,
    /// Deactivated accounts.
    pub inactive: u64,
    /// Accounts whose health is not `healthy`.
    pub needs_attention: u64,
    /// The active default account.
    pub default_account: Option<AccountId>,
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountPage {
    /// Accounts on this page.
    pub accounts: Vec<AccountView>,
    /// Accounts matching the filter across all pages.
    pub total: u64,
    /// Page number.
    pub page: u32,
    /// Page size.
    pub limit: u32,
    /// Counts over the user's whole account set.
    pub summary: AccountSummary,
}

/// Read side of the account store.
#[derive(Debug, Clone)]
pub struct AccountQuery {
    repository: AccountRepository,
    policy: HealthPolicy,
}

impl AccountQuery {
    /// Creates a query service.
    #[must_use]
    pub const fn new(repository: AccountRepository, policy: HealthPolicy) -> Self {
        Self { repository, policy }
    }

    /// Lists a user's accounts.
    ///
    /// Sorted by last use, most recent first; never-used accounts last,
    /// newest first; ties broken by ID.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an out-of-range page or limit, or a database error.
    pub async fn list(&self, user_id: &UserId, request: ListRequest) -> Result<AccountPage> {
        validate_pagination(request.page, request.limit)?;

        let offset = i64::from(request.page - 1) * i64::from(request.limit);
        let now = Utc::now();
        let accounts = self
            .repository
            .page(user_id, request.filter, i64::from(request.limit), offset)
            .await?
            .into_iter()
            .map(|a| AccountView::new(a, &self.policy, now))
            .collect();

        Ok(AccountPage {
            accounts,
            total: self.repository.count(user_id, request.filter).await?,
            page: request.page,
            limit: request.limit,
            summary: self.summary(user_id).await?,
        })
    }

    /// Counts over all of a user's accounts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn summary(&self, user_id: &UserId) -> Result<AccountSummary> {
        let now = Utc::now();
        let all = self
            .repository
            .page(user_id, AccountFilter::default(), i64::MAX, 0)
            .await?;

        let mut summary = AccountSummary::default();
        for account in &all {
            summary.total += 1;
            if account.is_active {
                summary.active += 1;
                if account.is_default {
                    summary.default_account = Some(account.id);
                }
            } else {
                summary.inactive += 1;
            }
            if self.policy.evaluate(account, now).needs_attention() {
                summary.needs_attention += 1;
            }
        }
        Ok(summary)
    }

    /// Projects an account with this service's health policy.
    #[must_use]
    pub fn view(&self, account: EmailAccount) -> AccountView {
        AccountView::new(account, &self.policy, Utc::now())
    }
}
