//! Account health bookkeeping.
//!
//! Health is derived on every read from `is_active`, `error_count` and
//! `token_expiry`; only the counter and the last error are stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::model::{AccountId, ConnectionType, EmailAccount, LastError};
use super::repository::{AccountRepository, ErrorRecord};
use crate::Result;

/// Derived usability of an account, in evaluation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Deactivated; excluded from use.
    Inactive,
    /// At or above the deactivation threshold.
    Critical,
    /// Repeated failures.
    Errors,
    /// Access token is past its expiry.
    TokenExpired,
    /// Some recent failures.
    Warning,
    /// No recorded failures.
    Healthy,
}

impl HealthStatus {
    /// Returns true unless the account is healthy.
    #[must_use]
    pub const fn needs_attention(&self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

/// Error-count thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// First count in the `errors` band.
    pub errors_threshold: u32,
    /// Count at which the account is deactivated.
    pub max_errors: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            errors_threshold: 5,
            max_errors: 10,
        }
    }
}

impl HealthPolicy {
    /// Classifies an account at time `now`.
    #[must_use]
    pub fn evaluate(&self, account: &EmailAccount, now: DateTime<Utc>) -> HealthStatus {
        let token_expired = account.connection_type == ConnectionType::OAuth
            && account.token_expiry.is_some_and(|exp| exp <= now);

        if !account.is_active {
            HealthStatus::Inactive
        } else if account.error_count >= self.max_errors {
            HealthStatus::Critical
        } else if account.error_count >= self.errors_threshold {
            HealthStatus::Errors
        } else if token_expired {
            HealthStatus::TokenExpired
        } else if account.error_count > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Records failures and verified successes against accounts.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    repository: AccountRepository,
    policy: HealthPolicy,
}

impl HealthTracker {
    /// Creates a tracker writing through `repository`.
    #[must_use]
    pub const fn new(repository: AccountRepository, policy: HealthPolicy) -> Self {
        Self { repository, policy }
    }

    /// Thresholds in use.
    #[must_use]
    pub const fn policy(&self) -> HealthPolicy {
        self.policy
    }

    /// Increments the error counter and stores the failure.
    ///
    /// Reaching `max_errors` deactivates the account in the same update.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account does not exist, or a database error.
    pub async fn record_error(
        &self,
        id: AccountId,
        message: impl Into<String>,
        code: Option<&str>,
    ) -> Result<ErrorRecord> {
        let error = LastError {
            message: message.into(),
            code: code.map(ToString::to_string),
            at: Utc::now(),
        };
        let record = self
            .repository
            .increment_errors(id, &error, self.policy.max_errors)
            .await?;

        if record.deactivated {
            warn!(
                account_id = %id,
                error_count = record.error_count,
                "Account deactivated after repeated failures"
            );
        } else {
            debug!(account_id = %id, error_count = record.error_count, "Recorded account error");
        }
        Ok(record)
    }

    /// Resets the counter, clears the last error and re-activates the account.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account does not exist, or a database error.
    pub async fn clear_errors(&self, id: AccountId) -> Result<()> {
        self.repository.reset_errors(id).await?;
        debug!(account_id = %id, "Cleared account errors");
        Ok(())
    }
}
