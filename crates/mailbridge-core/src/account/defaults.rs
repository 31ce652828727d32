//! Default-account coordination.
//!
//! Every default transition for a user runs under that user's lock and inside
//! one database transaction. The partial unique index on
//! `(user_id) WHERE is_default AND is_active` backs this at the storage level.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use sqlx::Row;
use tracing::info;

use super::model::{AccountId, EmailAccount, UserId};
use super::repository::AccountRepository;
use crate::{Error, Result};

type UserLocks = Arc<Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>>;

/// Maintains the single-default invariant per user.
#[derive(Debug, Clone)]
pub struct DefaultCoordinator {
    repository: AccountRepository,
    locks: UserLocks,
}

/// A caller's handle on one user's lock.
///
/// Dropping the last handle removes the user's entry from the map.
struct UserLock {
    locks: UserLocks,
    user_id: UserId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl UserLock {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for UserLock {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this handle
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.user_id);
        }
    }
}

impl DefaultCoordinator {
    /// Creates a coordinator writing through `repository`.
    #[must_use]
    pub fn new(repository: AccountRepository) -> Self {
        Self {
            repository,
            locks: Arc::default(),
        }
    }

    fn user_lock(&self, user_id: &UserId) -> UserLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        UserLock {
            locks: Arc::clone(&self.locks),
            user_id: user_id.clone(),
            lock: Arc::clone(locks.entry(user_id.clone()).or_default()),
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Makes `id` the user's only default account.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account does not exist, is inactive, or
    /// belongs to another user. Nothing changes in that case.
    pub async fn set_default(&self, user_id: &UserId, id: AccountId) -> Result<EmailAccount> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut tx = self.repository.pool().begin().await?;

        // Clearing first takes the write lock before anything is read
        sqlx::query(
            r"
            UPDATE email_accounts SET is_default = 0
            WHERE user_id = ? AND id != ? AND is_default = 1
            ",
        )
        .bind(user_id.as_str())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        let promoted = sqlx::query(
            r"
            UPDATE email_accounts SET is_default = 1
            WHERE id = ? AND user_id = ? AND is_active = 1
            ",
        )
        .bind(id.to_string())
        .bind(user_id.as_str())
        .execute(&mut *tx)
        .await?;

        if promoted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::account_not_found(id));
        }
        tx.commit().await?;

        info!(account_id = %id, user_id = %user_id, "Set default email account");
        self.repository.get_owned(user_id, id).await
    }

    /// Promotes an account if the user has no active default.
    ///
    /// Picks the most recently used account, then the most recently created.
    /// Returns the current default, or `None` if the user has no active
    /// accounts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn ensure_default(&self, user_id: &UserId) -> Result<Option<EmailAccount>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut tx = self.repository.pool().begin().await?;

        // Inactive accounts never hold the flag
        sqlx::query(
            r"
            UPDATE email_accounts SET is_default = 0
            WHERE user_id = ? AND is_active = 0 AND is_default = 1
            ",
        )
        .bind(user_id.as_str())
        .execute(&mut *tx)
        .await?;

        let current = sqlx::query(
            "SELECT id FROM email_accounts WHERE user_id = ? AND is_active = 1 AND is_default = 1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let (id, promoted) = if let Some(row) = current {
            (row.try_get::<String, _>("id")?, false)
        } else {
            let candidate = sqlx::query(
                r"
                SELECT id FROM email_accounts
                WHERE user_id = ? AND is_active = 1
                ORDER BY last_used IS NULL, last_used DESC, created_at DESC, id ASC
                LIMIT 1
                ",
            )
            .bind(user_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = candidate else {
                tx.commit().await?;
                return Ok(None);
            };
            let id: String = row.try_get("id")?;
            sqlx::query("UPDATE email_accounts SET is_default = 1 WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            (id, true)
        };
        tx.commit().await?;

        let id: AccountId = id
            .parse()
            .map_err(|e| Error::system_with(format!("corrupt account id {id:?}"), e))?;
        if promoted {
            info!(account_id = %id, user_id = %user_id, "Promoted default email account");
        }
        self.repository.get(id).await
    }

    /// Clears the default flag on every account of the user.
    ///
    /// Returns the number of accounts changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn unset_all_defaults(&self, user_id: &UserId) -> Result<u64> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let result = sqlx::query(
            "UPDATE email_accounts SET is_default = 0 WHERE user_id = ? AND is_default = 1",
        )
        .bind(user_id.as_str())
        .execute(self.repository.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
