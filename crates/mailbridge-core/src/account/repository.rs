//! Account storage repository.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use super::credentials::CredentialCipher;
use super::model::{
    AccountId, AccountSettings, ConnectionType, Credentials, EmailAccount, LastError, MailProvider,
    NewAccount, SealedSecrets, UserId,
};
use super::validation::normalize_email;
use crate::{Error, Result};

const COLUMNS: &str = "id, user_id, email, display_name, provider, connection_type, \
     primary_secret, secondary_secret, token_expiry, scopes, is_active, is_verified, is_default, \
     error_count, last_error_message, last_error_code, last_error_at, emails_sent, last_used, \
     last_sync_at, settings, created_at, updated_at";

/// Listing filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountFilter {
    /// Only active (`true`) or inactive (`false`) accounts.
    pub is_active: Option<bool>,
    /// Only accounts of this provider.
    pub provider: Option<MailProvider>,
}

/// Outcome of an atomic error-counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Counter value after the increment.
    pub error_count: u32,
    /// Whether this increment crossed the deactivation threshold.
    pub deactivated: bool,
}

/// Repository for account storage and retrieval.
///
/// Secret material is sealed with the [`CredentialCipher`] before it reaches
/// the database. Reads return records whose secrets are still sealed;
/// [`AccountRepository::credentials`] is the only way to open them.
#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
    cipher: CredentialCipher,
}

impl AccountRepository {
    /// Create a new repository with the given database path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str, cipher: CredentialCipher) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let repo = Self { pool, cipher };
        repo.initialize().await?;
        Ok(repo)
    }

    /// Create an in-memory repository for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory(cipher: CredentialCipher) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let repo = Self { pool, cipher };
        repo.initialize().await?;
        Ok(repo)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS email_accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                email TEXT NOT NULL,
                display_name TEXT,
                provider TEXT NOT NULL,
                connection_type TEXT NOT NULL,
                primary_secret TEXT,
                secondary_secret TEXT,
                token_expiry TEXT,
                scopes TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                is_verified INTEGER NOT NULL DEFAULT 0,
                is_default INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                last_error_message TEXT,
                last_error_code TEXT,
                last_error_at TEXT,
                emails_sent INTEGER NOT NULL DEFAULT 0,
                last_used TEXT,
                last_sync_at TEXT,
                settings TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, email)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        // At most one active default per user, enforced by the engine as well
        sqlx::query(
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_email_accounts_single_default
            ON email_accounts(user_id) WHERE is_default = 1 AND is_active = 1
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_email_accounts_user_last_used
            ON email_accounts(user_id, last_used)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(crate) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Store a new account.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the user already has an account with this address,
    /// or an error if sealing or the insert fails.
    pub async fn create(&self, new: NewAccount) -> Result<EmailAccount> {
        let email = normalize_email(&new.email);
        if self.find_by_user_and_email(&new.user_id, &email).await?.is_some() {
            return Err(duplicate(&email));
        }

        let id = AccountId::generate();
        let secrets = self.seal(&id, &new.credentials)?;
        let now = Utc::now();

        let result = sqlx::query(
            r"
            INSERT INTO email_accounts (
                id, user_id, email, display_name, provider, connection_type,
                primary_secret, secondary_secret, token_expiry, scopes,
                is_active, is_verified, is_default, settings, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, 0, ?, ?, ?)
            ",
        )
        .bind(id.to_string())
        .bind(new.user_id.as_str())
        .bind(&email)
        .bind(&new.display_name)
        .bind(new.provider.as_str())
        .bind(new.provider.connection_type().as_str())
        .bind(&secrets.primary)
        .bind(&secrets.secondary)
        .bind(new.token_expiry.map(encode_ts))
        .bind(serde_json::to_string(&new.scopes)?)
        .bind(new.is_verified)
        .bind(serde_json::to_string(&new.settings)?)
        .bind(encode_ts(now))
        .bind(encode_ts(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            // Lost a race against a concurrent create for the same address
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(duplicate(&email));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            account_id = %id,
            user_id = %new.user_id,
            provider = %new.provider,
            "Stored email account"
        );
        self.get(id)
            .await?
            .ok_or_else(|| Error::system("account vanished after insert"))
    }

    /// Get account by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: AccountId) -> Result<Option<EmailAccount>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM email_accounts WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    /// Get an account owned by `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account does not exist or belongs to another user.
    pub async fn get_owned(&self, user_id: &UserId, id: AccountId) -> Result<EmailAccount> {
        match self.get(id).await? {
            Some(account) if &account.user_id == user_id => Ok(account),
            _ => Err(Error::account_not_found(id)),
        }
    }

    /// Find a user's account by address.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_by_user_and_email(
        &self,
        user_id: &UserId,
        email: &str,
    ) -> Result<Option<EmailAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM email_accounts WHERE user_id = ? AND email = ?"
        ))
        .bind(user_id.as_str())
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    /// Active accounts of a user, most recently used first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_active_by_user(&self, user_id: &UserId) -> Result<Vec<EmailAccount>> {
        self.page(
            user_id,
            AccountFilter {
                is_active: Some(true),
                provider: None,
            },
            i64::MAX,
            0,
        )
        .await
    }

    /// Filtered page of a user's accounts.
    ///
    /// Ordered by `last_used` descending (never-used last), then newest
    /// first, then by ID, so pages are reproducible.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn page(
        &self,
        user_id: &UserId,
        filter: AccountFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<EmailAccount>> {
        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM email_accounts"));
        push_filter(&mut query, user_id, filter);
        query
            .push(" ORDER BY last_used IS NULL, last_used DESC, created_at DESC, id ASC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_account).collect()
    }

    /// Number of a user's accounts matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self, user_id: &UserId, filter: AccountFilter) -> Result<u64> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS n FROM email_accounts");
        push_filter(&mut query, user_id, filter);
        let n: i64 = query.build().fetch_one(&self.pool).await?.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    /// Replace an account's settings and display name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing or not owned by `user_id`.
    pub async fn update_settings(
        &self,
        user_id: &UserId,
        id: AccountId,
        display_name: Option<&str>,
        settings: &AccountSettings,
    ) -> Result<EmailAccount> {
        let result = sqlx::query(
            r"
            UPDATE email_accounts
            SET settings = ?, display_name = COALESCE(?, display_name), updated_at = ?
            WHERE id = ? AND user_id = ?
            ",
        )
        .bind(serde_json::to_string(settings)?)
        .bind(display_name)
        .bind(encode_ts(Utc::now()))
        .bind(id.to_string())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::account_not_found(id));
        }
        debug!(account_id = %id, "Updated account settings");
        self.get_owned(user_id, id).await
    }

    /// Hard-delete an account.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing or not owned by `user_id`.
    pub async fn delete(&self, user_id: &UserId, id: AccountId) -> Result<()> {
        let result = sqlx::query("DELETE FROM email_accounts WHERE id = ? AND user_id = ?")
            .bind(id.to_string())
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::account_not_found(id));
        }
        info!(account_id = %id, user_id = %user_id, "Deleted email account");
        Ok(())
    }

    /// Opens the sealed secrets of an account.
    ///
    /// # Errors
    ///
    /// Returns a system error wrapping the `CryptoError` if an envelope does
    /// not authenticate, or if a required secret is missing.
    pub(crate) fn credentials(&self, account: &EmailAccount) -> Result<Credentials> {
        let open = |sealed: Option<&String>| -> Result<Option<String>> {
            sealed
                .map(|value| self.cipher.decrypt(&account.id, value))
                .transpose()
                .map_err(Error::from)
        };
        let primary = open(account.secrets.primary.as_ref())?.ok_or_else(|| {
            Error::system(format!("account {} has no stored credentials", account.id))
        })?;
        let secondary = open(account.secrets.secondary.as_ref())?;

        Ok(match account.connection_type {
            ConnectionType::OAuth => Credentials::OAuth {
                access_token: primary,
                refresh_token: secondary,
            },
            ConnectionType::Smtp => Credentials::Password {
                username: primary,
                password: secondary.ok_or_else(|| {
                    Error::system(format!("account {} has no stored password", account.id))
                })?,
            },
        })
    }

    /// Stores refreshed tokens and the new expiry.
    ///
    /// The refresh token is kept when `refresh_token` is `None`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing, or a sealing/database error.
    pub(crate) async fn store_tokens(
        &self,
        id: AccountId,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: DateTime<Utc>,
    ) -> Result<()> {
        let access = self.cipher.encrypt(&id, access_token)?;
        let refresh = refresh_token
            .map(|t| self.cipher.encrypt(&id, t))
            .transpose()?;

        let result = sqlx::query(
            r"
            UPDATE email_accounts
            SET primary_secret = ?, secondary_secret = COALESCE(?, secondary_secret),
                token_expiry = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(access)
        .bind(refresh)
        .bind(encode_ts(token_expiry))
        .bind(encode_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::account_not_found(id));
        }
        Ok(())
    }

    /// Atomically increments the error counter.
    ///
    /// Reaching `max_errors` clears `is_active` and `is_default` in the same
    /// statement.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing, or a database error.
    pub(crate) async fn increment_errors(
        &self,
        id: AccountId,
        error: &LastError,
        max_errors: u32,
    ) -> Result<ErrorRecord> {
        let row = sqlx::query(
            r"
            UPDATE email_accounts
            SET error_count = error_count + 1,
                last_error_message = ?, last_error_code = ?, last_error_at = ?,
                is_active = CASE WHEN error_count + 1 >= ? THEN 0 ELSE is_active END,
                is_default = CASE WHEN error_count + 1 >= ? THEN 0 ELSE is_default END,
                updated_at = ?
            WHERE id = ?
            RETURNING error_count
            ",
        )
        .bind(&error.message)
        .bind(&error.code)
        .bind(encode_ts(error.at))
        .bind(i64::from(max_errors))
        .bind(i64::from(max_errors))
        .bind(encode_ts(Utc::now()))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::account_not_found(id))?;

        let error_count = to_u32(row.try_get("error_count")?);
        Ok(ErrorRecord {
            error_count,
            deactivated: error_count == max_errors,
        })
    }

    /// Resets the error counter and re-activates the account.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing, or a database error.
    pub(crate) async fn reset_errors(&self, id: AccountId) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE email_accounts
            SET error_count = 0,
                last_error_message = NULL, last_error_code = NULL, last_error_at = NULL,
                is_default = CASE WHEN is_active = 0 THEN 0 ELSE is_default END,
                is_active = 1,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(encode_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::account_not_found(id));
        }
        Ok(())
    }

    /// Counts one sent message and stamps `last_used`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is missing, inactive or not owned by `user_id`.
    pub async fn record_usage(&self, user_id: &UserId, id: AccountId) -> Result<EmailAccount> {
        let now = encode_ts(Utc::now());
        let result = sqlx::query(
            r"
            UPDATE email_accounts
            SET emails_sent = emails_sent + 1, last_used = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND is_active = 1
            ",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::account_not_found(id));
        }
        self.get_owned(user_id, id).await
    }

    /// Stamps `last_used` and `last_sync_at` after a verified connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub(crate) async fn touch_sync(&self, id: AccountId, at: DateTime<Utc>) -> Result<()> {
        let at = encode_ts(at);
        sqlx::query(
            r"
            UPDATE email_accounts SET last_used = ?, last_sync_at = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&at)
        .bind(&at)
        .bind(&at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hard-deletes inactive accounts with at least `max_errors` failures.
    ///
    /// Returns the owners of the removed accounts, one entry per account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_failed(&self, max_errors: u32) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            r"
            DELETE FROM email_accounts
            WHERE is_active = 0 AND error_count >= ?
            RETURNING user_id
            ",
        )
        .bind(i64::from(max_errors))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(UserId::new(row.try_get::<String, _>("user_id")?)))
            .collect()
    }

    fn seal(&self, id: &AccountId, credentials: &Credentials) -> Result<SealedSecrets> {
        let (primary, secondary) = match credentials {
            Credentials::OAuth {
                access_token,
                refresh_token,
            } => (access_token.as_str(), refresh_token.as_deref()),
            Credentials::Password { username, password } => {
                (username.as_str(), Some(password.as_str()))
            }
        };

        Ok(SealedSecrets {
            primary: Some(self.cipher.encrypt(id, primary)?),
            secondary: secondary.map(|s| self.cipher.encrypt(id, s)).transpose()?,
        })
    }
}

fn duplicate(email: &str) -> Error {
    Error::Conflict(format!("email account {email} is already connected"))
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, user_id: &UserId, filter: AccountFilter) {
    query
        .push(" WHERE user_id = ")
        .push_bind(user_id.as_str().to_string());
    if let Some(active) = filter.is_active {
        query.push(" AND is_active = ").push_bind(active);
    }
    if let Some(provider) = filter.provider {
        query.push(" AND provider = ").push_bind(provider.as_str());
    }
}

/// Fixed-width UTC timestamps, so text order is chronological order.
pub(crate) fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::system_with(format!("corrupt timestamp {value:?}"), e))
}

fn decode_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(decode_ts).transpose()
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Convert a database row to an account record.
fn row_to_account(row: &SqliteRow) -> Result<EmailAccount> {
    let id: String = row.try_get("id")?;
    let provider: String = row.try_get("provider")?;
    let provider: MailProvider = provider.parse().map_err(Error::system)?;
    let connection_type = match row.try_get::<String, _>("connection_type")?.as_str() {
        "oauth" => ConnectionType::OAuth,
        "smtp" => ConnectionType::Smtp,
        other => {
            return Err(Error::system(format!(
                "account {id} has unknown connection type {other:?}"
            )));
        }
    };

    let last_error = match row.try_get::<Option<String>, _>("last_error_message")? {
        Some(message) => Some(LastError {
            message,
            code: row.try_get("last_error_code")?,
            at: decode_opt_ts(row.try_get("last_error_at")?)?.ok_or_else(|| {
                Error::system(format!("account {id} has an error without a timestamp"))
            })?,
        }),
        None => None,
    };

    let scopes: String = row.try_get("scopes")?;
    let settings: String = row.try_get("settings")?;

    Ok(EmailAccount {
        id: id
            .parse()
            .map_err(|e| Error::system_with(format!("corrupt account id {id:?}"), e))?,
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        provider,
        connection_type,
        secrets: SealedSecrets {
            primary: row.try_get("primary_secret")?,
            secondary: row.try_get("secondary_secret")?,
        },
        token_expiry: decode_opt_ts(row.try_get("token_expiry")?)?,
        scopes: serde_json::from_str(&scopes)?,
        is_active: row.try_get("is_active")?,
        is_verified: row.try_get("is_verified")?,
        is_default: row.try_get("is_default")?,
        error_count: to_u32(row.try_get("error_count")?),
        last_error,
        emails_sent: u64::try_from(row.try_get::<i64, _>("emails_sent")?).unwrap_or_default(),
        last_used: decode_opt_ts(row.try_get("last_used")?)?,
        last_sync_at: decode_opt_ts(row.try_get("last_sync_at")?)?,
        settings: serde_json::from_str(&settings)?,
        created_at: decode_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: decode_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}
