//! Runtime configuration.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use mailbridge_oauth::OAuthClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::account::{EncryptionKey, HealthPolicy, MailProvider, ValidationError};
use crate::provider::OAuthClients;
use crate::{Error, Result};

const ENV_PREFIX: &str = "MAILBRIDGE_";

/// `OAuth2` client registration for one provider.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthRegistration {
    /// Client ID.
    pub client_id: String,
    /// Client secret, for confidential clients.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Redirect URI of the consent flow.
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

impl fmt::Debug for OAuthRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthRegistration")
            .field("client_id", &self.client_id)
            .field("has_client_secret", &self.client_secret.is_some())
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Lifecycle manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `SQLite` database file.
    pub database_path: String,
    /// Consecutive failures that deactivate an account.
    pub max_error_count: u32,
    /// Failures at which health turns from `warning` to `errors`.
    pub warning_error_count: u32,
    /// Tokens expiring within this window are refreshed.
    #[serde(with = "seconds")]
    pub refresh_lookahead: Duration,
    /// Bound on every provider call.
    #[serde(with = "seconds")]
    pub provider_timeout: Duration,
    /// `OAuth2` clients by provider.
    pub oauth: HashMap<MailProvider, OAuthRegistration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "mailbridge.db".into(),
            max_error_count: 10,
            warning_error_count: 5,
            refresh_lookahead: Duration::from_secs(30 * 60),
            provider_timeout: Duration::from_secs(30),
            oauth: HashMap::new(),
        }
    }
}

impl Config {
    /// Parses a JSON document; missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or the thresholds are invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `MAILBRIDGE_*` environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the thresholds are invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| var(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = get("DATABASE_PATH") {
            config.database_path = path;
        }
        if let Some(value) = get("MAX_ERROR_COUNT") {
            config.max_error_count = parse_number("MAX_ERROR_COUNT", &value)?;
        }
        if let Some(value) = get("WARNING_ERROR_COUNT") {
            config.warning_error_count = parse_number("WARNING_ERROR_COUNT", &value)?;
        }
        if let Some(value) = get("REFRESH_LOOKAHEAD_SECS") {
            config.refresh_lookahead =
                Duration::from_secs(parse_number("REFRESH_LOOKAHEAD_SECS", &value)?);
        }
        if let Some(value) = get("PROVIDER_TIMEOUT_SECS") {
            config.provider_timeout =
                Duration::from_secs(parse_number("PROVIDER_TIMEOUT_SECS", &value)?);
        }

        for provider in MailProvider::ALL.into_iter().filter(MailProvider::is_oauth) {
            let name = provider.as_str().to_uppercase();
            if let Some(client_id) = get(&format!("{name}_CLIENT_ID")) {
                config.oauth.insert(
                    provider,
                    OAuthRegistration {
                        client_id,
                        client_secret: get(&format!("{name}_CLIENT_SECRET")),
                        redirect_uri: get(&format!("{name}_REDIRECT_URI")),
                    },
                );
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the error thresholds.
    ///
    /// # Errors
    ///
    /// Returns `Validation` unless `1 <= warning_error_count <= max_error_count`.
    pub fn validate(&self) -> Result<()> {
        if self.max_error_count == 0
            || self.warning_error_count == 0
            || self.warning_error_count > self.max_error_count
        {
            return Err(ValidationError::InvalidErrorThreshold.into());
        }
        Ok(())
    }

    /// Health thresholds derived from this configuration.
    #[must_use]
    pub const fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            errors_threshold: self.warning_error_count,
            max_errors: self.max_error_count,
        }
    }

    /// Builds `OAuth2` clients for every registered provider.
    ///
    /// # Errors
    ///
    /// Returns a system error if a registration targets a password provider
    /// or a client cannot be built.
    pub fn oauth_clients(&self) -> Result<OAuthClients> {
        let mut clients = OAuthClients::new();
        for (&provider, registration) in &self.oauth {
            let preset = OAuthClients::preset(provider)
                .map_err(|e| Error::system_with("invalid provider preset", e))?
                .ok_or_else(|| Error::system(format!("{provider} does not use OAuth")))?;

            let mut client = OAuthClient::new(registration.client_id.clone(), preset)
                .and_then(|c| c.with_timeout(self.provider_timeout))
                .map_err(|e| {
                    Error::system_with(format!("cannot build {provider} OAuth client"), e)
                })?;
            if let Some(secret) = &registration.client_secret {
                client = client.with_client_secret(secret.clone());
            }
            if let Some(uri) = &registration.redirect_uri {
                client = client.with_redirect_uri(uri.clone());
            }

            debug!(%provider, "Registered OAuth client");
            clients = clients.with_client(provider, client);
        }
        Ok(clients)
    }
}

/// Loads the master key from `MAILBRIDGE_ENCRYPTION_KEY` or the OS keyring.
///
/// Returns `Ok(None)` if neither holds a key.
///
/// # Errors
///
/// Returns a system error if the configured key is malformed or the keyring
/// cannot be read.
pub fn load_encryption_key() -> Result<Option<EncryptionKey>> {
    if let Some(hex) = std::env::var(format!("{ENV_PREFIX}ENCRYPTION_KEY"))
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        return Ok(Some(EncryptionKey::from_hex(hex.trim())?));
    }
    Ok(EncryptionKey::load_from_keyring()?)
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::system_with(format!("invalid {ENV_PREFIX}{name}: {value:?}"), e))
}

/// Serde helpers for durations stored as whole seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)] // Required by serde with= signature
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
