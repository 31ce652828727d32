//! Account model types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of an email account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Generates a new random account ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of the user owning accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps an external user identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the account authenticates against its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Access/refresh token pair.
    OAuth,
    /// Username and password against SMTP/IMAP servers.
    Smtp,
}

impl ConnectionType {
    /// Stable storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OAuth => "oauth",
            Self::Smtp => "smtp",
        }
    }
}

/// Mailbox provider of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailProvider {
    /// Google Gmail (OAuth).
    Gmail,
    /// Microsoft Outlook / Office 365 (OAuth).
    Outlook,
    /// Yahoo Mail (OAuth).
    Yahoo,
    /// Any server reached with SMTP/IMAP passwords.
    Smtp,
}

impl MailProvider {
    /// Every provider, in display order.
    pub const ALL: [Self; 4] = [Self::Gmail, Self::Outlook, Self::Yahoo, Self::Smtp];

    /// Stable storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
            Self::Yahoo => "yahoo",
            Self::Smtp => "smtp",
        }
    }

    /// Connection type used by accounts of this provider.
    #[must_use]
    pub const fn connection_type(&self) -> ConnectionType {
        match self {
            Self::Gmail | Self::Outlook | Self::Yahoo => ConnectionType::OAuth,
            Self::Smtp => ConnectionType::Smtp,
        }
    }

    /// Returns true if the provider authenticates with `OAuth2`.
    #[must_use]
    pub const fn is_oauth(&self) -> bool {
        matches!(self.connection_type(), ConnectionType::OAuth)
    }
}

impl fmt::Display for MailProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MailProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown provider: {s}"))
    }
}

/// Security/encryption mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// No encryption (not recommended).
    None,
    /// Implicit TLS (connect directly with TLS).
    #[default]
    Tls,
    /// STARTTLS upgrade after plaintext connect.
    StartTls,
}

/// Host, port and transport security of one mail server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    #[serde(default)]
    pub security: Security,
}

impl ServerSettings {
    /// Creates server settings.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, security: Security) -> Self {
        Self {
            host: host.into(),
            port,
            security,
        }
    }

    /// Default SMTP port for the security mode.
    #[must_use]
    pub const fn default_smtp_port(security: Security) -> u16 {
        match security {
            Security::None => 25,
            Security::StartTls => 587,
            Security::Tls => 465,
        }
    }

    /// Default IMAP port for the security mode.
    #[must_use]
    pub const fn default_imap_port(security: Security) -> u16 {
        match security {
            Security::None | Security::StartTls => 143,
            Security::Tls => 993,
        }
    }
}

/// Automatic reply configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoReply {
    /// Whether automatic replies are sent.
    pub enabled: bool,
    /// Subject of the reply.
    #[serde(default)]
    pub subject: Option<String>,
    /// Body of the reply.
    #[serde(default)]
    pub message: String,
}

/// Provider-specific settings of an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSettings {
    /// Outgoing server (SMTP accounts).
    #[serde(default)]
    pub smtp: Option<ServerSettings>,
    /// Incoming server (SMTP accounts).
    #[serde(default)]
    pub imap: Option<ServerSettings>,
    /// Signature appended to outgoing mail.
    #[serde(default)]
    pub signature: Option<String>,
    /// Automatic reply.
    #[serde(default)]
    pub auto_reply: AutoReply,
    /// Additional sender addresses.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl AccountSettings {
    /// Server settings for well-known mail domains.
    ///
    /// Returns `(smtp, imap)` or `None` for unknown domains.
    #[must_use]
    pub fn detect_servers(email: &str) -> Option<(ServerSettings, ServerSettings)> {
        let domain = email.rsplit_once('@')?.1.to_lowercase();
        let (smtp, imap) = match domain.as_str() {
            "gmail.com" | "googlemail.com" => (
                ServerSettings::new("smtp.gmail.com", 465, Security::Tls),
                ServerSettings::new("imap.gmail.com", 993, Security::Tls),
            ),
            "outlook.com" | "hotmail.com" | "live.com" => (
                ServerSettings::new("smtp.office365.com", 587, Security::StartTls),
                ServerSettings::new("outlook.office365.com", 993, Security::Tls),
            ),
            "yahoo.com" | "ymail.com" => (
                ServerSettings::new("smtp.mail.yahoo.com", 465, Security::Tls),
                ServerSettings::new("imap.mail.yahoo.com", 993, Security::Tls),
            ),
            "icloud.com" | "me.com" | "mac.com" => (
                ServerSettings::new("smtp.mail.me.com", 587, Security::StartTls),
                ServerSettings::new("imap.mail.me.com", 993, Security::Tls),
            ),
            _ => return None,
        };
        Some((smtp, imap))
    }
}

/// Last failure recorded against an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable code, if the provider supplied one.
    pub code: Option<String>,
    /// When the failure happened.
    pub at: DateTime<Utc>,
}

/// Decrypted secret material of an account.
///
/// Only produced inside the crate, for provider calls.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `OAuth2` token pair.
    OAuth {
        /// Access token.
        access_token: String,
        /// Refresh token, if the provider issued one.
        refresh_token: Option<String>,
    },
    /// SMTP/IMAP login.
    Password {
        /// Login name.
        username: String,
        /// Password.
        password: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OAuth { refresh_token, .. } => f
                .debug_struct("OAuth")
                .field("has_refresh_token", &refresh_token.is_some())
                .finish_non_exhaustive(),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Sealed secret columns of a stored account.
///
/// Every value is a credential envelope; plaintext never appears here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealedSecrets {
    /// Sealed access token (`OAuth`) or username (SMTP).
    pub primary: Option<String>,
    /// Sealed refresh token (`OAuth`) or password (SMTP).
    pub secondary: Option<String>,
}

/// Stored email account record.
#[derive(Debug, Clone)]
pub struct EmailAccount {
    /// Account identifier.
    pub id: AccountId,
    /// Owning user.
    pub user_id: UserId,
    /// Mailbox address.
    pub email: String,
    /// Display name used as sender name.
    pub display_name: Option<String>,
    /// Provider.
    pub provider: MailProvider,
    /// Connection type.
    pub connection_type: ConnectionType,
    /// Sealed secrets.
    pub(crate) secrets: SealedSecrets,
    /// Access token expiry (`OAuth` only).
    pub token_expiry: Option<DateTime<Utc>>,
    /// Granted scopes (`OAuth` only).
    pub scopes: Vec<String>,
    /// Whether the account may be used.
    pub is_active: bool,
    /// Whether the provider verified the address.
    pub is_verified: bool,
    /// Whether this is the user's default account.
    pub is_default: bool,
    /// Consecutive failures since the last verified success.
    pub error_count: u32,
    /// Last failure.
    pub last_error: Option<LastError>,
    /// Number of messages sent through the account.
    pub emails_sent: u64,
    /// Last time the account was used.
    pub last_used: Option<DateTime<Utc>>,
    /// Last successful sync or connection test.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Provider-specific settings.
    pub settings: AccountSettings,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Data required to store a new account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    /// Owning user.
    pub user_id: UserId,
    /// Mailbox address.
    pub email: String,
    /// Display name.
    pub display_name: Option<String>,
    /// Provider.
    pub provider: MailProvider,
    /// Plaintext credentials; sealed before persistence.
    pub credentials: Credentials,
    /// Access token expiry.
    pub token_expiry: Option<DateTime<Utc>>,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Whether the provider verified the address.
    pub is_verified: bool,
    /// Provider-specific settings.
    pub settings: AccountSettings,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    mod account_id_tests {
        use super::*;

        #[test]
        fn parse_round_trip() {
            let id = AccountId::generate();
            let parsed: AccountId = id.to_string().parse().unwrap();
            assert_eq!(id, parsed);
        }

        #[test]
        fn rejects_garbage() {
            assert!("not-an-id".parse::<AccountId>().is_err());
        }
    }

    mod provider_tests {
        use super::*;

        #[test]
        fn connection_types() {
            assert_eq!(MailProvider::Gmail.connection_type(), ConnectionType::OAuth);
            assert_eq!(MailProvider::Outlook.connection_type(), ConnectionType::OAuth);
            assert_eq!(MailProvider::Smtp.connection_type(), ConnectionType::Smtp);
            assert!(!MailProvider::Smtp.is_oauth());
        }

        #[test]
        fn parse_names() {
            assert_eq!("GMAIL".parse::<MailProvider>().unwrap(), MailProvider::Gmail);
            assert_eq!("yahoo".parse::<MailProvider>().unwrap(), MailProvider::Yahoo);
            assert!("aol".parse::<MailProvider>().is_err());
        }
    }

    mod server_settings_tests {
        use super::*;

        #[test]
        fn default_ports() {
            assert_eq!(ServerSettings::default_smtp_port(Security::Tls), 465);
            assert_eq!(ServerSettings::default_smtp_port(Security::StartTls), 587);
            assert_eq!(ServerSettings::default_smtp_port(Security::None), 25);
            assert_eq!(ServerSettings::default_imap_port(Security::Tls), 993);
            assert_eq!(ServerSettings::default_imap_port(Security::StartTls), 143);
        }

        #[test]
        fn detect_well_known_domains() {
            let (smtp, imap) = AccountSettings::detect_servers("user@gmail.com").unwrap();
            assert_eq!(smtp.host, "smtp.gmail.com");
            assert_eq!(imap.port, 993);

            let (smtp, _) = AccountSettings::detect_servers("user@Hotmail.com").unwrap();
            assert_eq!(smtp.security, Security::StartTls);

            let (smtp, _) = AccountSettings::detect_servers("user@me.com").unwrap();
            assert_eq!(smtp.host, "smtp.mail.me.com");
        }

        #[test]
        fn unknown_domain() {
            assert!(AccountSettings::detect_servers("user@example.org").is_none());
            assert!(AccountSettings::detect_servers("no-at-sign").is_none());
        }
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: AccountSettings =
            serde_json::from_str(r#"{"signature":"-- sent from mailbridge"}"#).unwrap();
        assert!(settings.smtp.is_none());
        assert!(!settings.auto_reply.enabled);
        assert!(settings.aliases.is_empty());
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::Password {
            username: "user".into(),
            password: "p4ssw0rd".into(),
        };
        assert!(!format!("{creds:?}").contains("p4ssw0rd"));

        let creds = Credentials::OAuth {
            access_token: "ya29.secret".into(),
            refresh_token: Some("1//refresh".into()),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("ya29"));
        assert!(!debug.contains("1//refresh"));
    }
}
