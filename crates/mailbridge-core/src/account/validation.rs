//! Input validation.

use super::model::{AccountSettings, ServerSettings};

/// Longest accepted signature, in characters.
const MAX_SIGNATURE_CHARS: usize = 10_000;

/// Longest accepted display name, in characters.
const MAX_DISPLAY_NAME_CHARS: usize = 200;

/// Largest page size accepted by account listings.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Validation error for caller input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Email address is empty.
    EmptyEmail,
    /// Email address format is invalid.
    InvalidEmail,
    /// Display name is too long.
    DisplayNameTooLong,
    /// SMTP host is empty.
    EmptySmtpHost,
    /// SMTP port is invalid.
    InvalidSmtpPort,
    /// IMAP host is empty.
    EmptyImapHost,
    /// IMAP port is invalid.
    InvalidImapPort,
    /// Login username is empty.
    EmptyUsername,
    /// Login password is empty.
    EmptyPassword,
    /// Authorization code is empty.
    EmptyAuthorizationCode,
    /// Provider cannot be used for the requested connection type.
    UnsupportedProvider,
    /// An alias is not a valid email address.
    InvalidAlias,
    /// Signature exceeds the length limit.
    SignatureTooLong,
    /// Auto-reply is enabled without a message.
    EmptyAutoReplyMessage,
    /// Page number is zero.
    InvalidPage,
    /// Page size outside 1-100.
    InvalidLimit,
    /// Error threshold must be positive.
    InvalidErrorThreshold,
}

impl ValidationError {
    /// Get human-readable error message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::EmptyEmail => "Email address is required",
            Self::InvalidEmail => "Invalid email address format",
            Self::DisplayNameTooLong => "Display name must be at most 200 characters",
            Self::EmptySmtpHost => "SMTP server is required",
            Self::InvalidSmtpPort => "SMTP port must be 1-65535",
            Self::EmptyImapHost => "IMAP server is required",
            Self::InvalidImapPort => "IMAP port must be 1-65535",
            Self::EmptyUsername => "Username is required",
            Self::EmptyPassword => "Password is required",
            Self::EmptyAuthorizationCode => "Authorization code is required",
            Self::UnsupportedProvider => "Provider does not support this connection type",
            Self::InvalidAlias => "Aliases must be valid email addresses",
            Self::SignatureTooLong => "Signature must be at most 10000 characters",
            Self::EmptyAutoReplyMessage => {
                "Auto-reply message is required when auto-reply is enabled"
            }
            Self::InvalidPage => "Page must be 1 or greater",
            Self::InvalidLimit => "Limit must be between 1 and 100",
            Self::InvalidErrorThreshold => "Error threshold must be at least 1",
        }
    }

    /// Get the field name this error relates to.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::EmptyEmail | Self::InvalidEmail => "email",
            Self::DisplayNameTooLong => "display_name",
            Self::EmptySmtpHost => "smtp_host",
            Self::InvalidSmtpPort => "smtp_port",
            Self::EmptyImapHost => "imap_host",
            Self::InvalidImapPort => "imap_port",
            Self::EmptyUsername => "username",
            Self::EmptyPassword => "password",
            Self::EmptyAuthorizationCode => "code",
            Self::UnsupportedProvider => "provider",
            Self::InvalidAlias => "aliases",
            Self::SignatureTooLong => "signature",
            Self::EmptyAutoReplyMessage => "auto_reply",
            Self::InvalidPage => "page",
            Self::InvalidLimit => "limit",
            Self::InvalidErrorThreshold => "max_errors",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ValidationError {}

/// Result of validating an input.
pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// An SMTP/IMAP account submitted by a user.
#[derive(Clone, Default)]
pub struct SmtpSubmission {
    /// Mailbox address.
    pub email: String,
    /// Display name.
    pub display_name: Option<String>,
    /// Login name (defaults to the address when empty).
    pub username: String,
    /// Login password.
    pub password: String,
    /// Outgoing server; detected from the domain when `None`.
    pub smtp: Option<ServerSettings>,
    /// Incoming server; detected from the domain when `None`.
    pub imap: Option<ServerSettings>,
    /// Skip the IMAP probe (send-only accounts).
    pub skip_imap_test: bool,
}

impl std::fmt::Debug for SmtpSubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSubmission")
            .field("email", &self.email)
            .field("username", &self.username)
            .field("smtp", &self.smtp)
            .field("imap", &self.imap)
            .field("skip_imap_test", &self.skip_imap_test)
            .finish_non_exhaustive()
    }
}

impl SmtpSubmission {
    /// Fills server settings and username from well-known domains.
    #[must_use]
    pub fn with_detected_servers(mut self) -> Self {
        if let Some((smtp, imap)) = AccountSettings::detect_servers(&self.email) {
            self.smtp.get_or_insert(smtp);
            self.imap.get_or_insert(imap);
        }
        if self.username.trim().is_empty() {
            self.username = normalize_email(&self.email);
        }
        self
    }
}

/// Validate an SMTP/IMAP submission.
///
/// Returns `Ok(())` if valid, or `Err(Vec<ValidationError>)` with all errors.
///
/// # Errors
///
/// Returns a vector of `ValidationError` if any fields are invalid.
pub fn validate_smtp_submission(submission: &SmtpSubmission) -> ValidationResult {
    let mut errors = Vec::new();

    check_email(&submission.email, &mut errors);
    check_display_name(submission.display_name.as_deref(), &mut errors);

    if submission.username.trim().is_empty() {
        errors.push(ValidationError::EmptyUsername);
    }
    if submission.password.is_empty() {
        errors.push(ValidationError::EmptyPassword);
    }

    match &submission.smtp {
        Some(smtp) => check_server(
            smtp,
            ValidationError::EmptySmtpHost,
            ValidationError::InvalidSmtpPort,
            &mut errors,
        ),
        None => errors.push(ValidationError::EmptySmtpHost),
    }

    match &submission.imap {
        Some(imap) => check_server(
            imap,
            ValidationError::EmptyImapHost,
            ValidationError::InvalidImapPort,
            &mut errors,
        ),
        None if !submission.skip_imap_test => errors.push(ValidationError::EmptyImapHost),
        None => {}
    }

    finish(errors)
}

/// Validate settings supplied in an update.
///
/// # Errors
///
/// Returns a vector of `ValidationError` if any fields are invalid.
pub fn validate_settings(
    settings: &AccountSettings,
    display_name: Option<&str>,
) -> ValidationResult {
    let mut errors = Vec::new();

    check_display_name(display_name, &mut errors);

    if let Some(smtp) = &settings.smtp {
        check_server(
            smtp,
            ValidationError::EmptySmtpHost,
            ValidationError::InvalidSmtpPort,
            &mut errors,
        );
    }
    if let Some(imap) = &settings.imap {
        check_server(
            imap,
            ValidationError::EmptyImapHost,
            ValidationError::InvalidImapPort,
            &mut errors,
        );
    }
    if settings
        .signature
        .as_deref()
        .is_some_and(|s| s.chars().count() > MAX_SIGNATURE_CHARS)
    {
        errors.push(ValidationError::SignatureTooLong);
    }
    if settings.auto_reply.enabled && settings.auto_reply.message.trim().is_empty() {
        errors.push(ValidationError::EmptyAutoReplyMessage);
    }
    if settings.aliases.iter().any(|alias| !is_valid_email(alias)) {
        errors.push(ValidationError::InvalidAlias);
    }

    finish(errors)
}

/// Validate listing pagination.
///
/// # Errors
///
/// Returns a vector of `ValidationError` if page or limit is out of range.
pub fn validate_pagination(page: u32, limit: u32) -> ValidationResult {
    let mut errors = Vec::new();
    if page == 0 {
        errors.push(ValidationError::InvalidPage);
    }
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        errors.push(ValidationError::InvalidLimit);
    }
    finish(errors)
}

/// Canonical form of an address used for uniqueness checks.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn finish(errors: Vec<ValidationError>) -> ValidationResult {
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_email(email: &str, errors: &mut Vec<ValidationError>) {
    if email.trim().is_empty() {
        errors.push(ValidationError::EmptyEmail);
    } else if !is_valid_email(email) {
        errors.push(ValidationError::InvalidEmail);
    }
}

fn check_display_name(display_name: Option<&str>, errors: &mut Vec<ValidationError>) {
    if display_name.is_some_and(|n| n.chars().count() > MAX_DISPLAY_NAME_CHARS) {
        errors.push(ValidationError::DisplayNameTooLong);
    }
}

fn check_server(
    server: &ServerSettings,
    empty_host: ValidationError,
    bad_port: ValidationError,
    errors: &mut Vec<ValidationError>,
) {
    if server.host.trim().is_empty() {
        errors.push(empty_host);
    }
    if server.port == 0 {
        errors.push(bad_port);
    }
}

/// Basic email validation.
pub(crate) fn is_valid_email(email: &str) -> bool {
    let email = email.trim();

    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    if local.is_empty() || domain.contains('@') || email.contains(char::is_whitespace) {
        return false;
    }

    // Domain must contain at least one dot and no empty labels
    domain.contains('.') && domain.split('.').all(|p| !p.is_empty())
}
