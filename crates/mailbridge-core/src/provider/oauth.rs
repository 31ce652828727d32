//! [`OAuthProvider`] backed by registered `mailbridge-oauth` clients.

use std::collections::HashMap;

use async_trait::async_trait;
use mailbridge_oauth::{OAuthClient, Provider, Token};
use tracing::debug;
use url::Url;

use super::{Identity, OAuthProvider, ProviderError, TokenGrant};
use crate::account::MailProvider;

/// `OAuth2` clients keyed by mail provider.
#[derive(Debug, Clone, Default)]
pub struct OAuthClients {
    clients: HashMap<MailProvider, OAuthClient>,
}

impl OAuthClients {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the client used for `provider`.
    #[must_use]
    pub fn with_client(mut self, provider: MailProvider, client: OAuthClient) -> Self {
        self.clients.insert(provider, client);
        self
    }

    /// Endpoint preset for an `OAuth` mail provider.
    ///
    /// Returns `Ok(None)` for password-based providers.
    ///
    /// # Errors
    ///
    /// Returns an error if a preset URL fails to parse.
    pub fn preset(provider: MailProvider) -> mailbridge_oauth::Result<Option<Provider>> {
        Ok(match provider {
            MailProvider::Gmail => Some(Provider::google()?),
            MailProvider::Outlook => Some(Provider::microsoft()?),
            MailProvider::Yahoo => Some(Provider::yahoo()?),
            MailProvider::Smtp => None,
        })
    }

    /// Providers with a registered client.
    pub fn providers(&self) -> impl Iterator<Item = MailProvider> + '_ {
        self.clients.keys().copied()
    }

    /// Consent URL for connecting or reconnecting an account.
    ///
    /// # Errors
    ///
    /// Returns an error if no client is registered for `provider` or it has
    /// no redirect URI.
    pub fn authorization_url(
        &self,
        provider: MailProvider,
        state: &str,
    ) -> Result<Url, ProviderError> {
        self.client(provider)?
            .authorization_url(None, state)
            .map_err(classify)
    }

    fn client(&self, provider: MailProvider) -> Result<&OAuthClient, ProviderError> {
        self.clients.get(&provider).ok_or_else(|| {
            ProviderError::Transient(format!("no OAuth client registered for {provider}"))
        })
    }
}

#[async_trait]
impl OAuthProvider for OAuthClients {
    async fn exchange_code(
        &self,
        provider: MailProvider,
        code: &str,
    ) -> Result<TokenGrant, ProviderError> {
        let token = self.client(provider)?.exchange_code(code).await.map_err(classify)?;
        debug!(%provider, "Exchanged authorization code");
        Ok(grant(token))
    }

    async fn refresh(
        &self,
        provider: MailProvider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        let token = self.client(provider)?.refresh(refresh_token).await.map_err(classify)?;
        Ok(grant(token))
    }

    async fn get_identity(
        &self,
        provider: MailProvider,
        access_token: &str,
    ) -> Result<Identity, ProviderError> {
        let info = self
            .client(provider)?
            .user_info(access_token)
            .await
            .map_err(classify)?;
        Ok(Identity {
            email: info.email,
            verified: info.email_verified,
            provider_id: info.sub,
        })
    }
}

fn grant(token: Token) -> TokenGrant {
    TokenGrant {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_in: token.expires_in,
        scopes: token.scopes,
    }
}

fn classify(err: mailbridge_oauth::Error) -> ProviderError {
    if err.is_invalid_token() {
        ProviderError::InvalidToken(err.to_string())
    } else if err.is_permanent() {
        ProviderError::InvalidGrant(err.to_string())
    } else if err.is_timeout() {
        ProviderError::Transient(format!("provider timed out: {err}"))
    } else {
        ProviderError::Transient(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn unreachable_client() -> OAuthClient {
        let provider = Provider::new(
            "Local",
            "http://127.0.0.1:9/auth",
            "http://127.0.0.1:9/token",
            "http://127.0.0.1:9/userinfo",
        )
        .unwrap();
        OAuthClient::new("client-id", provider).unwrap()
    }

    #[test]
    fn classification() {
        let revoked = mailbridge_oauth::Error::oauth_error(400, "invalid_grant", "revoked");
        assert!(classify(revoked).is_permanent());

        let rejected = mailbridge_oauth::Error::InvalidToken { status: 401 };
        assert!(matches!(classify(rejected), ProviderError::InvalidToken(_)));

        let outage = mailbridge_oauth::Error::Status { status: 503 };
        assert!(matches!(classify(outage), ProviderError::Transient(_)));

        let misconfigured = mailbridge_oauth::Error::InvalidConfig("no client secret".into());
        let classified = classify(misconfigured);
        assert!(matches!(classified, ProviderError::Transient(_)));
        assert_eq!(classified.into_error("refresh").kind(), crate::ErrorKind::System);
    }

    #[test]
    fn presets() {
        assert!(OAuthClients::preset(MailProvider::Gmail).unwrap().is_some());
        assert!(OAuthClients::preset(MailProvider::Outlook).unwrap().is_some());
        assert!(OAuthClients::preset(MailProvider::Smtp).unwrap().is_none());
    }

    #[tokio::test]
    async fn unregistered_provider_is_transient() {
        let clients = OAuthClients::new();
        let err = clients.refresh(MailProvider::Yahoo, "r").await.unwrap_err();
        assert!(matches!(err, ProviderError::Transient(_)));
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let clients = OAuthClients::new().with_client(MailProvider::Gmail, unreachable_client());
        let err = clients.refresh(MailProvider::Gmail, "r").await.unwrap_err();
        assert!(!err.is_permanent());
        assert_eq!(clients.providers().collect::<Vec<_>>(), vec![MailProvider::Gmail]);
    }

    #[test]
    fn authorization_url_needs_redirect() {
        let clients = OAuthClients::new().with_client(MailProvider::Gmail, unreachable_client());
        assert!(clients.authorization_url(MailProvider::Gmail, "state").is_err());

        let client = unreachable_client().with_redirect_uri("http://127.0.0.1:8080/callback");
        let clients = OAuthClients::new().with_client(MailProvider::Gmail, client);
        let url = clients.authorization_url(MailProvider::Gmail, "state").unwrap();
        assert!(url.as_str().contains("state=state"));
    }
}
