//! `OAuth2` client for the authorization-code, refresh and identity calls.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::token::{ErrorResponse, Token, TokenResponse, UserInfo};

/// Default bound on every request made by the client.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Common `OAuth2` client configuration.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    /// Client ID from provider.
    pub client_id: String,
    /// Client secret (optional for public clients).
    pub client_secret: Option<String>,
    /// Redirect URI for authorization code flow.
    pub redirect_uri: Option<String>,
    /// Provider configuration.
    pub provider: Provider,
    /// HTTP client.
    http_client: Client,
}

impl OAuthClient {
    /// Creates a new OAuth client with the default request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(client_id: impl Into<String>, provider: Provider) -> Result<Self> {
        Ok(Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: None,
            provider,
            http_client: build_http_client(DEFAULT_TIMEOUT)?,
        })
    }

    /// Sets the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Sets the redirect URI.
    #[must_use]
    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(uri.into());
        self
    }

    /// Replaces the per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http_client = build_http_client(timeout)?;
        Ok(self)
    }

    /// Builds the authorization URL for user consent.
    ///
    /// Provider defaults are used when `scopes` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if no redirect URI is configured.
    pub fn authorization_url(&self, scopes: Option<&[String]>, state: &str) -> Result<Url> {
        let redirect_uri = self
            .redirect_uri
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("redirect_uri is required".into()))?;

        let mut url = self.provider.auth_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("client_id", &self.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("state", state);

            let scope_str = scopes.map_or_else(
                || self.provider.default_scopes.join(" "),
                |s| s.join(" "),
            );
            if !scope_str.is_empty() {
                pairs.append_pair("scope", &scope_str);
            }

            // Refresh tokens are only issued when explicitly requested
            match self.provider.name.as_str() {
                "Google" => {
                    pairs
                        .append_pair("access_type", "offline")
                        .append_pair("prompt", "consent");
                }
                "Microsoft" => {
                    pairs.append_pair("prompt", "select_account");
                }
                _ => {}
            }
        }

        Ok(url)
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server rejects the code.
    pub async fn exchange_code(&self, code: &str) -> Result<Token> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(uri) = &self.redirect_uri {
            params.push(("redirect_uri", uri.as_str()));
        }
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http_client
            .post(self.provider.token_url.clone())
            .form(&params)
            .send()
            .await?;

        let token = read_token_response(response).await?;
        debug!(provider = %self.provider.name, "Exchanged authorization code");
        Ok(token)
    }

    /// Refreshes an access token using a refresh token.
    ///
    /// The returned token has `refresh_token = None` when the server kept the
    /// previous refresh token valid.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the grant is rejected.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Token> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http_client
            .post(self.provider.token_url.clone())
            .form(&params)
            .send()
            .await?;

        let token = read_token_response(response).await?;
        debug!(provider = %self.provider.name, "Refreshed access token");
        Ok(token)
    }

    /// Resolves the mailbox identity behind an access token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] if the token is rejected, or another
    /// error if the request fails.
    pub async fn user_info(&self, access_token: &str) -> Result<UserInfo> {
        let response = self
            .http_client
            .get(self.provider.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::InvalidToken {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
            });
        }

        let info: UserInfo = response.json().await?;
        if info.email.trim().is_empty() {
            return Err(Error::InvalidResponse("identity has no email".into()));
        }
        Ok(info)
    }
}

fn build_http_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Decodes a token endpoint response, mapping `OAuth2` error bodies.
async fn read_token_response(response: Response) -> Result<Token> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await?;
        return Err(serde_json::from_str::<ErrorResponse>(&body).map_or(
            Error::Status {
                status: status.as_u16(),
            },
            |e| e.into_error(status.as_u16()),
        ));
    }

    let token_response: TokenResponse = response.json().await?;
    if token_response.access_token.is_empty() {
        return Err(Error::InvalidResponse("empty access_token".into()));
    }
    Ok(Token::from_response(token_response))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn google_client() -> OAuthClient {
        OAuthClient::new("client-123", Provider::google().unwrap())
            .unwrap()
            .with_client_secret("secret")
            .with_redirect_uri("https://app.example.com/oauth/callback")
    }

    #[test]
    fn test_authorization_url_google() {
        let url = google_client().authorization_url(None, "st-1").unwrap();
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let get = |k: &str| query.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("client_id"), Some("client-123"));
        assert_eq!(get("response_type"), Some("code"));
        assert_eq!(get("state"), Some("st-1"));
        assert_eq!(get("access_type"), Some("offline"));
        assert_eq!(get("prompt"), Some("consent"));
        assert!(get("scope").unwrap().contains("https://mail.google.com/"));
    }

    #[test]
    fn test_authorization_url_custom_scopes() {
        let scopes = vec!["mail-r".to_string()];
        let client = OAuthClient::new("y", Provider::yahoo().unwrap())
            .unwrap()
            .with_redirect_uri("https://app.example.com/cb");
        let url = client.authorization_url(Some(&scopes), "s").unwrap();
        assert!(url.as_str().contains("scope=mail-r"));
        assert!(!url.as_str().contains("access_type"));
    }

    #[test]
    fn test_authorization_url_requires_redirect() {
        let client = OAuthClient::new("c", Provider::google().unwrap()).unwrap();
        assert!(matches!(
            client.authorization_url(None, "s"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_token_endpoint_is_transient() {
        let provider = Provider::new(
            "Local",
            "http://127.0.0.1:9/authorize",
            "http://127.0.0.1:9/token",
            "http://127.0.0.1:9/userinfo",
        )
        .unwrap();
        let client = OAuthClient::new("c", provider)
            .unwrap()
            .with_timeout(Duration::from_secs(2))
            .unwrap();

        let err = client.refresh("r").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert!(!err.is_permanent());
    }
}
