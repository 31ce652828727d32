//! # mailbridge-oauth
//!
//! `OAuth2` client for mailbox providers.
//!
//! ## Features
//!
//! - **Authorization code flow**: consent URL construction and code exchange
//! - **Token refresh**: refresh-token grant with rotation awareness
//! - **Identity**: `OpenID` user-info lookup to resolve the mailbox address
//! - **Failure classification**: permanent grant errors vs. transient ones
//! - **Provider configurations**: Gmail, Outlook, Yahoo, or custom endpoints
//!
//! ## Token Refresh
//!
//! ```ignore
//! use mailbridge_oauth::{OAuthClient, Provider};
//!
//! let client = OAuthClient::new("client_id", Provider::google()?)?
//!     .with_client_secret("secret");
//!
//! match client.refresh(&stored_refresh_token).await {
//!     Ok(token) => store(token),
//!     Err(e) if e.is_permanent() => ask_user_to_reconnect(),
//!     Err(e) => retry_later(e),
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod client;
mod error;
pub mod provider;
pub mod token;

pub use client::OAuthClient;
pub use error::{Error, Result};
pub use provider::Provider;
pub use token::{Token, UserInfo};
