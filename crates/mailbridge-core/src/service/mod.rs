//! Account lifecycle services.
//!
//! This module provides the service layer that drives provider calls
//! (token refresh, connection tests) and exposes the caller-facing
//! operations through [`AccountManager`].

pub mod manager;
pub mod query;
pub mod refresh;
pub mod tester;

pub use manager::{AccountDetail, AccountManager, OAuthConnection};
pub use query::{AccountPage, AccountQuery, AccountSummary, AccountView, ListRequest};
pub use refresh::{AccountRefresh, RefreshReport, RefreshStatus, TokenRefresher, needs_refresh};
pub use tester::{ConnectionReport, ConnectionTester};
