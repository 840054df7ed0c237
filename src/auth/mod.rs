//! Credentials for the upstream API
//!
//! This module keeps the OAuth token pair in the local database and refreshes
//! it through the provider's token endpoint:
//! - Refresh grant against the token endpoint
//! - Bootstrap of client credentials from configuration
//! - Expiry-aware access token hand-out for the sync layer

pub mod manager;
pub mod oauth;

use async_trait::async_trait;

use crate::error::AuthError;

pub use manager::TokenManager;
pub use oauth::OAuthClient;

/// Source of access tokens for upstream requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// An access token that is valid for at least a few more minutes
    async fn valid_access_token(&self) -> Result<String, AuthError>;
}
