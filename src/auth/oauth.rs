//! OAuth token endpoint client
//!
//! Only the refresh grant is implemented; the initial authorization code
//! exchange happens out of band and its refresh token is supplied through
//! configuration.

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::models::{ClientCredentials, TokenResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the provider's token endpoint
#[derive(Debug, Clone)]
pub struct OAuthClient {
    client: Client,
    token_url: String,
}

impl OAuthClient {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::RefreshFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client, &config.token_url))
    }

    pub fn with_client(client: Client, token_url: &str) -> Self {
        Self {
            client,
            token_url: token_url.to_string(),
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    /// Exchange a refresh token for a new token pair
    pub async fn refresh(
        &self,
        client: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthError> {
        debug!(token_url = %self.token_url, "Requesting token refresh");

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Token refresh rejected");
            return Err(AuthError::RefreshFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::RefreshFailed(format!("Invalid token response: {}", e)))
    }
}
