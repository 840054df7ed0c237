//! Token manager
//!
//! Owns the stored OAuth credentials. Hands out a valid access token,
//! refreshing it through the token endpoint when it is about to expire, and
//! persists every refreshed pair before returning it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::database::Database;
use crate::error::{AuthError, DbError};
use crate::models::{ClientCredentials, StoredTokens};

use super::oauth::OAuthClient;
use super::CredentialProvider;

/// Credential store backed by the local database
pub struct TokenManager<D: Database> {
    db: Arc<D>,
    oauth: OAuthClient,
    // Serializes refreshes so concurrent callers don't burn the refresh token twice
    refresh_lock: Mutex<()>,
}

impl<D: Database> TokenManager<D> {
    pub fn new(db: Arc<D>, oauth: OAuthClient) -> Self {
        Self {
            db,
            oauth,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Stored token pair
    pub async fn load_tokens(&self) -> Result<StoredTokens, AuthError> {
        let record = self.db.load_auth().await.map_err(storage_error)?;
        record
            .and_then(|r| r.tokens)
            .ok_or(AuthError::NotAuthenticated)
    }

    /// Stored client credentials
    pub async fn load_client(&self) -> Result<ClientCredentials, AuthError> {
        let record = self.db.load_auth().await.map_err(storage_error)?;
        record.map(|r| r.client).ok_or(AuthError::NotConfigured)
    }

    /// Persist client credentials from configuration and obtain a first token
    /// pair when a bootstrap refresh token is configured and none is stored.
    pub async fn bootstrap(&self, config: &AuthConfig) -> Result<(), AuthError> {
        if let (Some(client_id), Some(client_secret)) = (&config.client_id, &config.client_secret)
        {
            let client = ClientCredentials {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            };
            self.db
                .save_client_config(&client)
                .await
                .map_err(storage_error)?;
            debug!("Client credentials saved from configuration");
        }

        let Some(refresh_token) = &config.refresh_token else {
            return Ok(());
        };

        match self.load_tokens().await {
            Ok(_) => {
                debug!("Stored tokens present, ignoring configured refresh token");
                Ok(())
            }
            Err(AuthError::NotAuthenticated) => {
                let client = self.load_client().await?;
                let _guard = self.refresh_lock.lock().await;
                let tokens = self.exchange(&client, refresh_token).await?;
                info!(
                    expires_at = %fmt_expiry(&tokens),
                    "Bootstrapped tokens from configured refresh token"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh unconditionally and persist the new pair
    pub async fn refresh(&self) -> Result<StoredTokens, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Refresh only when less than `margin` of validity remains.
    ///
    /// Returns the new pair when a refresh happened.
    pub async fn refresh_if_expiring(
        &self,
        margin: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredTokens>, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        let tokens = self.load_tokens().await?;
        let remaining = tokens.expires_in(now);
        if remaining >= margin {
            debug!(
                remaining_secs = remaining.num_seconds(),
                "Access token still valid"
            );
            return Ok(None);
        }

        info!(
            remaining_secs = remaining.num_seconds(),
            "Access token expiring soon, refreshing"
        );
        self.refresh_locked().await.map(Some)
    }

    /// Remove all stored credentials
    pub async fn clear(&self) -> Result<(), AuthError> {
        self.db.delete_auth().await.map_err(storage_error)
    }

    async fn refresh_locked(&self) -> Result<StoredTokens, AuthError> {
        let client = self.load_client().await?;
        let current = self.load_tokens().await?;
        self.exchange(&client, &current.refresh_token).await
    }

    async fn exchange(
        &self,
        client: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<StoredTokens, AuthError> {
        let response = self.oauth.refresh(client, refresh_token).await?;
        let tokens = StoredTokens::from(response);

        self.db.save_tokens(&tokens).await.map_err(|e| {
            warn!(error = %e, "Refreshed tokens could not be saved");
            storage_error(e)
        })?;

        Ok(tokens)
    }
}

#[async_trait]
impl<D: Database> CredentialProvider for TokenManager<D> {
    async fn valid_access_token(&self) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        let tokens = self.load_tokens().await?;
        if !tokens.is_expired(Utc::now()) {
            return Ok(tokens.access_token);
        }

        info!("Access token expired, refreshing");
        let tokens = self.refresh_locked().await?;
        Ok(tokens.access_token)
    }
}

fn storage_error(err: DbError) -> AuthError {
    AuthError::Storage(err.to_string())
}

fn fmt_expiry(tokens: &StoredTokens) -> String {
    tokens
        .expires_at_utc()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| tokens.expires_at.to_string())
}
