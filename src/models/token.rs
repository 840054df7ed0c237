//! Credential models
//!
//! This module defines the OAuth token pair and client credentials kept in the
//! local database.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds of remaining lifetime below which an access token counts as expired
pub const EXPIRY_MARGIN_SECS: i64 = 300;

/// Access/refresh token pair stored in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,

    /// Unix timestamp (seconds) at which the access token expires
    pub expires_at: i64,
}

impl StoredTokens {
    /// True when fewer than five minutes of validity remain
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.expires_at - EXPIRY_MARGIN_SECS
    }

    /// Remaining lifetime, negative once expired
    pub fn expires_in(&self, now: DateTime<Utc>) -> chrono::Duration {
        chrono::Duration::seconds(self.expires_at - now.timestamp())
    }

    /// Expiry as a timestamp, if representable
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at, 0).single()
    }
}

/// OAuth application credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Token endpoint response for a refresh grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,

    #[serde(default)]
    pub expires_in: i64,

    #[serde(default)]
    pub token_type: String,
}

impl From<TokenResponse> for StoredTokens {
    fn from(resp: TokenResponse) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at: resp.expires_at,
        }
    }
}

/// Everything stored in the auth row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRecord {
    pub client: ClientCredentials,
    pub tokens: Option<StoredTokens>,
}
