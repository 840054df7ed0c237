//! Application error types for activity-sync
//!
//! This module defines common error types used throughout the application.
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Credential-related errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    /// No tokens have been stored yet
    #[error("Not authenticated: no stored tokens")]
    NotAuthenticated,

    /// Client credentials are missing
    #[error("Client not configured: missing client id or secret")]
    NotConfigured,

    /// The refresh grant was rejected or could not be completed
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Reading or writing stored credentials failed
    #[error("Credential storage error: {0}")]
    Storage(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Error from the background connection thread
    #[error("Database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    /// Another process holds the database
    #[error("Database is locked, another instance may be running: {0}")]
    Locked(String),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Synchronization-related errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),

    /// Rate limited by upstream, with the server's Retry-After hint if any
    #[error("Rate limited{}", retry_after_suffix(.0))]
    RateLimited(Option<u64>),

    /// Server error
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Status code with no defined handling
    #[error("Unexpected status: HTTP {0}")]
    UnexpectedStatus(u16),

    /// The account lacks entitlement for the endpoint (HTTP 402)
    #[error("Feature unavailable: subscription required")]
    FeatureUnavailable,

    /// Unauthorized (HTTP 401/403)
    #[error("Unauthorized")]
    Unauthorized,

    /// Invalid data received
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Shutdown was signalled
    #[error("Cancelled")]
    Cancelled,

    /// A scheduled run exceeded its time limit (seconds)
    #[error("Run timed out after {0} seconds")]
    Timeout(u64),

    /// No usable access token for this run
    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    /// Persistence failed in a way that stops the run
    #[error("Database error: {0}")]
    Database(String),

    /// A manual run named a task the scheduler does not know
    #[error("Unknown sync task: {0}")]
    UnknownTask(String),
}

fn retry_after_suffix(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(", retry after {} seconds", secs),
        None => String::new(),
    }
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<AuthError> for SyncError {
    fn from(err: AuthError) -> Self {
        SyncError::Credentials(err.to_string())
    }
}

/// Application-level error type
///
/// Aggregates all domain-specific error types.
#[derive(Debug, Error)]
pub enum AppError {
    /// Credential error
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
