//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use activity_sync::auth::{OAuthClient, TokenManager};
use activity_sync::database::{Database, SqliteDatabase};
use activity_sync::models::{ClientCredentials, StoredTokens};
use activity_sync::sync::{QuotaAwarePolicy, QuotaTracker, ResilientClient, RetryPolicy};

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Create a client pointed at the mock server that never retries
pub fn create_test_client(server: &MockServer, quota: Arc<QuotaTracker>) -> Arc<ResilientClient> {
    let policy: Arc<dyn RetryPolicy> =
        Arc::new(QuotaAwarePolicy::new(0, Duration::ZERO, Duration::ZERO));
    Arc::new(ResilientClient::with_client(
        Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client"),
        &server.uri(),
        200,
        quota,
        policy,
    ))
}

/// Store client credentials and a token pair valid for `expires_in_secs`
pub async fn seed_credentials(db: &SqliteDatabase, expires_in_secs: i64) {
    db.save_client_config(&ClientCredentials {
        client_id: "test-client".to_string(),
        client_secret: "test-secret".to_string(),
    })
    .await
    .expect("Failed to save client config");

    db.save_tokens(&StoredTokens {
        access_token: "test-access".to_string(),
        refresh_token: "test-refresh".to_string(),
        expires_at: Utc::now().timestamp() + expires_in_secs,
    })
    .await
    .expect("Failed to save tokens");
}

/// Token manager whose endpoint lives on the mock server
pub fn create_token_manager(
    server: &MockServer,
    db: Arc<SqliteDatabase>,
) -> Arc<TokenManager<SqliteDatabase>> {
    let oauth = OAuthClient::with_client(Client::new(), &format!("{}/oauth/token", server.uri()));
    Arc::new(TokenManager::new(db, oauth))
}

/// Activity list entry as returned by the API
pub fn activity_json(id: i64, start_date: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": format!("Activity {}", id),
        "type": "Ride",
        "sport_type": "Ride",
        "start_date": start_date,
        "distance": 20000.0,
        "moving_time": 3600,
        "elapsed_time": 3700
    })
}

/// Serve `body` for one list page
pub async fn mount_activity_page(server: &MockServer, page: u32, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .and(query_param("page", page.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Serve a heart rate zone group for every activity
pub async fn mount_zones(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/activities/\d+/zones$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {
                "type": "heartrate",
                "sensor_based": true,
                "distribution_buckets": [
                    {"min": 0, "max": 130, "time": 900.0},
                    {"min": 130, "max": 160, "time": 1800.0},
                    {"min": 160, "max": -1, "time": 300.0}
                ]
            }
        ])))
        .mount(server)
        .await;
}
