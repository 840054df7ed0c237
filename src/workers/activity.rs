//! Activity sync worker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::CredentialProvider;
use crate::database::Database;
use crate::error::SyncError;
use crate::models::SyncResult;
use crate::sync::replication::{ReplicationOrchestrator, SyncMode};
use crate::sync::Syncable;

/// Periodically replicates new activities into the local store
pub struct ActivitySyncWorker<D: Database> {
    replication: Arc<ReplicationOrchestrator<D>>,
    credentials: Arc<dyn CredentialProvider>,
    interval: Duration,
    initial_delay: Duration,
}

impl<D: Database> ActivitySyncWorker<D> {
    pub fn new(
        replication: Arc<ReplicationOrchestrator<D>>,
        credentials: Arc<dyn CredentialProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            replication,
            credentials,
            interval,
            initial_delay: Duration::ZERO,
        }
    }

    /// Delay the first scheduled run, e.g. after a startup sync already ran
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

#[async_trait]
impl<D: Database + 'static> Syncable for ActivitySyncWorker<D> {
    fn name(&self) -> &str {
        "activities"
    }

    fn sync_interval(&self) -> Duration {
        self.interval
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn sync(&self, cancel: &CancellationToken) -> Result<SyncResult, SyncError> {
        let token = self.credentials.valid_access_token().await?;
        let outcome = self.replication.run(&token, cancel).await?;

        if outcome.fetched == 0 {
            info!("No new activities to sync");
            return Ok(SyncResult::success(0).with_message("no new activities"));
        }

        let mode = match outcome.mode {
            SyncMode::Full => "full".to_string(),
            SyncMode::Delta { since } => format!("delta since {}", since.to_rfc3339()),
        };

        Ok(SyncResult::success(outcome.persisted.saved).with_message(format!(
            "{} sync: fetched {}, saved {}, failed {}",
            mode, outcome.fetched, outcome.persisted.saved, outcome.persisted.failed
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockCredentialProvider;
    use crate::database::SqliteDatabase;
    use crate::error::AuthError;
    use crate::models::ActivityRecord;
    use crate::sync::http_client::ResilientClient;
    use crate::sync::quota::QuotaTracker;
    use crate::sync::retry::{QuotaAwarePolicy, RetryPolicy};
    use chrono::{TimeZone, Utc};
    use reqwest::Client;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> Arc<ResilientClient> {
        let policy: Arc<dyn RetryPolicy> =
            Arc::new(QuotaAwarePolicy::new(0, Duration::ZERO, Duration::ZERO));
        Arc::new(ResilientClient::with_client(
            Client::new(),
            &server.uri(),
            200,
            Arc::new(QuotaTracker::default()),
            policy,
        ))
    }

    fn credentials(token: &'static str) -> Arc<dyn CredentialProvider> {
        let mut mock = MockCredentialProvider::new();
        mock.expect_valid_access_token()
            .returning(move || Ok(token.to_string()));
        Arc::new(mock)
    }

    fn activity(id: i64, start: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("Run {}", id),
            "type": "Run",
            "start_date": start,
            "distance": 5000.0,
            "moving_time": 1500
        })
    }

    // Test 1: Empty store performs a full sync with the provided token
    #[tokio::test]
    async fn test_full_sync_on_empty_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .and(query_param("page", "1"))
            .and(query_param_is_missing("after"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                activity(2, "2024-05-02T06:00:00Z"),
                activity(1, "2024-05-01T06:00:00Z")
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let replication = Arc::new(ReplicationOrchestrator::new(
            client_for(&server),
            Arc::clone(&db),
        ));
        let worker =
            ActivitySyncWorker::new(replication, credentials("tok"), Duration::from_secs(900));

        let result = worker.sync(&CancellationToken::new()).await.unwrap();

        assert_eq!(result.records_updated, 2);
        assert!(result.message.unwrap().starts_with("full sync"));
        assert_eq!(db.count_activities().await.unwrap(), 2);
    }

    // Test 2: Stored activities switch to a delta sync
    #[tokio::test]
    async fn test_delta_sync_uses_newest_start_date() {
        let server = MockServer::start().await;
        let newest = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        Mock::given(method("GET"))
            .and(path("/athlete/activities"))
            .and(query_param("after", newest.timestamp().to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        db.upsert_activity(&ActivityRecord::new(1, "Run").with_start_date(newest))
            .await
            .unwrap();

        let replication = Arc::new(ReplicationOrchestrator::new(
            client_for(&server),
            Arc::clone(&db),
        ));
        let worker =
            ActivitySyncWorker::new(replication, credentials("tok"), Duration::from_secs(900));

        let result = worker.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.records_updated, 0);
        assert_eq!(result.message.as_deref(), Some("no new activities"));
    }

    // Test 3: Credential failure aborts before any request
    #[tokio::test]
    async fn test_credential_failure() {
        let server = MockServer::start().await;
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let replication = Arc::new(ReplicationOrchestrator::new(client_for(&server), db));

        let mut mock = MockCredentialProvider::new();
        mock.expect_valid_access_token()
            .returning(|| Err(AuthError::NotAuthenticated));

        let worker = ActivitySyncWorker::new(replication, Arc::new(mock), Duration::from_secs(900));
        let result = worker.sync(&CancellationToken::new()).await;

        assert!(matches!(result, Err(SyncError::Credentials(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    // Test 4: Scheduling metadata
    #[tokio::test]
    async fn test_worker_metadata() {
        let server = MockServer::start().await;
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let replication = Arc::new(ReplicationOrchestrator::new(client_for(&server), db));

        let worker = ActivitySyncWorker::new(replication, credentials("tok"), Duration::from_secs(900))
            .with_initial_delay(Duration::from_secs(900));

        assert_eq!(worker.name(), "activities");
        assert_eq!(worker.sync_interval(), Duration::from_secs(900));
        assert_eq!(worker.initial_delay(), Duration::from_secs(900));
        assert!(worker.is_enabled());
    }
}
