//! activity-sync - Quota-aware replication of a rate-limited activity API
//!
//! This is the main entry point for the activity-sync application.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use activity_sync::auth::{CredentialProvider, OAuthClient, TokenManager};
use activity_sync::config::Config;
use activity_sync::database::SqliteDatabase;
use activity_sync::error::AppError;
use activity_sync::otel::{effective_log_level, init_tracing, OtelProvider, SyncMetrics};
use activity_sync::sync::{
    EnrichmentBatchOrchestrator, EnrichmentConfig, QuotaAwarePolicy, QuotaTracker,
    ReplicationOrchestrator, ResilientClient, SchedulerConfig, SyncScheduler, Syncable,
};
use activity_sync::workers::{
    log_database_stats, ActivitySyncWorker, EnrichmentWorker, TokenRefreshWorker,
};

/// activity-sync - Quota-aware replication of a rate-limited activity API
#[derive(Parser, Debug)]
#[command(name = "activity-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "ACTIVITY_SYNC_CONFIG")]
    config: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace with header dumps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the SQLite database
    #[arg(long)]
    db: Option<String>,

    /// Activity sync interval in seconds
    #[arg(long)]
    sync_interval: Option<u64>,

    /// Token refresh check interval in seconds
    #[arg(long)]
    token_refresh_interval: Option<u64>,

    /// Serve from the local database only; never contact the API
    #[arg(long)]
    no_sync: bool,

    /// Discard stored credentials and bootstrap again from configuration
    #[arg(long)]
    force_reauth: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;

    let otel_provider = OtelProvider::new(&config.otel)?;

    init_tracing(
        &otel_provider,
        effective_log_level(&config.logging.level, args.verbose),
        &config.logging.format,
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting activity-sync"
    );

    let database = SqliteDatabase::open(
        &config.database.path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )
    .await?;
    database.check_exclusive_access().await?;
    let database = Arc::new(database);
    info!(path = %config.database.path, "Database initialized");

    log_database_stats(database.as_ref()).await;

    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
    };

    if config.sync.enabled {
        run_sync(&config, Arc::clone(&database), &otel_provider, &args, &cancel).await?;
    } else {
        info!("Running in offline mode, skipping API sync");
        cancel.cancelled().await;
    }

    shutdown.abort();

    if let Err(e) = otel_provider.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    info!("activity-sync shutdown complete");
    Ok(())
}

/// Authenticate, run the startup sync, then hand over to the scheduler
async fn run_sync(
    config: &Config,
    database: Arc<SqliteDatabase>,
    otel_provider: &OtelProvider,
    args: &Args,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    let tokens = Arc::new(TokenManager::new(
        Arc::clone(&database),
        OAuthClient::new(&config.auth)?,
    ));

    if args.force_reauth {
        info!("Re-authentication requested, clearing stored credentials");
        tokens.clear().await?;
    }

    tokens.bootstrap(&config.auth).await?;
    tokens.valid_access_token().await?;
    info!("Using stored authentication");

    let metrics = SyncMetrics::new(&otel_provider.meter());
    let quota = Arc::new(QuotaTracker::from_config(&config.quota));
    let policy = Arc::new(QuotaAwarePolicy::from_config(&config.retry));
    let client = Arc::new(
        ResilientClient::new(&config.source, quota, policy)?.with_metrics(metrics.clone()),
    );

    let credentials: Arc<dyn CredentialProvider> = tokens.clone();
    let interval = Duration::from_secs(config.sync.interval_secs);

    let replication = Arc::new(
        ReplicationOrchestrator::new(Arc::clone(&client), Arc::clone(&database))
            .with_metrics(metrics.clone()),
    );
    // The startup run below covers the first interval
    let activities = ActivitySyncWorker::new(replication, Arc::clone(&credentials), interval)
        .with_initial_delay(interval);

    info!("Performing initial sync");
    if let Err(e) = activities.sync(cancel).await {
        warn!(error = %e, "Initial sync failed");
    }

    log_database_stats(database.as_ref()).await;

    let enrichment = Arc::new(
        EnrichmentBatchOrchestrator::new(
            Arc::clone(&client),
            Arc::clone(&database),
            EnrichmentConfig::from_config(&config.sync),
        )
        .with_metrics(metrics),
    );
    let zones = EnrichmentWorker::new(enrichment, Arc::clone(&database), credentials, &config.sync);

    let token_refresh = TokenRefreshWorker::new(
        tokens,
        Duration::from_secs(config.sync.token_refresh_interval_secs),
    );

    let workers: Vec<Arc<dyn Syncable>> = vec![
        Arc::new(token_refresh),
        Arc::new(activities),
        Arc::new(zones),
    ];

    info!("Starting background workers");
    let scheduler = SyncScheduler::new(
        SchedulerConfig::from_config(&config.sync),
        workers,
        cancel.clone(),
    );
    scheduler.run().await;

    info!("All workers shut down");
    Ok(())
}

/// Load configuration from file or environment, then apply CLI overrides
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
        }
        None => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
        }
    };

    if let Some(db) = &args.db {
        config.database.path = db.clone();
    }
    if let Some(secs) = args.sync_interval {
        config.sync.interval_secs = secs;
    }
    if let Some(secs) = args.token_refresh_interval {
        config.sync.token_refresh_interval_secs = secs;
    }
    if args.no_sync {
        config.sync.enabled = false;
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
