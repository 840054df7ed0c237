//! Background task scheduler
//!
//! This module runs each registered task on its own periodic timer with an
//! optional start delay and jitter. All tasks share one cancellation token;
//! cancelling it interrupts in-flight runs and stops the timers. Runs of the
//! same task never overlap: a manual trigger waits for a scheduled run.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{SyncResult, SyncStatus};
use crate::sync::wait::cancellable_sleep;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Jitter range (seconds) added before each periodic run
    pub jitter_secs: u64,
    /// Upper bound for a single run (seconds)
    pub sync_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            jitter_secs: config.jitter_secs,
            sync_timeout_secs: config.sync_timeout_secs,
        }
    }
}

/// A task the scheduler runs periodically
#[async_trait]
pub trait Syncable: Send + Sync {
    /// Get the name of this task
    fn name(&self) -> &str;

    /// Get the interval between runs
    fn sync_interval(&self) -> Duration;

    /// Delay before the first run
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Disabled tasks are never started
    fn is_enabled(&self) -> bool {
        true
    }

    /// Perform one run; long waits must observe `cancel`
    async fn sync(&self, cancel: &CancellationToken) -> Result<SyncResult, SyncError>;
}

/// Manual sync request
struct ManualSyncRequest {
    task_name: String,
    response: mpsc::Sender<Result<SyncResult, SyncError>>,
}

/// A registered task and the lock held for the length of each run
#[derive(Clone)]
struct ScheduledTask {
    source: Arc<dyn Syncable>,
    running: Arc<Mutex<()>>,
}

/// Scheduler for background tasks
pub struct SyncScheduler {
    config: SchedulerConfig,
    tasks: Vec<ScheduledTask>,
    status: Arc<RwLock<HashMap<String, SyncStatus>>>,
    cancel: CancellationToken,
    manual_sync_rx: mpsc::Receiver<ManualSyncRequest>,
    manual_sync_tx: mpsc::Sender<ManualSyncRequest>,
}

impl SyncScheduler {
    /// Create a new scheduler
    ///
    /// # Arguments
    ///
    /// * `config` - Scheduler configuration
    /// * `sources` - Tasks to manage
    /// * `cancel` - Shared shutdown token
    pub fn new(
        config: SchedulerConfig,
        sources: Vec<Arc<dyn Syncable>>,
        cancel: CancellationToken,
    ) -> Self {
        let (manual_sync_tx, manual_sync_rx) = mpsc::channel(32);

        let status = sources
            .iter()
            .map(|s| (s.name().to_string(), SyncStatus::new(s.name())))
            .collect();

        let tasks = sources
            .into_iter()
            .map(|source| ScheduledTask {
                source,
                running: Arc::new(Mutex::new(())),
            })
            .collect();

        Self {
            config,
            tasks,
            status: Arc::new(RwLock::new(status)),
            cancel,
            manual_sync_rx,
            manual_sync_tx,
        }
    }

    /// Get a handle for triggering manual runs
    pub fn manual_sync_handle(&self) -> ManualSyncHandle {
        ManualSyncHandle {
            tx: self.manual_sync_tx.clone(),
        }
    }

    /// Get the current status of every task
    pub async fn get_status(&self) -> HashMap<String, SyncStatus> {
        self.status.read().await.clone()
    }

    /// Run the scheduler until the cancellation token fires
    pub async fn run(mut self) {
        let enabled: Vec<ScheduledTask> = self
            .tasks
            .iter()
            .filter(|t| {
                if !t.source.is_enabled() {
                    info!(task = t.source.name(), "Task disabled, not scheduling");
                }
                t.source.is_enabled()
            })
            .cloned()
            .collect();

        info!(tasks = enabled.len(), "Starting sync scheduler");

        let mut handles = Vec::new();
        for task in enabled {
            let status = self.status.clone();
            let config = self.config.clone();
            let cancel = self.cancel.clone();

            handles.push(tokio::spawn(async move {
                Self::run_source_sync(task, status, config, cancel).await;
            }));
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, stopping sync scheduler");
                    break;
                }
                Some(request) = self.manual_sync_rx.recv() => {
                    self.handle_manual_sync(request).await;
                }
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!("Sync scheduler stopped");
    }

    async fn run_source_sync(
        task: ScheduledTask,
        status: Arc<RwLock<HashMap<String, SyncStatus>>>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) {
        let name = task.source.name().to_string();
        let interval = task.source.sync_interval();
        let delay = task.source.initial_delay();

        info!(
            task = name,
            interval_secs = interval.as_secs(),
            initial_delay_secs = delay.as_secs(),
            "Task started"
        );

        if cancellable_sleep(delay, &cancel).await.is_err() {
            info!(task = name, "Task stopped");
            return;
        }

        let _ = Self::perform_sync(&task, &status, &config, &cancel).await;

        let mut interval_timer = interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                _ = interval_timer.tick() => {
                    let jitter = jitter(config.jitter_secs);
                    if cancellable_sleep(jitter, &cancel).await.is_err() {
                        break;
                    }

                    debug!(task = name, "Performing scheduled run");
                    let _ = Self::perform_sync(&task, &status, &config, &cancel).await;
                }
            }
        }

        info!(task = name, "Task stopped");
    }

    async fn perform_sync(
        task: &ScheduledTask,
        status: &Arc<RwLock<HashMap<String, SyncStatus>>>,
        config: &SchedulerConfig,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        let source = &task.source;
        let name = source.name().to_string();

        let _running = match task.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(task = name, "Run already in progress, waiting for it to finish");
                tokio::select! {
                    guard = task.running.lock() => guard,
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                }
            }
        };

        {
            let mut status_map = status.write().await;
            if let Some(s) = status_map.get_mut(&name) {
                *s = s.clone().in_progress();
            }
        }

        let result = tokio::time::timeout(
            Duration::from_secs(config.sync_timeout_secs),
            source.sync(cancel),
        )
        .await;

        let result = match result {
            Ok(Ok(sync_result)) => {
                if sync_result.skipped {
                    debug!(task = name, message = ?sync_result.message, "Run skipped");
                } else {
                    debug!(task = name, records = sync_result.records_updated, "Run completed");
                }
                Ok(sync_result)
            }
            Ok(Err(SyncError::Cancelled)) => {
                debug!(task = name, "Run interrupted by shutdown");
                Err(SyncError::Cancelled)
            }
            Ok(Err(err)) => {
                warn!(task = name, error = %err, "Run failed");
                Err(err)
            }
            Err(_) => {
                error!(
                    task = name,
                    timeout_secs = config.sync_timeout_secs,
                    "Run timed out"
                );
                Err(SyncError::Timeout(config.sync_timeout_secs))
            }
        };

        let mut status_map = status.write().await;
        if let Some(s) = status_map.get_mut(&name) {
            *s = match &result {
                Ok(r) => s.clone().success(r.records_updated),
                Err(e) => s.clone().failed(e.to_string()),
            };
        }

        result
    }

    async fn handle_manual_sync(&self, request: ManualSyncRequest) {
        let task = self
            .tasks
            .iter()
            .find(|t| t.source.name() == request.task_name);

        let result = match task {
            Some(task) => {
                info!(task = request.task_name, "Manual run triggered");
                Self::perform_sync(task, &self.status, &self.config, &self.cancel).await
            }
            None => {
                warn!(
                    task = request.task_name,
                    "Manual run requested for unknown task"
                );
                Err(SyncError::UnknownTask(request.task_name.clone()))
            }
        };

        let _ = request.response.send(result).await;
    }
}

fn jitter(jitter_secs: u64) -> Duration {
    if jitter_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rand::thread_rng().gen_range(0..jitter_secs))
}

/// Handle for triggering manual runs
#[derive(Clone)]
pub struct ManualSyncHandle {
    tx: mpsc::Sender<ManualSyncRequest>,
}

impl ManualSyncHandle {
    /// Run the named task now and wait for its result
    pub async fn trigger_sync(&self, task_name: &str) -> Result<SyncResult, SyncError> {
        let (response_tx, mut response_rx) = mpsc::channel(1);

        self.tx
            .send(ManualSyncRequest {
                task_name: task_name.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| SyncError::Network("Scheduler not running".to_string()))?;

        response_rx
            .recv()
            .await
            .ok_or_else(|| SyncError::Network("No response from scheduler".to_string()))?
    }
}
