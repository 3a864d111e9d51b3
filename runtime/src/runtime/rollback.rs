//! Rollback state machine shared by every runtime backend
//!
//! A rollback walks `pending -> started -> shutdown -> cleanup -> complete`,
//! dropping to `failed` from any non-terminal state. Backends supply the
//! primitives through [`RollbackBackend`]; [`execute`] drives them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::DeployError;

/// Upper bound on a forced stop, independent of the rollback timeout
pub const FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackState {
    Pending,
    Started,
    Shutdown,
    Cleanup,
    Complete,
    Failed,
}

impl RollbackState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RollbackState::Complete | RollbackState::Failed)
    }
}

impl std::fmt::Display for RollbackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RollbackState::Pending => "pending",
            RollbackState::Started => "started",
            RollbackState::Shutdown => "shutdown",
            RollbackState::Cleanup => "cleanup",
            RollbackState::Complete => "complete",
            RollbackState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub enum RollbackEvent {
    Start,
    BeginShutdown,
    BeginCleanup,
    Complete,
    Fail(String),
}

/// Rollback FSM
#[derive(Debug, Clone)]
pub struct RollbackFsm {
    state: RollbackState,
    failed_at: Option<RollbackState>,
    error: Option<String>,
}

impl RollbackFsm {
    pub fn new() -> Self {
        Self {
            state: RollbackState::Pending,
            failed_at: None,
            error: None,
        }
    }

    pub fn state(&self) -> RollbackState {
        self.state
    }

    /// State the machine was in when it failed
    pub fn failed_at(&self) -> Option<RollbackState> {
        self.failed_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: RollbackEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (RollbackState::Pending, RollbackEvent::Start) => RollbackState::Started,
            (RollbackState::Started, RollbackEvent::BeginShutdown) => RollbackState::Shutdown,
            (RollbackState::Shutdown, RollbackEvent::BeginCleanup) => RollbackState::Cleanup,
            (RollbackState::Cleanup, RollbackEvent::Complete) => RollbackState::Complete,

            (state, RollbackEvent::Fail(err)) if !state.is_terminal() => {
                self.failed_at = Some(*state);
                self.error = Some(err.clone());
                RollbackState::Failed
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for RollbackFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-controlled rollback behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOptions {
    /// Skip the graceful stop and go straight to a forced one
    pub force: bool,

    /// Budget for the graceful stop
    pub timeout: Duration,

    pub cleanup_files: bool,
    pub keep_logs: bool,
    pub create_backup: bool,
    pub health_check: bool,
    pub notify_metrics: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            force: false,
            timeout: Duration::from_secs(30),
            cleanup_files: true,
            keep_logs: true,
            create_backup: true,
            health_check: true,
            notify_metrics: true,
        }
    }
}

/// Best-effort accounting of what a rollback released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub memory_freed: u64,
    pub disk_space_freed: u64,
    pub connections_closed: usize,
    pub files_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMetrics {
    pub shutdown_duration: Duration,
    pub cleanup_duration: Duration,
    pub total_duration: Duration,
    pub resources_freed: ResourceStats,
}

/// Outcome of a rollback
#[derive(Debug)]
pub struct RollbackResult {
    pub success: bool,
    pub error: Option<DeployError>,

    /// Terminal state; `failed_at` tells where a failed rollback stopped
    pub state: RollbackState,
    pub failed_at: Option<RollbackState>,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub backup_path: Option<PathBuf>,
    pub metrics: RollbackMetrics,
}

impl RollbackResult {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            success: false,
            error: None,
            state: RollbackState::Pending,
            failed_at: None,
            start_time: now,
            end_time: now,
            backup_path: None,
            metrics: RollbackMetrics::default(),
        }
    }

    /// Turn a failed result into an error carrying the state it failed in
    pub fn ok(mut self) -> Result<Self, DeployError> {
        match self.error.take() {
            None => Ok(self),
            Some(source) => Err(DeployError::RollbackFailed {
                state: self.failed_at.unwrap_or(self.state),
                source: Box::new(source),
            }),
        }
    }
}

/// Backend primitives the rollback engine composes
#[async_trait]
pub trait RollbackBackend: Send {
    /// Short backend name, used in backup directory names and metrics
    fn backend_name(&self) -> &'static str;

    /// Identifier of the current deployment, if any
    fn deployment_id(&self) -> Option<String>;

    /// Whether [`RollbackBackend::backup`] has anything to save
    fn has_backup_state(&self) -> bool {
        true
    }

    async fn backup(&mut self, backup_dir: &Path) -> Result<(), DeployError>;

    /// Ask the deployment to stop. `NotFound` means it is already gone.
    async fn graceful_stop(&mut self, timeout: Duration) -> Result<(), DeployError>;

    async fn force_stop(&mut self) -> Result<(), DeployError>;

    async fn cleanup(&mut self, options: &RollbackOptions) -> Result<ResourceStats, DeployError>;

    /// Confirm the deployment is gone
    async fn verify(&mut self, options: &RollbackOptions) -> Result<(), DeployError>;

    /// Forget the deployment; called after every rollback attempt
    fn release(&mut self);
}

/// Backup directory for one rollback: `<backups>/<kind>-<id>-<timestamp>`
pub fn backup_dir_for(backups_dir: &Path, kind: &str, id: &str) -> PathBuf {
    let id: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    backups_dir.join(format!("{}-{}-{}", kind, id, Utc::now().format("%Y%m%dT%H%M%S%.3fZ")))
}

/// Run a full rollback against `backend`.
///
/// Never panics and always releases the deployment. Failures are reported
/// in the returned result together with the state they happened in.
pub async fn execute<B>(
    backend: &mut B,
    options: &RollbackOptions,
    backups_dir: &Path,
) -> RollbackResult
where
    B: RollbackBackend + ?Sized,
{
    let mut result = RollbackResult::begin();
    let started = Instant::now();

    let Some(id) = backend.deployment_id() else {
        debug!("No {} deployment to roll back", backend.backend_name());
        result.success = true;
        result.state = RollbackState::Complete;
        result.end_time = Utc::now();
        return result;
    };

    info!("Rolling back {} deployment {}", backend.backend_name(), id);
    let mut fsm = RollbackFsm::new();
    let outcome = run_stages(backend, options, backups_dir, &id, &mut fsm, &mut result).await;

    match outcome {
        Ok(()) => {
            advance(&mut fsm, RollbackEvent::Complete);
            result.success = true;
        }
        Err(e) => {
            warn!(
                "Rollback of {} {} failed in state {}: {}",
                backend.backend_name(),
                id,
                fsm.state(),
                e
            );
            advance(&mut fsm, RollbackEvent::Fail(e.to_string()));
            result.error = Some(e);
        }
    }

    result.state = fsm.state();
    result.failed_at = fsm.failed_at();
    result.end_time = Utc::now();
    result.metrics.total_duration = started.elapsed();
    backend.release();

    if options.notify_metrics {
        notify_metrics(backend.backend_name(), &id, &result);
    }
    result
}

async fn run_stages<B>(
    backend: &mut B,
    options: &RollbackOptions,
    backups_dir: &Path,
    id: &str,
    fsm: &mut RollbackFsm,
    result: &mut RollbackResult,
) -> Result<(), DeployError>
where
    B: RollbackBackend + ?Sized,
{
    transition(fsm, RollbackEvent::Start)?;

    if options.create_backup && backend.has_backup_state() {
        let dir = backup_dir_for(backups_dir, backend.backend_name(), id);
        tokio::fs::create_dir_all(&dir).await?;
        match backend.backup(&dir).await {
            Ok(()) => {
                debug!("Saved rollback backup to {:?}", dir);
                result.backup_path = Some(dir);
            }
            // Deployment vanished underneath us; there is nothing to save
            Err(e) if e.is_not_found() => {
                debug!("Skipping backup, deployment already gone: {}", e);
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    debug!("Failed to remove empty backup dir {:?}: {}", dir, e);
                }
            }
            Err(e) => return Err(DeployError::Backend(format!("backup failed: {}", e))),
        }
    }

    transition(fsm, RollbackEvent::BeginShutdown)?;
    let shutdown = Instant::now();
    stop(backend, options).await?;
    result.metrics.shutdown_duration = shutdown.elapsed();

    transition(fsm, RollbackEvent::BeginCleanup)?;
    let cleanup = Instant::now();
    let stats = match backend.cleanup(options).await {
        Ok(stats) => stats,
        Err(e) if e.is_not_found() => {
            debug!("Nothing left to clean up: {}", e);
            ResourceStats::default()
        }
        Err(e) => return Err(DeployError::Backend(format!("cleanup failed: {}", e))),
    };
    result.metrics.cleanup_duration = cleanup.elapsed();
    result.metrics.resources_freed = stats;

    if options.health_check {
        backend
            .verify(options)
            .await
            .map_err(|e| DeployError::Backend(format!("health check failed: {}", e)))?;
    }

    Ok(())
}

/// Graceful stop bounded by the rollback timeout, escalating to a forced stop
async fn stop<B>(backend: &mut B, options: &RollbackOptions) -> Result<(), DeployError>
where
    B: RollbackBackend + ?Sized,
{
    if !options.force {
        match tokio::time::timeout(options.timeout, backend.graceful_stop(options.timeout)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) if e.is_not_found() => {
                debug!("Deployment already gone: {}", e);
                return Ok(());
            }
            Ok(Err(e)) => warn!("Graceful stop failed, forcing: {}", e),
            Err(_) => warn!("Graceful stop timed out after {:?}, forcing", options.timeout),
        }
    }

    match tokio::time::timeout(FORCE_STOP_TIMEOUT, backend.force_stop()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_not_found() => Ok(()),
        Ok(Err(e)) => Err(DeployError::Backend(format!("force stop failed: {}", e))),
        Err(_) => Err(DeployError::Timeout(format!(
            "force stop did not finish within {:?}",
            FORCE_STOP_TIMEOUT
        ))),
    }
}

fn transition(fsm: &mut RollbackFsm, event: RollbackEvent) -> Result<(), DeployError> {
    fsm.process(event).map_err(DeployError::Internal)
}

fn advance(fsm: &mut RollbackFsm, event: RollbackEvent) {
    if let Err(e) = fsm.process(event) {
        warn!("{}", e);
    }
}

fn notify_metrics(kind: &str, id: &str, result: &RollbackResult) {
    let event = serde_json::json!({
        "runtime": kind,
        "deployment": id,
        "success": result.success,
        "state": result.state,
        "failed_at": result.failed_at,
        "error": result.error.as_ref().map(|e| e.to_string()),
        "backup_path": result.backup_path,
        "metrics": result.metrics,
    });
    info!(
        target: "ajiruntime::rollback",
        runtime = kind,
        deployment = id,
        success = result.success,
        state = %result.state,
        duration_ms = result.metrics.total_duration.as_millis() as u64,
        event = %event,
        "Rollback finished"
    );
}
