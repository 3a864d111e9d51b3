//! Native runtime: the build's executable as a host process group

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactType;
use crate::build::BuildResult;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::process::{isolate_group, ProcessGroup, Signal};
use crate::runtime::rollback::{
    self, ResourceStats, RollbackBackend, RollbackOptions, RollbackResult,
};
use crate::runtime::{Runtime, RuntimeOptions, RuntimeStatus, RuntimeType};

/// How long a status probe waits for the process to report an exit
pub const STATUS_PROBE: Duration = Duration::from_millis(100);

/// Wait after SIGKILL before a forced stop is reported as stuck
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Wait after SIGKILL during close
const CLOSE_WAIT: Duration = Duration::from_secs(2);

/// Combined stdout and stderr of the deployed process
pub const OUTPUT_LOG: &str = "output.log";

struct NativeDeployment {
    build_id: String,
    child: Child,
    group: ProcessGroup,
    pid: u32,
    deploy_dir: PathBuf,
    start_time: DateTime<Utc>,
    exit: Option<ExitStatus>,
    last_memory: u64,
}

impl NativeDeployment {
    fn reap(&mut self) {
        if self.exit.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit = Some(status);
            }
        }
    }
}

/// Runs the build's executable directly on the host
pub struct NativeRuntime {
    options: RuntimeOptions,
    work_dir: PathBuf,
    backups_dir: PathBuf,
    deployment: Option<NativeDeployment>,
    system: System,
}

impl NativeRuntime {
    pub async fn new(options: RuntimeOptions) -> Result<Self, DeployError> {
        let work_dir = options.work_dir();
        Dir::new(&work_dir).create().await?;
        Ok(Self {
            backups_dir: options.backups_dir(),
            work_dir,
            options,
            deployment: None,
            system: System::new(),
        })
    }

    /// Pid of the deployed process group leader
    pub fn pid(&self) -> Option<u32> {
        self.deployment.as_ref().map(|d| d.pid)
    }

    /// Directory the current deployment runs in
    pub fn deploy_dir(&self) -> Option<&Path> {
        self.deployment.as_ref().map(|d| d.deploy_dir.as_path())
    }

    fn sample(&mut self, pid: u32) -> Option<(u64, f64)> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system
            .process(pid)
            .map(|p| (p.memory(), p.cpu_usage() as f64))
    }

    fn deployment_mut(&mut self) -> Result<&mut NativeDeployment, DeployError> {
        self.deployment
            .as_mut()
            .ok_or_else(|| DeployError::NoDeployment("no process running".to_string()))
    }
}

fn is_log_file(path: &Path) -> bool {
    path.extension().map(|e| e == "log").unwrap_or(false)
}

fn keep_filter(keep_logs: bool) -> impl Fn(&Path) -> bool + Send + 'static {
    move |path: &Path| keep_logs && is_log_file(path)
}

#[async_trait]
impl Runtime for NativeRuntime {
    fn kind(&self) -> RuntimeType {
        RuntimeType::Native
    }

    async fn deploy(&mut self, result: &BuildResult) -> Result<(), DeployError> {
        if self.deployment.is_some() {
            return Err(DeployError::AlreadyDeployed);
        }

        let artifact = result
            .artifact(ArtifactType::Executable)
            .ok_or_else(|| DeployError::NoArtifact("executable".to_string()))?;
        let program = tokio::fs::canonicalize(artifact.file_path()).await?;

        let deploy_dir = Dir::new(self.work_dir.join(&result.id));
        deploy_dir.create().await?;

        let spawned = spawn(&program, deploy_dir.path(), &self.options, result);
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = deploy_dir.delete().await;
                return Err(e);
            }
        };

        let Some(pid) = child.id() else {
            let _ = deploy_dir.delete().await;
            return Err(DeployError::Internal("spawned process has no pid".to_string()));
        };

        info!("Deployed {:?} as pid {} in {:?}", program, pid, deploy_dir.path());
        self.deployment = Some(NativeDeployment {
            build_id: result.id.clone(),
            child,
            group: ProcessGroup::from_leader(pid),
            pid,
            deploy_dir: deploy_dir.path().to_path_buf(),
            start_time: Utc::now(),
            exit: None,
            last_memory: 0,
        });
        Ok(())
    }

    async fn status(&mut self) -> Result<RuntimeStatus, DeployError> {
        let dep = self.deployment_mut()?;
        if let Some(exit) = dep.exit {
            return Err(DeployError::Backend(format!("process has terminated: {}", exit)));
        }

        match tokio::time::timeout(STATUS_PROBE, dep.child.wait()).await {
            Ok(Ok(exit)) => {
                dep.exit = Some(exit);
                return Err(DeployError::Backend(format!("process has terminated: {}", exit)));
            }
            Ok(Err(e)) => {
                return Err(DeployError::Backend(format!("failed to check process: {}", e)));
            }
            Err(_) => {}
        }

        let pid = dep.pid;
        let start_time = dep.start_time;
        let (memory, cpu) = self.sample(pid).unwrap_or_default();
        if let Some(dep) = self.deployment.as_mut() {
            dep.last_memory = memory;
        }

        Ok(RuntimeStatus {
            state: "running".to_string(),
            pid: pid as i64,
            container_id: None,
            memory,
            cpu,
            restarts: 0,
            last_error: String::new(),
            start_time: Some(start_time),
        })
    }

    fn rollback_options(&self) -> RollbackOptions {
        self.options.rollback_options()
    }

    async fn rollback_with(&mut self, options: &RollbackOptions) -> RollbackResult {
        let backups_dir = self.backups_dir.clone();
        rollback::execute(self, options, &backups_dir).await
    }

    async fn close(&mut self) -> Result<(), DeployError> {
        let Some(mut dep) = self.deployment.take() else {
            return Ok(());
        };

        let mut errs = Vec::new();
        let group = dep.group;
        match group.signal(Signal::Kill) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => errs.push(e),
        }
        if let Err(e) = group.wait_gone(CLOSE_WAIT, || dep.reap()).await {
            errs.push(e);
        }
        debug!("Closed native deployment {}", dep.build_id);
        DeployError::aggregate(errs)
    }
}

fn spawn(
    program: &Path,
    dir: &Path,
    options: &RuntimeOptions,
    result: &BuildResult,
) -> Result<Child, DeployError> {
    let log = std::fs::File::create(dir.join(OUTPUT_LOG))?;
    let mut cmd = Command::new(program);
    cmd.current_dir(dir)
        .envs(&options.env_vars)
        .envs(&result.spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));
    isolate_group(&mut cmd);
    Ok(cmd.spawn()?)
}

#[async_trait]
impl RollbackBackend for NativeRuntime {
    fn backend_name(&self) -> &'static str {
        "native"
    }

    fn deployment_id(&self) -> Option<String> {
        self.deployment.as_ref().map(|d| d.pid.to_string())
    }

    /// A plain process has no state worth saving
    fn has_backup_state(&self) -> bool {
        false
    }

    async fn backup(&mut self, _backup_dir: &Path) -> Result<(), DeployError> {
        Ok(())
    }

    async fn graceful_stop(&mut self, timeout: Duration) -> Result<(), DeployError> {
        let dep = self.deployment_mut()?;
        let group = dep.group;
        group.terminate(true, timeout, || dep.reap()).await
    }

    async fn force_stop(&mut self) -> Result<(), DeployError> {
        let dep = self.deployment_mut()?;
        let group = dep.group;
        group.terminate(false, KILL_WAIT, || dep.reap()).await
    }

    async fn cleanup(&mut self, options: &RollbackOptions) -> Result<ResourceStats, DeployError> {
        let dep = self.deployment_mut()?;
        let mut stats = ResourceStats {
            memory_freed: dep.last_memory,
            ..Default::default()
        };
        if options.cleanup_files {
            let removed = Dir::new(&dep.deploy_dir)
                .remove_files(keep_filter(options.keep_logs))
                .await?;
            stats.files_removed = removed.files_removed;
            stats.disk_space_freed = removed.bytes_freed;
        }
        Ok(stats)
    }

    async fn verify(&mut self, options: &RollbackOptions) -> Result<(), DeployError> {
        let dep = self.deployment_mut()?;
        dep.reap();
        if dep.group.is_alive() {
            return Err(DeployError::Backend(format!(
                "process group {} is still running",
                dep.group.id()
            )));
        }

        if options.cleanup_files {
            let leftover = Dir::new(&dep.deploy_dir)
                .leftover_files(keep_filter(options.keep_logs))
                .await?;
            if !leftover.is_empty() {
                return Err(DeployError::Backend(format!(
                    "{} file(s) left in {:?}",
                    leftover.len(),
                    dep.deploy_dir
                )));
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut dep) = self.deployment.take() {
            dep.reap();
            debug!("Released native deployment {}", dep.build_id);
        }
    }
}

impl Drop for NativeRuntime {
    fn drop(&mut self) {
        if let Some(dep) = self.deployment.as_ref() {
            if let Err(e) = dep.group.signal(Signal::Kill) {
                if !e.is_not_found() {
                    warn!("Failed to kill process group {} on drop: {}", dep.group.id(), e);
                }
            }
        }
    }
}
