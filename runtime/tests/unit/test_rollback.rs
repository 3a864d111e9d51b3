//! Rollback engine tests against a scripted backend

use std::path::Path;
use std::time::Duration;

use ajiruntime::errors::DeployError;
use ajiruntime::runtime::rollback::{
    execute, ResourceStats, RollbackBackend, RollbackOptions, RollbackState,
};
use async_trait::async_trait;

#[derive(Default)]
struct FakeBackend {
    id: Option<String>,
    calls: Vec<&'static str>,
    hang_on_stop: bool,
    stop_not_found: bool,
    fail_cleanup: bool,
    fail_verify: bool,
}

impl FakeBackend {
    fn deployed() -> Self {
        Self {
            id: Some("deploy-1".to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RollbackBackend for FakeBackend {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    fn deployment_id(&self) -> Option<String> {
        self.id.clone()
    }

    async fn backup(&mut self, backup_dir: &Path) -> Result<(), DeployError> {
        self.calls.push("backup");
        tokio::fs::write(backup_dir.join("state.json"), b"{}").await?;
        Ok(())
    }

    async fn graceful_stop(&mut self, _timeout: Duration) -> Result<(), DeployError> {
        self.calls.push("graceful_stop");
        if self.stop_not_found {
            return Err(DeployError::NotFound("process".into()));
        }
        if self.hang_on_stop {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(())
    }

    async fn force_stop(&mut self) -> Result<(), DeployError> {
        self.calls.push("force_stop");
        Ok(())
    }

    async fn cleanup(&mut self, _options: &RollbackOptions) -> Result<ResourceStats, DeployError> {
        self.calls.push("cleanup");
        if self.fail_cleanup {
            return Err(DeployError::Backend("disk on fire".into()));
        }
        Ok(ResourceStats {
            memory_freed: 1024,
            disk_space_freed: 2048,
            files_removed: 3,
            ..Default::default()
        })
    }

    async fn verify(&mut self, _options: &RollbackOptions) -> Result<(), DeployError> {
        self.calls.push("verify");
        if self.fail_verify {
            return Err(DeployError::Backend("still running".into()));
        }
        Ok(())
    }

    fn release(&mut self) {
        self.calls.push("release");
        self.id = None;
    }
}

fn fast_options() -> RollbackOptions {
    RollbackOptions {
        timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_rollback_happy_path() {
    let backups = tempfile::tempdir().unwrap();
    let mut backend = FakeBackend::deployed();

    let result = execute(&mut backend, &fast_options(), backups.path()).await;

    assert!(result.success);
    assert_eq!(result.state, RollbackState::Complete);
    assert!(result.failed_at.is_none());
    assert_eq!(result.metrics.resources_freed.files_removed, 3);
    assert!(result.end_time >= result.start_time);
    assert_eq!(
        backend.calls,
        vec!["backup", "graceful_stop", "cleanup", "verify", "release"]
    );

    let backup = result.backup_path.expect("backup path");
    assert!(backup.join("state.json").exists());
    let name = backup.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("fake-deploy-1-"), "{name}");
}

#[tokio::test]
async fn test_graceful_timeout_escalates_to_force() {
    let backups = tempfile::tempdir().unwrap();
    let mut backend = FakeBackend {
        hang_on_stop: true,
        ..FakeBackend::deployed()
    };

    let started = std::time::Instant::now();
    let result = execute(&mut backend, &fast_options(), backups.path()).await;

    assert!(result.success);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(backend.calls.contains(&"force_stop"));
}

#[tokio::test]
async fn test_force_skips_graceful_stop() {
    let backups = tempfile::tempdir().unwrap();
    let mut backend = FakeBackend::deployed();
    let options = RollbackOptions {
        force: true,
        create_backup: false,
        ..fast_options()
    };

    let result = execute(&mut backend, &options, backups.path()).await;

    assert!(result.success);
    assert!(result.backup_path.is_none());
    assert_eq!(backend.calls, vec!["force_stop", "cleanup", "verify", "release"]);
}

#[tokio::test]
async fn test_already_gone_counts_as_stopped() {
    let backups = tempfile::tempdir().unwrap();
    let mut backend = FakeBackend {
        stop_not_found: true,
        ..FakeBackend::deployed()
    };

    let result = execute(&mut backend, &fast_options(), backups.path()).await;

    assert!(result.success);
    assert!(!backend.calls.contains(&"force_stop"));
}

#[tokio::test]
async fn test_cleanup_failure_records_state() {
    let backups = tempfile::tempdir().unwrap();
    let mut backend = FakeBackend {
        fail_cleanup: true,
        ..FakeBackend::deployed()
    };

    let result = execute(&mut backend, &fast_options(), backups.path()).await;

    assert!(!result.success);
    assert_eq!(result.state, RollbackState::Failed);
    assert_eq!(result.failed_at, Some(RollbackState::Cleanup));
    assert!(!backend.calls.contains(&"verify"));
    // released even on failure
    assert!(backend.id.is_none());

    match result.ok() {
        Err(DeployError::RollbackFailed { state, source }) => {
            assert_eq!(state, RollbackState::Cleanup);
            assert!(source.to_string().contains("cleanup failed"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_health_check_failure() {
    let backups = tempfile::tempdir().unwrap();
    let mut backend = FakeBackend {
        fail_verify: true,
        ..FakeBackend::deployed()
    };

    let result = execute(&mut backend, &fast_options(), backups.path()).await;
    assert!(!result.success);
    assert!(result
        .error
        .as_ref()
        .unwrap()
        .to_string()
        .contains("health check failed"));

    let mut unchecked = FakeBackend {
        fail_verify: true,
        ..FakeBackend::deployed()
    };
    let options = RollbackOptions {
        health_check: false,
        ..fast_options()
    };
    assert!(execute(&mut unchecked, &options, backups.path()).await.success);
    assert!(!unchecked.calls.contains(&"verify"));
}

#[tokio::test]
async fn test_nothing_deployed() {
    let backups = tempfile::tempdir().unwrap();
    let mut backend = FakeBackend::default();

    let result = execute(&mut backend, &fast_options(), backups.path()).await;

    assert!(result.success);
    assert_eq!(result.state, RollbackState::Complete);
    assert!(backend.calls.is_empty());
}
