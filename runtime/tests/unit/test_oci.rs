//! OCI runtime tests against an in-memory container engine

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ajiruntime::artifact::ArtifactType;
use ajiruntime::errors::DeployError;
use ajiruntime::runtime::engine::{ContainerDetails, ContainerEngine, ContainerSpec, ContainerStats};
use ajiruntime::runtime::oci::{BACKUP_EXPORT, BACKUP_METADATA, BUILD_ID_LABEL};
use ajiruntime::runtime::rollback::RollbackState;
use ajiruntime::runtime::{OciRuntime, Runtime, RuntimeOptions};
use ajiruntime::utils::CooldownOptions;
use async_trait::async_trait;

use crate::fixtures::build_result;

#[derive(Default)]
struct EngineState {
    containers: HashMap<String, (ContainerSpec, bool)>,
    calls: Vec<String>,
    pull_failures: u32,
    fail_start: bool,
    hang_stats: bool,
    next_id: u32,
}

#[derive(Clone, Default)]
struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
}

impl FakeEngine {
    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }

    fn missing(id: &str) -> DeployError {
        DeployError::NotFound(format!("no such container: {}", id))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull_image(&self, image: &str) -> Result<(), DeployError> {
        self.record(format!("pull {}", image));
        let mut state = self.state.lock().unwrap();
        if state.pull_failures > 0 {
            state.pull_failures -= 1;
            return Err(DeployError::Backend("registry unavailable".into()));
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DeployError> {
        self.record("create");
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{:0>64}", state.next_id);
        state.containers.insert(id.clone(), (spec.clone(), false));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DeployError> {
        self.record("start");
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(DeployError::Backend("port already allocated".into()));
        }
        match state.containers.get_mut(id) {
            Some(container) => {
                container.1 = true;
                Ok(())
            }
            None => Err(Self::missing(id)),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, DeployError> {
        let state = self.state.lock().unwrap();
        let (spec, running) = state.containers.get(id).ok_or_else(|| Self::missing(id))?;
        Ok(ContainerDetails {
            status: if *running { "running" } else { "exited" }.to_string(),
            running: *running,
            pid: if *running { 4321 } else { 0 },
            restart_count: 0,
            error: String::new(),
            started_at: None,
            raw: serde_json::json!({ "Id": id, "Config": { "Image": spec.image } }),
        })
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, DeployError> {
        let hang = {
            let state = self.state.lock().unwrap();
            state.containers.get(id).ok_or_else(|| Self::missing(id))?;
            state.hang_stats
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(ContainerStats {
            cpu_total: 300,
            precpu_total: 200,
            system_total: 2_000,
            presystem_total: 1_000,
            percpu_count: 0,
            online_cpus: 2,
            memory_usage: 64 * 1024,
        })
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), DeployError> {
        self.record("stop");
        let mut state = self.state.lock().unwrap();
        let container = state.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        container.1 = false;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), DeployError> {
        self.record("kill");
        let mut state = self.state.lock().unwrap();
        let container = state.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        container.1 = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str, _remove_volumes: bool) -> Result<(), DeployError> {
        self.record("remove");
        let mut state = self.state.lock().unwrap();
        state.containers.remove(id).map(|_| ()).ok_or_else(|| Self::missing(id))
    }

    async fn prune_images(&self) -> Result<u64, DeployError> {
        self.record("prune");
        Ok(4096)
    }

    async fn export_container(&self, id: &str, dest: &Path) -> Result<u64, DeployError> {
        self.record("export");
        tokio::fs::write(dest, id.as_bytes()).await?;
        Ok(id.len() as u64)
    }
}

fn runtime(engine: &FakeEngine, root: &Path) -> OciRuntime {
    let options = RuntimeOptions {
        backups_dir: Some(root.join("backups")),
        env_vars: HashMap::from([("REGION".to_string(), "eu".to_string())]),
        labels: HashMap::from([("team".to_string(), "edge".to_string())]),
        ..Default::default()
    };
    OciRuntime::with_engine(Arc::new(engine.clone()), options).with_cooldown(CooldownOptions {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
        max_elapsed: Duration::from_secs(1),
    })
}

#[tokio::test]
async fn test_deploy_status_rollback() {
    let root = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let mut runtime = runtime(&engine, root.path());

    let mut build = build_result("localhost/app:1.0", ArtifactType::Oci);
    build.spec.env.insert("MODE".into(), "prod".into());
    runtime.deploy(&build).await.unwrap();

    let id = runtime.container_id().unwrap().to_string();
    {
        let state = engine.state.lock().unwrap();
        let (spec, running) = &state.containers[&id];
        assert!(*running);
        assert_eq!(spec.image, "localhost/app:1.0");
        assert!(spec.env.contains(&"REGION=eu".to_string()));
        assert!(spec.env.contains(&"MODE=prod".to_string()));
        assert_eq!(spec.labels[BUILD_ID_LABEL], build.id);
        assert_eq!(spec.labels["team"], "edge");
    }

    let status = runtime.status().await.unwrap();
    assert_eq!(status.state, "running");
    assert_eq!(status.pid, 4321);
    assert_eq!(status.container_id.as_deref(), Some(id.as_str()));
    assert_eq!(status.memory, 64 * 1024);
    assert!((status.cpu - 20.0).abs() < 1e-9);

    let result = runtime.rollback().await.unwrap();
    assert!(result.success);
    assert_eq!(result.state, RollbackState::Complete);
    assert_eq!(result.metrics.resources_freed.disk_space_freed, 4096);
    assert_eq!(result.metrics.resources_freed.connections_closed, 0);
    let backup = result.backup_path.unwrap();
    assert!(backup.join(BACKUP_EXPORT).exists());
    assert!(backup.join(BACKUP_METADATA).exists());
    assert!(backup
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with(&format!("oci-{}-", &id[..12])));

    assert!(engine.state.lock().unwrap().containers.is_empty());
    assert!(runtime.container_id().is_none());
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn test_pull_is_retried() {
    let root = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    engine.state.lock().unwrap().pull_failures = 2;
    let mut runtime = runtime(&engine, root.path());

    runtime
        .deploy(&build_result("localhost/app:1.0", ArtifactType::Oci))
        .await
        .unwrap();
    let pulls = engine.calls().iter().filter(|c| c.starts_with("pull")).count();
    assert_eq!(pulls, 3);
}

#[tokio::test]
async fn test_pull_gives_up_after_max_retries() {
    let root = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    engine.state.lock().unwrap().pull_failures = 10;
    let mut runtime = runtime(&engine, root.path());

    let err = runtime
        .deploy(&build_result("localhost/app:1.0", ArtifactType::Oci))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("after 3 attempt(s)"), "{err}");
    assert!(runtime.container_id().is_none());
}

#[tokio::test]
async fn test_failed_start_removes_container() {
    let root = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    engine.state.lock().unwrap().fail_start = true;
    let mut runtime = runtime(&engine, root.path());

    assert!(runtime
        .deploy(&build_result("localhost/app:1.0", ArtifactType::Oci))
        .await
        .is_err());
    assert!(engine.state.lock().unwrap().containers.is_empty());
    assert!(runtime.container_id().is_none());
}

#[tokio::test]
async fn test_close_tolerates_vanished_container() {
    let root = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let mut runtime = runtime(&engine, root.path());
    runtime
        .deploy(&build_result("localhost/app:1.0", ArtifactType::Oci))
        .await
        .unwrap();

    // removed behind the runtime's back
    engine.state.lock().unwrap().containers.clear();
    runtime.close().await.unwrap();
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn test_deploy_requires_image() {
    let root = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let mut runtime = runtime(&engine, root.path());

    let err = runtime
        .deploy(&build_result("/srv/app", ArtifactType::Executable))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NoArtifact(_)));
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_rollback_of_vanished_container() {
    let root = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let mut runtime = runtime(&engine, root.path());
    runtime
        .deploy(&build_result("localhost/app:1.0", ArtifactType::Oci))
        .await
        .unwrap();

    // removed behind the runtime's back
    engine.state.lock().unwrap().containers.clear();

    let result = runtime.rollback().await.unwrap();
    assert!(result.success);
    assert_eq!(result.state, RollbackState::Complete);
    assert!(result.backup_path.is_none());
    assert!(!engine.calls().contains(&"export".to_string()));
    assert!(runtime.container_id().is_none());

    // no half-written backup is left behind
    let backups = root.path().join("backups");
    assert_eq!(std::fs::read_dir(&backups).map(|d| d.count()).unwrap_or(0), 0);
}

#[tokio::test]
async fn test_rollback_without_deployment() {
    let root = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let mut runtime = runtime(&engine, root.path());

    let result = runtime.rollback().await.unwrap();
    assert!(result.success);
    assert_eq!(result.state, RollbackState::Complete);
    assert!(engine.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_status_is_bounded() {
    let root = tempfile::tempdir().unwrap();
    let engine = FakeEngine::default();
    let mut runtime = runtime(&engine, root.path());
    runtime
        .deploy(&build_result("localhost/app:1.0", ArtifactType::Oci))
        .await
        .unwrap();

    engine.state.lock().unwrap().hang_stats = true;
    let err = runtime.status().await.unwrap_err();
    assert!(err.is_timeout(), "{err}");
}

