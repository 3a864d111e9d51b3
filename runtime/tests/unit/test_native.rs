//! Native build and deploy, end to end against a local HTTP server

use std::time::Duration;

use ajiruntime::artifact::ArtifactType;
use ajiruntime::build::{BuildSpec, BuildStrategy, Builder, NativeBuilder};
use ajiruntime::errors::DeployError;
use ajiruntime::runtime::native::OUTPUT_LOG;
use ajiruntime::runtime::rollback::RollbackState;
use ajiruntime::runtime::{NativeRuntime, Runtime, RuntimeOptions, RuntimeType};
use ajiruntime::source::Source;

use crate::fixtures::{build_result, serve_test_bin, write_script};

fn runtime_options(root: &std::path::Path) -> RuntimeOptions {
    RuntimeOptions {
        timeout: chrono::Duration::seconds(5),
        work_dir: Some(root.join("run")),
        backups_dir: Some(root.join("backups")),
        ..Default::default()
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_build_deploy_rollback() {
    let addr = serve_test_bin().await;
    let root = tempfile::tempdir().unwrap();

    let builder = NativeBuilder::new()
        .unwrap()
        .with_work_dir(root.path().join("work"))
        .with_output_dir(root.path().join("out"));
    let spec = BuildSpec::new(
        Source::binary(format!("http://{}/test-bin", addr)),
        BuildStrategy::Native,
    )
    .with_commands(["chmod +x test-bin"]);

    let build = builder.build(&spec).await.unwrap();
    let executable = build.artifact(ArtifactType::Executable).expect("executable artifact");
    assert!(executable.path.ends_with("test-bin"));
    assert!(executable.file_path().starts_with(root.path().join("out").join(&build.id)));
    assert_eq!(builder.status(&build.id).await.unwrap().id, build.id);

    let mut runtime = NativeRuntime::new(runtime_options(root.path())).await.unwrap();
    assert_eq!(runtime.kind(), RuntimeType::Native);
    runtime.deploy(&build).await.unwrap();
    assert!(matches!(runtime.deploy(&build).await, Err(DeployError::AlreadyDeployed)));

    let status = runtime.status().await.unwrap();
    assert_eq!(status.state, "running");
    assert!(status.pid > 0);
    let deploy_dir = runtime.deploy_dir().unwrap().to_path_buf();
    assert!(deploy_dir.join(OUTPUT_LOG).exists());

    let rollback = runtime.rollback().await.unwrap();
    assert!(rollback.success);
    assert_eq!(rollback.state, RollbackState::Complete);
    assert!(rollback.failed_at.is_none());
    assert!(rollback.metrics.total_duration < Duration::from_secs(5));
    // the log survives cleanup
    assert!(deploy_dir.join(OUTPUT_LOG).exists());

    assert!(matches!(runtime.status().await, Err(DeployError::NoDeployment(_))));
    runtime.close().await.unwrap();
    runtime.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_status_reports_exit() {
    let root = tempfile::tempdir().unwrap();
    let program = root.path().join("quick");
    write_script(&program, "#!/bin/sh\nexit 3\n");

    let mut runtime = NativeRuntime::new(runtime_options(root.path())).await.unwrap();
    runtime
        .deploy(&build_result(program.to_str().unwrap(), ArtifactType::Executable))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let err = runtime.status().await.unwrap_err();
    assert!(err.to_string().contains("process has terminated"), "{err}");

    // the group is gone already; rollback still completes
    assert!(runtime.rollback().await.unwrap().success);
}

#[cfg(unix)]
#[tokio::test]
async fn test_close_kills_running_process() {
    let root = tempfile::tempdir().unwrap();
    let program = root.path().join("stubborn");
    write_script(&program, "#!/bin/sh\ntrap '' TERM\nexec sleep 600\n");

    let mut runtime = NativeRuntime::new(runtime_options(root.path())).await.unwrap();
    runtime
        .deploy(&build_result(program.to_str().unwrap(), ArtifactType::Executable))
        .await
        .unwrap();
    let pid = runtime.pid().unwrap() as i32;

    runtime.close().await.unwrap();
    assert!(runtime.pid().is_none());
    // signal 0 probes existence
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    assert!(!alive);
}

#[tokio::test]
async fn test_deploy_requires_executable() {
    let root = tempfile::tempdir().unwrap();
    let mut runtime = NativeRuntime::new(runtime_options(root.path())).await.unwrap();

    let err = runtime
        .deploy(&build_result("registry/app:1", ArtifactType::Oci))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NoArtifact(_)));
    assert!(runtime.pid().is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_status_after_process_killed() {
    let root = tempfile::tempdir().unwrap();
    let program = root.path().join("server");
    write_script(&program, "#!/bin/sh\nexec sleep 600\n");

    let mut runtime = NativeRuntime::new(runtime_options(root.path())).await.unwrap();
    runtime
        .deploy(&build_result(program.to_str().unwrap(), ArtifactType::Executable))
        .await
        .unwrap();
    assert!(runtime.status().await.is_ok());

    let pid = runtime.pid().unwrap() as i32;
    assert_eq!(unsafe { libc::kill(pid, libc::SIGKILL) }, 0);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = runtime.status().await.unwrap_err();
    assert!(err.to_string().contains("process has terminated"), "{err}");
    assert!(runtime.rollback().await.unwrap().success);
}

#[cfg(unix)]
#[tokio::test]
async fn test_tiny_timeout_escalates_to_kill() {
    let root = tempfile::tempdir().unwrap();
    let program = root.path().join("stubborn");
    write_script(&program, "#!/bin/sh\ntrap '' TERM\nexec sleep 600\n");

    let options = RuntimeOptions {
        timeout: chrono::Duration::milliseconds(1),
        ..runtime_options(root.path())
    };
    let mut runtime = NativeRuntime::new(options).await.unwrap();
    runtime
        .deploy(&build_result(program.to_str().unwrap(), ArtifactType::Executable))
        .await
        .unwrap();
    let pid = runtime.pid().unwrap() as i32;

    let result = runtime.rollback().await.unwrap();
    assert!(result.success);
    assert_eq!(result.state, RollbackState::Complete);
    assert!(result.metrics.total_duration < Duration::from_secs(5));
    assert_ne!(unsafe { libc::kill(pid, 0) }, 0);
}

#[tokio::test]
async fn test_rollback_without_deployment() {
    let root = tempfile::tempdir().unwrap();
    let mut runtime = NativeRuntime::new(runtime_options(root.path())).await.unwrap();

    let result = runtime.rollback().await.unwrap();
    assert!(result.success);
    assert_eq!(result.state, RollbackState::Complete);
    assert!(result.backup_path.is_none());
    assert!(!root.path().join("backups").exists());
}

