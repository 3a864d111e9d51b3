//! Builder tests with a local HTTP server and stand-in CLIs

use ajiruntime::artifact::ArtifactType;
use ajiruntime::build::{
    new_builder, BuildSpec, BuildStatus, BuildStrategy, Builder, NativeBuilder, NixpackBuilder,
    OciBuilder,
};
use ajiruntime::errors::DeployError;
use ajiruntime::source::Source;

use crate::fixtures::{serve_test_bin, write_script};

fn source(addr: std::net::SocketAddr, path: &str) -> Source {
    Source::binary(format!("http://{}/{}", addr, path))
}

/// Shell script that appends its arguments to `log`
fn recording_cli(dir: &std::path::Path, name: &str, log: &std::path::Path) -> std::path::PathBuf {
    let bin = dir.join(name);
    write_script(&bin, &format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display()));
    bin
}

#[tokio::test]
async fn test_native_build_fails_on_http_error() {
    let addr = serve_test_bin().await;
    let root = tempfile::tempdir().unwrap();
    let builder = NativeBuilder::new()
        .unwrap()
        .with_work_dir(root.path().join("work"))
        .with_output_dir(root.path().join("out"));

    let spec = BuildSpec::new(source(addr, "missing"), BuildStrategy::Native);
    let err = builder.build(&spec).await.unwrap_err();
    assert!(matches!(err.cause(), DeployError::SourceFetch(_)), "{err}");
    assert!(err.to_string().contains("404"), "{err}");

    // the failed result comes back to the caller and is recorded
    let failed = err.build_result().expect("failed build result");
    assert_eq!(failed.status, BuildStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("404"));
    assert!(failed.end_time.is_some());
    assert_eq!(builder.status(&failed.id).await.unwrap().status, BuildStatus::Failed);

    // the temporary build directory is gone
    assert_eq!(std::fs::read_dir(root.path().join("work")).unwrap().count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_native_build_stops_at_failing_command() {
    let addr = serve_test_bin().await;
    let root = tempfile::tempdir().unwrap();
    let builder = NativeBuilder::new()
        .unwrap()
        .with_work_dir(root.path().join("work"))
        .with_output_dir(root.path().join("out"));

    let spec = BuildSpec::new(source(addr, "test-bin"), BuildStrategy::Native)
        .with_commands(["echo compiling", "echo broken >&2; exit 7", "touch never"]);
    let err = builder.build(&spec).await.unwrap_err();
    match err.cause() {
        DeployError::CommandFailed { command, output } => {
            assert_eq!(command, "echo broken >&2; exit 7");
            assert!(output.contains("broken"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let failed = err.build_result().unwrap();
    assert_eq!(failed.status, BuildStatus::Failed);
    assert!(failed.artifacts.is_empty());
    // only the steps that ran left logs
    assert_eq!(failed.logs.len(), 2);
}

#[tokio::test]
async fn test_status_of_unknown_build() {
    let builder = NativeBuilder::new().unwrap();
    let err = builder.status("no-such-build").await.unwrap_err();
    assert!(err.is_not_found());
}

#[cfg(unix)]
#[tokio::test]
async fn test_oci_builder_builds_and_pushes() {
    let addr = serve_test_bin().await;
    let root = tempfile::tempdir().unwrap();
    let log = root.path().join("docker.log");
    let docker = recording_cli(root.path(), "docker", &log);

    let builder = OciBuilder::new()
        .unwrap()
        .with_docker_bin(&docker)
        .with_registry("registry.local:5000", true)
        .with_work_dir(root.path().join("work"));
    let spec = BuildSpec::new(source(addr, "test-bin"), BuildStrategy::Oci)
        .with_commands(["chmod +x test-bin"]);

    let result = builder.build(&spec).await.unwrap();
    let image = result.artifact(ArtifactType::Oci).unwrap();
    assert_eq!(image.path, format!("registry.local:5000/{}:latest", result.id));
    assert_eq!(image.metadata["registry"], "registry.local:5000");

    let calls = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = calls.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("build -f "));
    assert!(lines[0].contains(&format!("-t {}", image.path)));
    assert_eq!(lines[1], format!("push {}", image.path));

    assert!(matches!(builder.status(&result.id).await, Err(DeployError::Unsupported(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn test_nixpack_builder_names_image() {
    let addr = serve_test_bin().await;
    let root = tempfile::tempdir().unwrap();
    let log = root.path().join("nixpacks.log");
    let nixpacks = recording_cli(root.path(), "nixpacks", &log);

    let builder = NixpackBuilder::new()
        .unwrap()
        .with_nixpacks_bin(&nixpacks)
        .with_work_dir(root.path().join("work"));
    let spec = BuildSpec::new(source(addr, "test-bin"), BuildStrategy::Nixpack)
        .with_config("name", "edge-app")
        .with_version("2.0");

    let result = builder.build(&spec).await.unwrap();
    assert_eq!(result.artifact(ArtifactType::Oci).unwrap().path, "edge-app:2.0");

    let calls = std::fs::read_to_string(&log).unwrap();
    assert!(calls.starts_with("build "));
    assert!(calls.contains("--name edge-app"));
}

#[test]
fn test_builder_factory() {
    for strategy in [BuildStrategy::Native, BuildStrategy::Oci, BuildStrategy::Nixpack] {
        assert_eq!(new_builder(strategy).unwrap().strategy(), strategy);
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_nixpack_failure_returns_failed_result() {
    let addr = serve_test_bin().await;
    let root = tempfile::tempdir().unwrap();
    let nixpacks = root.path().join("nixpacks");
    write_script(&nixpacks, "#!/bin/sh\necho 'no provider matched' >&2\nexit 1\n");

    let builder = NixpackBuilder::new()
        .unwrap()
        .with_nixpacks_bin(&nixpacks)
        .with_work_dir(root.path().join("work"));
    let spec = BuildSpec::new(source(addr, "test-bin"), BuildStrategy::Nixpack);

    let err = builder.build(&spec).await.unwrap_err();
    assert!(matches!(err.cause(), DeployError::CommandFailed { .. }), "{err}");
    let failed = err.build_result().unwrap();
    assert_eq!(failed.status, BuildStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("no provider matched"));
}
