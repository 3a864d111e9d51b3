//! Runtime options and factory tests

use std::path::PathBuf;

use ajiruntime::errors::DeployError;
use ajiruntime::runtime::{new_runtime, validate_runtime_options, RuntimeOptions, RuntimeType};
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_validation_rules() {
    assert_ok!(validate_runtime_options(None));

    let dir = tempfile::tempdir().unwrap();
    assert_ok!(validate_runtime_options(Some(&RuntimeOptions {
        work_dir: Some(dir.path().to_path_buf()),
        log_level: "DEBUG".to_string(),
        ..Default::default()
    })));

    for options in [
        RuntimeOptions {
            timeout: chrono::Duration::milliseconds(-1),
            ..Default::default()
        },
        RuntimeOptions {
            max_retries: -3,
            ..Default::default()
        },
        RuntimeOptions {
            log_level: "trace".to_string(),
            ..Default::default()
        },
        RuntimeOptions {
            work_dir: Some(PathBuf::from("/no/such/ajime/dir")),
            ..Default::default()
        },
    ] {
        let err = assert_err!(validate_runtime_options(Some(&options)));
        assert!(matches!(err, DeployError::ValidationError(_)), "{err}");
    }
}

#[test]
fn test_work_dir_must_be_a_directory() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let options = RuntimeOptions {
        work_dir: Some(file.path().to_path_buf()),
        ..Default::default()
    };
    assert_err!(validate_runtime_options(Some(&options)));
}

#[tokio::test]
async fn test_factory_builds_native_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let options = RuntimeOptions {
        work_dir: Some(dir.path().to_path_buf()),
        backups_dir: Some(dir.path().join("backups")),
        ..Default::default()
    };

    let mut runtime = new_runtime(RuntimeType::Native, Some(options)).await.unwrap();
    assert_eq!(runtime.kind(), RuntimeType::Native);

    // No deployment yet
    assert!(matches!(runtime.status().await, Err(DeployError::NoDeployment(_))));
    let rollback = runtime.rollback().await.unwrap();
    assert!(rollback.success);
    assert_ok!(runtime.close().await);
}

#[tokio::test]
async fn test_factory_rejects_invalid_options_before_connecting() {
    let options = RuntimeOptions {
        max_retries: -1,
        ..Default::default()
    };
    // Validation runs first, so no docker daemon is needed to see the error
    let err = new_runtime(RuntimeType::Oci, Some(options)).await.err().unwrap();
    assert!(matches!(err, DeployError::ValidationError(_)));
}
