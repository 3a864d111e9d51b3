//! Packaging and verified download

use std::time::Duration;

use ajiruntime::artifact::{
    download_artifact, ArtifactInfo, ArtifactManager, ArtifactMetadata, ArtifactType, METADATA_FILE,
};
use ajiruntime::build::{BuildSpec, BuildStrategy};
use ajiruntime::errors::DeployError;
use ajiruntime::source::Source;
use ajiruntime::utils::sha256_file;
use flate2::read::GzDecoder;

use crate::fixtures::write_script;

fn sample_build(dir: &std::path::Path) {
    write_script(&dir.join("server"), "#!/bin/sh\necho serving\n");
    std::fs::create_dir_all(dir.join("static")).unwrap();
    std::fs::write(dir.join("static/index.html"), "<h1>hi</h1>").unwrap();
    std::fs::create_dir_all(dir.join(".git")).unwrap();
    std::fs::write(dir.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
}

fn spec() -> BuildSpec {
    BuildSpec::new(Source::tarball("https://example.com/app.tar.gz"), BuildStrategy::Native)
        .with_version("1.2.3")
}

#[tokio::test]
async fn test_package_and_download_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let build_dir = root.path().join("build");
    std::fs::create_dir_all(&build_dir).unwrap();
    sample_build(&build_dir);

    let manager = ArtifactManager::new(root.path().join("artifacts")).await.unwrap();
    let info = manager.package(&build_dir, &spec()).await.unwrap();
    assert_eq!(info.kind, ArtifactType::Archive);
    assert!(info.url.ends_with(".tar.gz"));
    assert_eq!(info.digest, sha256_file(std::path::Path::new(&info.url)).await.unwrap());

    let downloaded = download_artifact(&info, &root.path().join("downloads")).await.unwrap();
    assert_eq!(sha256_file(&downloaded).await.unwrap(), info.digest);

    // the manifest lists every packaged file except VCS metadata
    let file = std::fs::File::open(&downloaded).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let unpacked = root.path().join("unpacked");
    archive.unpack(&unpacked).unwrap();
    let raw = std::fs::read_to_string(unpacked.join(METADATA_FILE)).unwrap();
    let manifest: ArtifactMetadata = serde_json::from_str(&raw).unwrap();

    assert_eq!(manifest.version, "1.2.3");
    let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert!(paths.contains(&"server"));
    assert!(paths.contains(&"static/index.html"));
    assert!(!paths.iter().any(|p| p.starts_with(".git")));
    assert!(manifest.files.iter().find(|f| f.path == "server").unwrap().executable);
    assert_eq!(manifest.checksums.len(), manifest.files.len());
}

#[tokio::test]
async fn test_uncompressed_bundle() {
    let root = tempfile::tempdir().unwrap();
    let build_dir = root.path().join("build");
    std::fs::create_dir_all(&build_dir).unwrap();
    sample_build(&build_dir);

    let manager = ArtifactManager::new(root.path().join("artifacts"))
        .await
        .unwrap()
        .with_compression(false);
    let info = manager.package(&build_dir, &spec()).await.unwrap();

    assert_eq!(info.kind, ArtifactType::Directory);
    let bundle = std::path::Path::new(&info.url);
    assert!(bundle.join(METADATA_FILE).exists());
    assert_eq!(info.digest, sha256_file(&bundle.join(METADATA_FILE)).await.unwrap());

    // a directory bundle is not a single downloadable file
    let err = download_artifact(&info, &root.path().join("downloads")).await.unwrap_err();
    assert!(matches!(err, DeployError::Unsupported(_)));
}

#[tokio::test]
async fn test_corrupted_download_is_deleted() {
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("bundle.tar.gz");
    std::fs::write(&source, b"not what you expected").unwrap();
    let dest = root.path().join("downloads");

    let info = ArtifactInfo {
        url: source.to_string_lossy().into_owned(),
        digest: "0".repeat(64),
        kind: ArtifactType::Archive,
    };
    let err = download_artifact(&info, &dest).await.unwrap_err();
    assert!(matches!(err, DeployError::Integrity { .. }), "{err}");
    assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
}

#[tokio::test]
async fn test_prune_keeps_fresh_bundles() {
    let root = tempfile::tempdir().unwrap();
    let build_dir = root.path().join("build");
    std::fs::create_dir_all(&build_dir).unwrap();
    sample_build(&build_dir);

    let manager = ArtifactManager::new(root.path().join("artifacts"))
        .await
        .unwrap()
        .with_max_age(Duration::from_secs(3600));
    let info = manager.package(&build_dir, &spec()).await.unwrap();

    let stats = manager.prune_expired().await.unwrap();
    assert_eq!(stats.files_removed, 0);
    assert!(std::path::Path::new(&info.url).exists());
}
