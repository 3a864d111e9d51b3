//! Shared helpers: a local HTTP server and canned build results

use std::net::SocketAddr;
use std::path::Path;

use ajiruntime::artifact::{Artifact, ArtifactType};
use ajiruntime::build::{BuildResult, BuildSpec, BuildStrategy};
use ajiruntime::source::Source;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

/// Long-running program that exits on SIGTERM
pub const TEST_BIN: &str = "#!/bin/sh\nexec sleep 600\n";

/// Serve `/test-bin`, plus `/missing` answering 404
pub async fn serve_test_bin() -> SocketAddr {
    let router = Router::new()
        .route("/test-bin", get(|| async { TEST_BIN }))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A successful build with a single artifact
pub fn build_result(path: &str, kind: ArtifactType) -> BuildResult {
    let spec = BuildSpec::new(Source::binary("http://127.0.0.1/test-bin"), BuildStrategy::Native);
    let mut result = BuildResult::start(&spec);
    result.succeed(vec![Artifact {
        path: path.to_string(),
        kind,
        checksum: String::new(),
        metadata: Default::default(),
    }]);
    result
}

/// Write an executable shell script
pub fn write_script(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
