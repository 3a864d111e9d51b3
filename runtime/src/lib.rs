//! Ajime Runtime Library
//!
//! Builds deployable artifacts from a source and runs them as a native
//! process, an OCI container, or a systemd service, with bounded rollback.

pub mod artifact;
pub mod build;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod process;
pub mod runtime;
pub mod source;
pub mod storage;
pub mod utils;

pub use build::{new_builder, BuildResult, BuildSpec, BuildStatus, BuildStrategy, Builder};
pub use errors::DeployError;
pub use runtime::{new_runtime, validate_runtime_options, Runtime, RuntimeOptions, RuntimeType};
pub use source::{Source, SourceType};
