//! Container runtime abstraction.

use std::path::PathBuf;

use async_trait::async_trait;

use super::error::SandboxResult;
use crate::manifest::ResourceLimits;

/// Where the staged inputs appear inside the container (read-only).
pub const INPUT_MOUNT: &str = "/skill/input";
/// Where the skill's sources appear inside the container (read-only).
pub const SRC_MOUNT: &str = "/skill/src";
/// The only writable bind mount.
pub const OUTPUT_MOUNT: &str = "/skill/output";

/// Everything needed to create one single-use container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    /// Allowlisted host variables only.
    pub env: Vec<(String, String)>,
    pub input_dir: PathBuf,
    pub src_dir: PathBuf,
    pub output_dir: PathBuf,
    pub network: bool,
    pub limits: ResourceLimits,
    pub pids_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exit status and capped output of a finished container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerExit {
    pub code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// create / run / kill / destroy.
///
/// `start_and_wait` may be dropped mid-flight (timeout or cancellation); the
/// caller then issues `kill` and `destroy` itself.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> SandboxResult<ContainerId>;

    /// Start the container and wait for it to exit, reading at most the
    /// stdout/stderr caps in `limits`.
    async fn start_and_wait(
        &self,
        id: &ContainerId,
        limits: &ResourceLimits,
    ) -> SandboxResult<ContainerExit>;

    async fn kill(&self, id: &ContainerId) -> SandboxResult<()>;

    /// Remove the container and everything it wrote outside the bind mounts.
    async fn destroy(&self, id: &ContainerId) -> SandboxResult<()>;
}
