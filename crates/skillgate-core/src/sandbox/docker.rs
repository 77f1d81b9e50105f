//! [`ContainerRuntime`] backed by the `docker` CLI.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use super::container::{
    ContainerExit, ContainerId, ContainerRuntime, ContainerSpec, INPUT_MOUNT, OUTPUT_MOUNT,
    SRC_MOUNT,
};
use super::error::{SandboxError, SandboxResult};
use crate::manifest::ResourceLimits;

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> SandboxResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to spawn {}: {e}", self.binary)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Arguments for `docker create`.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let limits = &spec.limits;
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        spec.name.clone(),
        "--label".into(),
        "skillgate=1".into(),
        "--network".into(),
        if spec.network { "bridge" } else { "none" }.into(),
        "--read-only".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--pids-limit".into(),
        spec.pids_limit.to_string(),
        "--memory".into(),
        format!("{}m", limits.memory_mb),
        "--memory-swap".into(),
        format!("{}m", limits.memory_mb),
        "--cpus".into(),
        format!("{:.3}", f64::from(limits.cpu_millis) / 1000.0),
        "--tmpfs".into(),
        "/tmp:rw,noexec,nosuid,size=16m".into(),
        "--mount".into(),
        bind(&spec.input_dir, INPUT_MOUNT, true),
        "--mount".into(),
        bind(&spec.src_dir, SRC_MOUNT, true),
        "--mount".into(),
        bind(&spec.output_dir, OUTPUT_MOUNT, false),
        "--workdir".into(),
        SRC_MOUNT.into(),
    ];
    for (name, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{name}={value}"));
    }
    let mut entry = spec.entrypoint.iter();
    if let Some(program) = entry.next() {
        args.push("--entrypoint".into());
        args.push(program.clone());
    }
    args.push(spec.image.clone());
    args.extend(entry.cloned());
    args
}

fn bind(source: &std::path::Path, target: &str, readonly: bool) -> String {
    let mut m = format!("type=bind,source={},target={target}", source.display());
    if readonly {
        m.push_str(",readonly");
    }
    m
}

/// Read at most `cap` bytes, then drain the rest so the writer never blocks.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: u64) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    (&mut reader).take(cap).read_to_end(&mut buf).await?;
    let rest = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok((buf, rest > 0))
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> SandboxResult<ContainerId> {
        let id = self.run(&create_args(spec)).await?;
        debug!(container = %id, image = %spec.image, "container created");
        Ok(ContainerId(id))
    }

    async fn start_and_wait(
        &self,
        id: &ContainerId,
        limits: &ResourceLimits,
    ) -> SandboxResult<ContainerExit> {
        let mut child = Command::new(&self.binary)
            .args(["start", "--attach", id.0.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Runtime(format!("failed to spawn {}: {e}", self.binary)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Runtime("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Runtime("stderr not captured".into()))?;

        let (out, err, status) = tokio::try_join!(
            read_capped(stdout, limits.stdout_bytes),
            read_capped(stderr, limits.stderr_bytes),
            child.wait(),
        )
        .map_err(|e| SandboxError::Runtime(e.to_string()))?;

        Ok(ContainerExit {
            code: status.code().map(i64::from).unwrap_or(-1),
            stdout: out.0,
            stdout_truncated: out.1,
            stderr: err.0,
            stderr_truncated: err.1,
        })
    }

    async fn kill(&self, id: &ContainerId) -> SandboxResult<()> {
        self.run(&["kill".to_string(), id.0.clone()]).await.map(|_| ())
    }

    async fn destroy(&self, id: &ContainerId) -> SandboxResult<()> {
        self.run(&["rm".to_string(), "-f".to_string(), id.0.clone()])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(network: bool) -> ContainerSpec {
        ContainerSpec {
            name: "skillgate-abc".into(),
            image: format!("runner@sha256:{}", "a".repeat(64)),
            entrypoint: vec!["python3".into(), "/skill/src/main.py".into()],
            env: vec![("LANG".into(), "C.UTF-8".into())],
            input_dir: PathBuf::from("/tmp/s/input"),
            src_dir: PathBuf::from("/tmp/s/src"),
            output_dir: PathBuf::from("/tmp/s/output"),
            network,
            limits: ResourceLimits {
                cpu_millis: 500,
                memory_mb: 128,
                ..ResourceLimits::default()
            },
            pids_limit: 64,
        }
    }

    fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_create_args_isolation_flags() {
        let args = create_args(&spec(false));
        assert_eq!(flag(&args, "--network"), Some("none"));
        assert_eq!(flag(&args, "--memory"), Some("128m"));
        assert_eq!(flag(&args, "--cpus"), Some("0.500"));
        assert_eq!(flag(&args, "--cap-drop"), Some("ALL"));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"type=bind,source=/tmp/s/input,target=/skill/input,readonly".to_string()));
        assert!(args.contains(&"type=bind,source=/tmp/s/output,target=/skill/output".to_string()));
        assert_eq!(flag(&args, "--env"), Some("LANG=C.UTF-8"));
    }

    #[test]
    fn test_create_args_entrypoint_split() {
        let args = create_args(&spec(true));
        assert_eq!(flag(&args, "--network"), Some("bridge"));
        assert_eq!(flag(&args, "--entrypoint"), Some("python3"));
        let n = args.len();
        assert!(args[n - 2].starts_with("runner@sha256:"));
        assert_eq!(args[n - 1], "/skill/src/main.py");
    }

    #[tokio::test]
    async fn test_read_capped_truncates() {
        let data: &[u8] = b"0123456789";
        let (buf, truncated) = read_capped(data, 4).await.unwrap();
        assert_eq!(buf, b"0123");
        assert!(truncated);

        let (buf, truncated) = read_capped(data, 64).await.unwrap();
        assert_eq!(buf.len(), 10);
        assert!(!truncated);
    }
}
