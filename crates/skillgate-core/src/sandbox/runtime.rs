//! Plugin execution state machine.
//!
//! ```text
//! PREFLIGHT -> (deny) | ACQUIRE -> STAGE -> CREATE -> RUN -> DESTROY
//!                                                     |
//!                                  timeout/deadline -> KILL -> DESTROY
//! ```
//!
//! Containers are single-use. A drop guard destroys the container if the
//! invocation future is dropped between CREATE and DESTROY.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::container::{ContainerExit, ContainerId, ContainerRuntime, ContainerSpec};
use super::error::{SandboxError, SandboxResult};
use super::preflight::Preflight;
use crate::manifest::{PluginSpec, SkillEntry};
use crate::obs;

/// Result file a plugin may write instead of printing to stdout.
pub const RESULT_FILE: &str = "result.json";

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on simultaneously live containers.
    pub max_concurrent: usize,
    pub pids_limit: u32,
    /// Parent directory for staging; the system temp dir when unset.
    pub workdir: Option<PathBuf>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            pids_limit: 64,
            workdir: None,
        }
    }
}

/// One plugin invocation.
#[derive(Debug, Clone, Copy)]
pub struct SandboxRequest<'a> {
    pub invocation_id: &'a str,
    pub agent_id: &'a str,
    pub skill: &'a SkillEntry,
    pub args: &'a Value,
    pub session: &'a Value,
    pub deadline: Option<Instant>,
}

pub struct SandboxRuntime {
    containers: Arc<dyn ContainerRuntime>,
    preflight: Arc<Preflight>,
    permits: Arc<Semaphore>,
    options: RuntimeOptions,
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("options", &self.options)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl SandboxRuntime {
    pub fn new(
        containers: Arc<dyn ContainerRuntime>,
        preflight: Arc<Preflight>,
        options: RuntimeOptions,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        Self {
            containers,
            preflight,
            permits,
            options,
        }
    }

    pub fn preflight(&self) -> &Preflight {
        &self.preflight
    }

    /// Run the skill's plugin once and return its JSON output.
    pub async fn run(&self, req: SandboxRequest<'_>) -> SandboxResult<Value> {
        let skill = req.skill;
        let plugin = skill
            .manifest
            .plugin
            .as_ref()
            .ok_or_else(|| SandboxError::NotAPlugin {
                skill_id: skill.id().to_string(),
            })?;

        // PREFLIGHT: no container exists yet.
        self.preflight
            .check(skill)
            .map_err(SandboxError::PreflightDenied)?;

        // ACQUIRE
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::Runtime("sandbox is shutting down".into()))?;

        let limits = &skill.manifest.isolation.limits;
        let budget = effective_budget(limits.wall_clock_ms, req.deadline);
        if budget.is_zero() {
            return Err(SandboxError::Timeout { limit_ms: 0 });
        }

        // STAGE
        let staging = self.stage(&req)?;
        let spec = self.container_spec(&req, plugin, staging.path());

        // CREATE
        let id = self.containers.create(&spec).await?;
        let mut guard = DestroyGuard::new(self.containers.clone(), id.clone(), req.invocation_id);
        debug!(container = %id, budget_ms = budget.as_millis() as u64, "container created");

        // RUN
        let run = tokio::time::timeout(budget, self.containers.start_and_wait(&id, limits)).await;

        let exit = match run {
            Err(_) => {
                if let Err(e) = self.containers.kill(&id).await {
                    warn!(container = %id, error = %e, "kill after timeout failed");
                }
                self.destroy(&id, req.invocation_id, "timeout").await;
                guard.disarm();
                return Err(SandboxError::Timeout {
                    limit_ms: budget.as_millis() as u64,
                });
            }
            Ok(result) => {
                self.destroy(&id, req.invocation_id, "exited").await;
                guard.disarm();
                result?
            }
        };

        if exit.code != 0 {
            debug!(
                container = %id,
                code = exit.code,
                stderr_bytes = exit.stderr.len(),
                "plugin exited with failure"
            );
            return Err(SandboxError::Crashed { code: exit.code });
        }

        read_output(&exit, &spec.output_dir, limits.output_bytes)
    }

    async fn destroy(&self, id: &ContainerId, invocation_id: &str, reason: &str) {
        match self.containers.destroy(id).await {
            Ok(()) => obs::emit_container_destroyed(invocation_id, &id.0, reason),
            Err(e) => warn!(container = %id, error = %e, "container destroy failed"),
        }
    }

    fn stage(&self, req: &SandboxRequest<'_>) -> SandboxResult<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("skillgate-");
        let dir = match &self.options.workdir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };

        let input = dir.path().join("input");
        let src = dir.path().join("src");
        let output = dir.path().join("output");
        for d in [&input, &src, &output] {
            std::fs::create_dir_all(d)?;
        }

        std::fs::write(input.join("args.json"), serde_json::to_vec(req.args).map_err(std::io::Error::from)?)?;
        let context = json!({
            "invocation_id": req.invocation_id,
            "agent_id": req.agent_id,
            "skill_id": req.skill.id(),
            "session": req.session,
        });
        std::fs::write(input.join("context.json"), serde_json::to_vec(&context).map_err(std::io::Error::from)?)?;

        for blob in &req.skill.sources {
            let target = src.join(&blob.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, &blob.content)?;
        }
        Ok(dir)
    }

    fn container_spec(&self, req: &SandboxRequest<'_>, plugin: &PluginSpec, root: &Path) -> ContainerSpec {
        let isolation = &req.skill.manifest.isolation;
        let env = isolation
            .env_allowlist
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect();
        ContainerSpec {
            name: format!("skillgate-{}", req.invocation_id),
            image: plugin.image.clone(),
            entrypoint: plugin.entrypoint.clone(),
            env,
            input_dir: root.join("input"),
            src_dir: root.join("src"),
            output_dir: root.join("output"),
            network: isolation.network,
            limits: isolation.limits.clone(),
            pids_limit: self.options.pids_limit,
        }
    }
}

/// The wall-clock limit, shortened by the caller deadline.
fn effective_budget(wall_clock_ms: u64, deadline: Option<Instant>) -> Duration {
    let wall = Duration::from_millis(wall_clock_ms);
    match deadline {
        Some(d) => wall.min(d.saturating_duration_since(Instant::now())),
        None => wall,
    }
}

/// Prefer `output/result.json`; fall back to stdout.
///
/// The output mount is writable from inside the container, so the result
/// file must be a regular file that resolves inside `output_dir`.
fn read_output(exit: &ContainerExit, output_dir: &Path, output_cap: u64) -> SandboxResult<Value> {
    let invalid = |reason: String| SandboxError::InvalidOutput { reason };

    let result_file = output_dir.join(RESULT_FILE);
    match std::fs::symlink_metadata(&result_file) {
        Ok(meta) => {
            if !meta.file_type().is_file() {
                return Err(invalid(format!("{RESULT_FILE} is not a regular file")));
            }
            let resolved = result_file.canonicalize()?;
            if !resolved.starts_with(output_dir.canonicalize()?) {
                return Err(invalid(format!("{RESULT_FILE} resolves outside the output mount")));
            }
            if meta.len() > output_cap {
                return Err(invalid(format!(
                    "{RESULT_FILE} is {} bytes, limit {output_cap}",
                    meta.len()
                )));
            }
            let mut bytes = Vec::new();
            std::fs::File::open(&resolved)?
                .take(output_cap + 1)
                .read_to_end(&mut bytes)?;
            if bytes.len() as u64 > output_cap {
                return Err(invalid(format!("{RESULT_FILE} exceeds limit {output_cap}")));
            }
            return serde_json::from_slice(&bytes)
                .map_err(|e| invalid(format!("{RESULT_FILE}: {e}")));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if exit.stdout_truncated {
        return Err(invalid("stdout exceeded its byte limit".to_string()));
    }
    let text = String::from_utf8_lossy(&exit.stdout);
    let text = text.trim();
    if text.is_empty() {
        return Err(invalid("plugin produced no output".to_string()));
    }
    serde_json::from_str(text).map_err(|e| invalid(format!("stdout: {e}")))
}

/// Kills and destroys the container from a background task if dropped armed.
struct DestroyGuard {
    containers: Arc<dyn ContainerRuntime>,
    id: Option<ContainerId>,
    invocation_id: String,
}

impl DestroyGuard {
    fn new(containers: Arc<dyn ContainerRuntime>, id: ContainerId, invocation_id: &str) -> Self {
        Self {
            containers,
            id: Some(id),
            invocation_id: invocation_id.to_string(),
        }
    }

    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for DestroyGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %id, "no runtime to clean up cancelled container");
            return;
        };
        let containers = self.containers.clone();
        let invocation_id = std::mem::take(&mut self.invocation_id);
        handle.spawn(async move {
            let _ = containers.kill(&id).await;
            match containers.destroy(&id).await {
                Ok(()) => obs::emit_container_destroyed(&invocation_id, &id.0, "cancelled"),
                Err(e) => warn!(container = %id, error = %e, "cleanup of cancelled container failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_uses_tighter_bound() {
        assert_eq!(effective_budget(1000, None), Duration::from_millis(1000));
        let soon = Instant::now() + Duration::from_millis(100);
        assert!(effective_budget(1000, Some(soon)) <= Duration::from_millis(100));
        let past = Instant::now() - Duration::from_millis(1);
        assert!(effective_budget(1000, Some(past)).is_zero());
    }

    #[test]
    fn test_result_file_preferred_over_stdout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RESULT_FILE), br#"{"from": "file"}"#).unwrap();
        let exit = ContainerExit {
            stdout: br#"{"from": "stdout"}"#.to_vec(),
            ..ContainerExit::default()
        };
        assert_eq!(read_output(&exit, dir.path(), 1024).unwrap(), json!({"from": "file"}));
    }

    #[test]
    fn test_oversized_result_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RESULT_FILE), br#"{"x": "0123456789"}"#).unwrap();
        let err = read_output(&ContainerExit::default(), dir.path(), 4).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidOutput { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_result_file_rejected() {
        let host = tempfile::tempdir().unwrap();
        let secret = host.path().join("secret.json");
        std::fs::write(&secret, br#"{"host": "secret"}"#).unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&secret, dir.path().join(RESULT_FILE)).unwrap();

        match read_output(&ContainerExit::default(), dir.path(), 1024) {
            Err(SandboxError::InvalidOutput { reason }) => assert!(reason.contains("regular file")),
            other => panic!("expected InvalidOutput, got {other:?}"),
        }
    }

    #[test]
    fn test_result_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(RESULT_FILE)).unwrap();
        assert!(matches!(
            read_output(&ContainerExit::default(), dir.path(), 1024),
            Err(SandboxError::InvalidOutput { .. })
        ));
    }

    #[test]
    fn test_truncated_stdout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exit = ContainerExit {
            stdout: b"{".to_vec(),
            stdout_truncated: true,
            ..ContainerExit::default()
        };
        assert!(matches!(
            read_output(&exit, dir.path(), 1024),
            Err(SandboxError::InvalidOutput { .. })
        ));
    }
}
