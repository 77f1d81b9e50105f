//! Scripted [`ContainerRuntime`] for tests.
//!
//! Counts every lifecycle call and tracks live containers so tests can assert
//! that preflight denials never create one and that timeouts and
//! cancellations never leak one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::container::{ContainerExit, ContainerId, ContainerRuntime, ContainerSpec};
use super::error::{SandboxError, SandboxResult};
use super::runtime::RESULT_FILE;
use crate::manifest::ResourceLimits;

/// What the next container does when started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Exit 0 printing `stdout`.
    Succeed { stdout: String },
    /// Exit 0 after writing `json` to the result file.
    WriteResult { json: String },
    /// Exit 0 after making the result file a symlink to `target`.
    LinkResult { target: PathBuf },
    /// Exit with `code`.
    Exit { code: i64, stderr: String },
    /// Sleep, then exit 0 printing `stdout`.
    Sleep { ms: u64, stdout: String },
    /// Never exit.
    Hang,
    /// `create` itself fails.
    CreateFails,
}

#[derive(Debug)]
pub struct ScriptedRuntime {
    script: Mutex<Script>,
    specs: Mutex<HashMap<String, ContainerSpec>>,
    created: Mutex<Vec<ContainerSpec>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    starts: AtomicUsize,
    kills: AtomicUsize,
    destroys: AtomicUsize,
    peak_live: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            specs: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            peak_live: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(stdout: impl Into<String>) -> Self {
        Self::new(Script::Succeed {
            stdout: stdout.into(),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    fn output_dir(&self, id: &ContainerId) -> SandboxResult<PathBuf> {
        self.specs
            .lock()
            .unwrap()
            .get(&id.0)
            .map(|s| s.output_dir.clone())
            .ok_or_else(|| SandboxError::Runtime(format!("unknown container {id}")))
    }

    /// Specs of every container created so far.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn create(&self, spec: &ContainerSpec) -> SandboxResult<ContainerId> {
        if *self.script.lock().unwrap() == Script::CreateFails {
            return Err(SandboxError::Runtime("image not found".into()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let live = {
            let mut specs = self.specs.lock().unwrap();
            specs.insert(id.clone(), spec.clone());
            specs.len()
        };
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        self.created.lock().unwrap().push(spec.clone());
        Ok(ContainerId(id))
    }

    async fn start_and_wait(
        &self,
        id: &ContainerId,
        _limits: &ResourceLimits,
    ) -> SandboxResult<ContainerExit> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();
        let ok = |stdout: String| ContainerExit {
            code: 0,
            stdout: stdout.into_bytes(),
            ..ContainerExit::default()
        };
        match script {
            Script::Succeed { stdout } => Ok(ok(stdout)),
            Script::WriteResult { json } => {
                std::fs::write(self.output_dir(id)?.join(RESULT_FILE), json)?;
                Ok(ok(String::new()))
            }
            Script::LinkResult { target } => {
                link(&target, &self.output_dir(id)?.join(RESULT_FILE))?;
                Ok(ok(String::new()))
            }
            Script::Exit { code, stderr } => Ok(ContainerExit {
                code,
                stderr: stderr.into_bytes(),
                ..ContainerExit::default()
            }),
            Script::Sleep { ms, stdout } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ok(stdout))
            }
            Script::Hang => std::future::pending().await,
            Script::CreateFails => Err(SandboxError::Runtime("not created".into())),
        }
    }

    async fn kill(&self, _id: &ContainerId) -> SandboxResult<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self, id: &ContainerId) -> SandboxResult<()> {
        if self.specs.lock().unwrap().remove(&id.0).is_some() {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn link(target: &Path, at: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, at)
}

#[cfg(not(unix))]
fn link(_target: &Path, _at: &Path) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}
