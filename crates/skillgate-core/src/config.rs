//! `skillgate.toml` configuration.
//!
//! Every section is optional. Environment overrides are applied after the
//! file is read:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `SKILLGATE_ROOTS` | `roots` (`:`-separated) |
//! | `SKILLGATE_STORE_URL` and friends | `[store]` |
//! | `SKILLGATE_REMOTE_ENDPOINT` | `remote.endpoint` |
//! | `SKILLGATE_MAX_CONTAINERS` | `sandbox.max_concurrent` |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skillgate_state::StoreConfig;
use thiserror::Error;

use crate::policy::AccessRule;
use crate::sandbox::HostLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxSettings {
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u32,
    #[serde(default = "default_max_cpu_millis")]
    pub max_cpu_millis: u32,
    #[serde(default = "default_max_wall_clock_ms")]
    pub max_wall_clock_ms: u64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

fn default_docker_binary() -> String {
    "docker".to_string()
}
fn default_max_concurrent() -> usize {
    4
}
fn default_max_memory_mb() -> u32 {
    1024
}
fn default_max_cpu_millis() -> u32 {
    2000
}
fn default_max_wall_clock_ms() -> u64 {
    60_000
}
fn default_pids_limit() -> u32 {
    64
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            docker_binary: default_docker_binary(),
            max_concurrent: default_max_concurrent(),
            allow_network: false,
            max_memory_mb: default_max_memory_mb(),
            max_cpu_millis: default_max_cpu_millis(),
            max_wall_clock_ms: default_max_wall_clock_ms(),
            pids_limit: default_pids_limit(),
            workdir: None,
        }
    }
}

impl SandboxSettings {
    pub fn host_limits(&self) -> HostLimits {
        HostLimits {
            allow_network: self.allow_network,
            max_memory_mb: self.max_memory_mb,
            max_cpu_millis: self.max_cpu_millis,
            max_wall_clock_ms: self.max_wall_clock_ms,
        }
    }
}

/// Transient-failure retry. At most one retry is ever made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_backoff_ms() -> u64 {
    200
}
fn default_max_retries() -> u32 {
    1
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreflightSettings {
    /// Extra forbidden patterns: rule name to regex.
    #[serde(default)]
    pub patterns: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySettings {
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSettings {
    /// Remote-tool transport is disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
    /// Tool ids served by the endpoint.
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_remote_timeout_ms() -> u64 {
    5_000
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_remote_timeout_ms(),
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiptSettings {
    /// Bytes of rendered output kept on a receipt.
    #[serde(default = "default_preview_bytes")]
    pub preview_bytes: usize,
}

fn default_preview_bytes() -> usize {
    256
}

impl Default for ReceiptSettings {
    fn default() -> Self {
        Self {
            preview_bytes: default_preview_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillgateConfig {
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub preflight: PreflightSettings,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub receipts: ReceiptSettings,
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("skills")]
}

impl Default for SkillgateConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            store: StoreConfig::default(),
            sandbox: SandboxSettings::default(),
            retry: RetrySettings::default(),
            preflight: PreflightSettings::default(),
            policy: PolicySettings::default(),
            remote: RemoteSettings::default(),
            receipts: ReceiptSettings::default(),
        }
    }
}

impl SkillgateConfig {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)?.apply_env().validated()
    }

    /// Parse without touching the environment.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(roots) = var("SKILLGATE_ROOTS") {
            self.roots = roots
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(endpoint) = var("SKILLGATE_REMOTE_ENDPOINT") {
            self.remote.endpoint = Some(endpoint);
        }
        if let Some(n) = var("SKILLGATE_MAX_CONTAINERS").and_then(|v| v.parse().ok()) {
            self.sandbox.max_concurrent = n;
        }
        self.store = self.store.apply_env();
        self
    }

    /// Check cross-field constraints and clamp the retry budget.
    pub fn validated(mut self) -> ConfigResult<Self> {
        if self.sandbox.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                key: "sandbox.max_concurrent".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.roots.is_empty() {
            return Err(ConfigError::Invalid {
                key: "roots".into(),
                reason: "at least one manifest root is required".into(),
            });
        }
        for (name, pattern) in &self.preflight.patterns {
            regex::Regex::new(pattern).map_err(|e| ConfigError::Invalid {
                key: format!("preflight.patterns.{name}"),
                reason: e.to_string(),
            })?;
        }
        self.retry.max_retries = self.retry.max_retries.min(1);
        Ok(self)
    }
}
