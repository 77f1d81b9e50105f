//! skillgate-core: capability-gated skill execution
//!
//! ## Layer 1 - Domain
//!
//! Loads capability manifests into an immutable snapshot, binds trust to a
//! canonical security hash, gates every invocation on policy and approval
//! state, and dispatches to builtin, remote or sandboxed plugin providers.
//!
//! ## Key Components
//!
//! - `Orchestrator`: the single `invoke` entry point plus discovery and admin
//! - `ManifestLoader` / `Snapshot`: `skill.toml` discovery and validation
//! - `hash::security_hash`: canonical SHA-256 over the behavioural surface
//! - `PolicyGate`: preflight, access rules, grants and write checkpoints
//! - `ProviderRegistry`: `(kind, tool_id)` dispatch
//! - `SandboxRuntime`: single-use, resource-limited containers

pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod obs;
pub mod orchestrator;
pub mod policy;
pub mod provider;
pub mod sandbox;
pub mod schema;
pub mod telemetry;

pub use config::{ConfigError, SkillgateConfig};
pub use error::{ErrorCode, InvocationError};
pub use manifest::{
    CapabilityManifest, Diagnostic, ManifestError, ManifestLoader, ManifestSummary, SkillEntry,
    Snapshot,
};
pub use orchestrator::{AdminError, InvocationRequest, InvocationResponse, Orchestrator, RetryPolicy};
pub use policy::{AccessRule, AccessRules, Authorization, PolicyGate, RuleAction};
pub use provider::{Handler, Provider, ProviderError, ProviderRegistry};
pub use sandbox::{ContainerRuntime, DockerCli, Preflight, SandboxError, SandboxRuntime};
pub use schema::{SchemaRegistry, SchemaViolation};
pub use telemetry::init_tracing;

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
