//! Sandbox runtime: isolated, single-use containers for plugin skills.
//!
//! - [`preflight`]: hard-deny static checks, run before any container exists
//! - [`container`]: `ContainerRuntime` trait and `ContainerSpec`
//! - [`docker`]: `DockerCli`, the `docker` CLI backend
//! - [`runtime`]: `SandboxRuntime`, the preflight/create/run/destroy state machine
//! - [`fakes`]: `ScriptedRuntime` for tests

pub mod container;
pub mod docker;
mod error;
pub mod fakes;
pub mod preflight;
pub mod runtime;

pub use container::{ContainerExit, ContainerId, ContainerRuntime, ContainerSpec};
pub use docker::DockerCli;
pub use error::{PreflightViolation, SandboxError, SandboxResult};
pub use preflight::{HostLimits, Preflight, PreflightRule};
pub use runtime::{RuntimeOptions, SandboxRequest, SandboxRuntime};
