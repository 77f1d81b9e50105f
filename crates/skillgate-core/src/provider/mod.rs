//! Provider registry: `(kind, tool_id)` to handler dispatch.
//!
//! Each [`Provider`] backend owns one [`ProviderKind`] and hands out
//! [`Handler`]s for the tool ids it serves. The registry is a plain lookup
//! table; adding a kind means registering another backend.
//!
//! - [`builtin`] runs in-process, synchronously
//! - [`remote`] goes through a [`remote::RemoteTransport`]
//! - [`plugin`] always goes through the [`crate::sandbox::SandboxRuntime`]

pub mod builtin;
mod error;
pub mod plugin;
pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::InvocationError;
use crate::manifest::{ProviderKind, ProviderRef, SkillEntry};

pub use error::{ProviderError, ProviderResult};

/// Everything a handler needs for one attempt.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub invocation_id: String,
    pub agent_id: String,
    pub skill: Arc<SkillEntry>,
    pub tool_id: String,
    pub args: Value,
    pub session: Value,
    /// Caller deadline, if any.
    pub deadline: Option<Instant>,
}

/// A resolved dispatch target.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, call: &ProviderCall) -> ProviderResult<Value>;
}

/// One backend per provider kind.
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Handler for `tool_id`, or `None` if this backend does not serve it.
    fn resolve(&self, tool_id: &str) -> Option<Arc<dyn Handler>>;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    backends: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, replacing any previous backend of the same kind.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.backends.insert(provider.kind(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn resolve(&self, kind: ProviderKind, tool_id: &str) -> ProviderResult<Arc<dyn Handler>> {
        self.backends
            .get(&kind)
            .and_then(|p| p.resolve(tool_id))
            .ok_or_else(|| ProviderError::Unresolved {
                reference: ProviderRef::new(kind, tool_id).to_string(),
            })
    }

    /// First declared provider that resolves, in declaration order.
    pub fn resolve_first(
        &self,
        providers: &[ProviderRef],
    ) -> ProviderResult<(ProviderRef, Arc<dyn Handler>)> {
        providers
            .iter()
            .find_map(|r| {
                self.resolve(r.kind, &r.tool_id)
                    .ok()
                    .map(|h| (r.clone(), h))
            })
            .ok_or_else(|| ProviderError::Unresolved {
                reference: providers
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Run `handler`, normalizing any backend failure into the stable
    /// taxonomy.
    pub async fn invoke(
        &self,
        handler: &dyn Handler,
        call: &ProviderCall,
    ) -> Result<Value, InvocationError> {
        handler
            .invoke(call)
            .await
            .map_err(ProviderError::into_invocation_error)
    }
}
