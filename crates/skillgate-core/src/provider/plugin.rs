//! Plugin provider. Every call goes through the sandbox; there is no
//! in-process path for plugin code.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Handler, Provider, ProviderCall, ProviderResult};
use crate::manifest::ProviderKind;
use crate::sandbox::{SandboxRequest, SandboxRuntime};

pub struct PluginProvider {
    sandbox: Arc<SandboxRuntime>,
}

impl PluginProvider {
    pub fn new(sandbox: Arc<SandboxRuntime>) -> Self {
        Self { sandbox }
    }
}

impl Provider for PluginProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Plugin
    }

    /// Any tool id resolves; the container image and entrypoint come from
    /// the skill's own `[plugin]` section.
    fn resolve(&self, _tool_id: &str) -> Option<Arc<dyn Handler>> {
        Some(Arc::new(SandboxedHandler {
            sandbox: self.sandbox.clone(),
        }))
    }
}

struct SandboxedHandler {
    sandbox: Arc<SandboxRuntime>,
}

#[async_trait]
impl Handler for SandboxedHandler {
    async fn invoke(&self, call: &ProviderCall) -> ProviderResult<Value> {
        let request = SandboxRequest {
            invocation_id: &call.invocation_id,
            agent_id: &call.agent_id,
            skill: &call.skill,
            args: &call.args,
            session: &call.session,
            deadline: call.deadline,
        };
        Ok(self.sandbox.run(request).await?)
    }
}
