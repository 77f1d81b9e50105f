//! Remote-tool provider: request/response over a typed transport.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Handler, Provider, ProviderCall, ProviderError, ProviderResult};
use crate::manifest::ProviderKind;

/// Wire body sent to a remote tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub invocation_id: String,
    pub agent_id: String,
    pub skill_id: String,
    pub args: Value,
    pub session: Value,
}

impl RemoteRequest {
    fn from_call(call: &ProviderCall) -> Self {
        Self {
            invocation_id: call.invocation_id.clone(),
            agent_id: call.agent_id.clone(),
            skill_id: call.skill.id().to_string(),
            args: call.args.clone(),
            session: call.session.clone(),
        }
    }
}

/// Round trip to a remote tool. Implementations map their native errors to
/// [`ProviderError`] variants and never return anything else.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn call(&self, tool_id: &str, request: &RemoteRequest) -> ProviderResult<Value>;
}

/// JSON over HTTP: `POST {endpoint}/tools/{tool_id}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("skillgate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, tool_id: &str) -> String {
        format!("{}/tools/{}", self.endpoint, tool_id)
    }
}

fn transport_failure(err: &reqwest::Error) -> ProviderError {
    let reason = if err.is_timeout() {
        "request timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    ProviderError::Unavailable {
        reason: reason.to_string(),
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn call(&self, tool_id: &str, request: &RemoteRequest) -> ProviderResult<Value> {
        let response = self
            .client
            .post(self.url(tool_id))
            .json(request)
            .send()
            .await
            .map_err(|e| transport_failure(&e))?;

        let status = response.status();
        debug!(tool_id, status = status.as_u16(), "remote tool responded");
        if status.is_server_error() {
            return Err(ProviderError::Unavailable {
                reason: format!("server error {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| transport_failure(&e))?;
        serde_json::from_slice(&body).map_err(|e| ProviderError::InvalidResponse {
            reason: e.to_string(),
        })
    }
}

/// Serves the tool ids listed in configuration through one transport.
pub struct RemoteToolProvider {
    transport: Arc<dyn RemoteTransport>,
    tools: BTreeSet<String>,
}

impl RemoteToolProvider {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        tools: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            transport,
            tools: tools.into_iter().map(Into::into).collect(),
        }
    }
}

impl Provider for RemoteToolProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RemoteTool
    }

    fn resolve(&self, tool_id: &str) -> Option<Arc<dyn Handler>> {
        self.tools.contains(tool_id).then(|| {
            Arc::new(RemoteHandler {
                transport: self.transport.clone(),
                tool_id: tool_id.to_string(),
            }) as Arc<dyn Handler>
        })
    }
}

struct RemoteHandler {
    transport: Arc<dyn RemoteTransport>,
    tool_id: String,
}

#[async_trait]
impl Handler for RemoteHandler {
    async fn invoke(&self, call: &ProviderCall) -> ProviderResult<Value> {
        let request = RemoteRequest::from_call(call);
        self.transport.call(&self.tool_id, &request).await
    }
}
