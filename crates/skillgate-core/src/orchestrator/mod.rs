//! Invocation orchestrator: the single entry point for callers.
//!
//! ```text
//! resolve manifest -> gate -> validate input -> resolve provider
//!   -> dispatch (retry once on transient failure) -> validate output
//!   -> commit receipt (+ consume single-use authorization) -> envelope
//! ```
//!
//! Every path, including denials, commits exactly one receipt.

mod admin;
mod envelope;
mod retry;

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use skillgate_state::{Consume, GovernanceStore, GrantKey, KeyedLocks, OutputRef, ProvenanceReceipt, SecurityHash};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::{ConfigError, ConfigResult, SkillgateConfig};
use crate::error::{ErrorCode, InvocationError};
use crate::hash;
use crate::manifest::{Diagnostic, ManifestLoader, ManifestSummary, SkillEntry, Snapshot};
use crate::obs::{self, InvocationSpan};
use crate::policy::{AccessRules, Authorization, PolicyGate};
use crate::provider::builtin::BuiltinProvider;
use crate::provider::plugin::PluginProvider;
use crate::provider::remote::{HttpTransport, RemoteToolProvider};
use crate::provider::{ProviderCall, ProviderError, ProviderRegistry};
use crate::sandbox::{ContainerRuntime, Preflight, PreflightRule, RuntimeOptions, SandboxRuntime};

pub use admin::AdminError;
pub use envelope::{InvocationRequest, InvocationResponse};
pub use retry::{execute_with_retry, RetryPolicy};

/// Extra time past the caller deadline before the dispatch is abandoned.
/// The sandbox enforces the deadline itself; this bounds the other kinds.
const DEADLINE_GRACE: Duration = Duration::from_millis(500);

const DEFAULT_PREVIEW_BYTES: usize = 256;

pub struct Orchestrator {
    snapshot: RwLock<Arc<Snapshot>>,
    loader: ManifestLoader,
    roots: Vec<PathBuf>,
    store: Arc<dyn GovernanceStore>,
    preflight: Arc<Preflight>,
    gate: PolicyGate,
    registry: ProviderRegistry,
    retry: RetryPolicy,
    /// Serializes invocations holding a single-use authorization per key.
    leases: KeyedLocks,
    preview_bytes: usize,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("roots", &self.roots)
            .field("skills", &self.snapshot().len())
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .finish()
    }
}

/// What a successful dispatch produced.
struct Dispatched {
    data: Value,
    authorization: Authorization,
}

impl Orchestrator {
    /// Orchestrator with an empty snapshot, no access rules and the default
    /// retry policy.
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        registry: ProviderRegistry,
        preflight: Arc<Preflight>,
    ) -> Self {
        let gate = PolicyGate::new(store.clone(), preflight.clone(), AccessRules::default());
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            loader: ManifestLoader::new(registry.kinds()),
            roots: Vec::new(),
            store,
            preflight,
            gate,
            registry,
            retry: RetryPolicy::default(),
            leases: KeyedLocks::new(),
            preview_bytes: DEFAULT_PREVIEW_BYTES,
        }
    }

    /// Wire every component from configuration. The snapshot stays empty
    /// until [`Orchestrator::reload`] is called.
    pub fn from_config(
        config: &SkillgateConfig,
        store: Arc<dyn GovernanceStore>,
        containers: Arc<dyn ContainerRuntime>,
    ) -> ConfigResult<Self> {
        let mut preflight = Preflight::new(config.sandbox.host_limits());
        for (name, pattern) in &config.preflight.patterns {
            let rule = PreflightRule::new(name.clone(), pattern).map_err(|e| ConfigError::Invalid {
                key: format!("preflight.patterns.{name}"),
                reason: e.to_string(),
            })?;
            preflight = preflight.with_rule(rule);
        }
        let preflight = Arc::new(preflight);

        let sandbox = Arc::new(SandboxRuntime::new(
            containers,
            preflight.clone(),
            RuntimeOptions {
                max_concurrent: config.sandbox.max_concurrent,
                pids_limit: config.sandbox.pids_limit,
                workdir: config.sandbox.workdir.clone(),
            },
        ));

        let mut registry = ProviderRegistry::new()
            .with(Arc::new(BuiltinProvider::standard()))
            .with(Arc::new(PluginProvider::new(sandbox)));
        if let Some(endpoint) = &config.remote.endpoint {
            let transport =
                HttpTransport::new(endpoint.clone(), Duration::from_millis(config.remote.timeout_ms))
                    .map_err(|e| ConfigError::Invalid {
                        key: "remote.endpoint".into(),
                        reason: e.to_string(),
                    })?;
            registry.register(Arc::new(RemoteToolProvider::new(
                Arc::new(transport),
                config.remote.tools.clone(),
            )));
        }

        Ok(Self::new(store, registry, preflight)
            .with_rules(AccessRules::new(config.policy.rules.clone()))
            .with_retry(RetryPolicy::from(&config.retry))
            .with_preview_bytes(config.receipts.preview_bytes)
            .with_roots(config.roots.clone()))
    }

    pub fn with_rules(mut self, rules: AccessRules) -> Self {
        self.gate = PolicyGate::new(self.store.clone(), self.preflight.clone(), rules);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_preview_bytes(mut self, preview_bytes: usize) -> Self {
        self.preview_bytes = preview_bytes;
        self
    }

    pub fn with_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.roots = roots;
        self
    }

    pub fn store(&self) -> &Arc<dyn GovernanceStore> {
        &self.store
    }

    // ── Snapshot ─────────────────────────────────────────────────────────

    /// The current snapshot. Invocations hold on to the one they started
    /// with, so a concurrent reload never changes a running invocation.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Discovery view, ordered by id.
    pub fn list_snapshot(&self) -> Vec<ManifestSummary> {
        self.snapshot().summaries()
    }

    /// Re-scan the configured roots and swap in a new snapshot.
    pub fn reload(&self) -> Vec<Diagnostic> {
        self.reload_from(&self.roots)
    }

    /// Scan `roots` and swap in a new snapshot.
    pub fn reload_from(&self, roots: &[PathBuf]) -> Vec<Diagnostic> {
        let (snapshot, diagnostics) = self.loader.load(roots);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        diagnostics
    }

    pub fn security_hash(&self, skill_id: &str) -> Option<SecurityHash> {
        self.snapshot()
            .get(skill_id)
            .map(|s| s.security_hash.clone())
    }

    // ── Invocation ───────────────────────────────────────────────────────

    /// Run one invocation end to end. Never panics and never returns a raw
    /// backend error: the outcome is always a normalized envelope.
    pub async fn invoke(&self, request: InvocationRequest) -> InvocationResponse {
        let invocation_id = Uuid::new_v4().to_string();
        let span = InvocationSpan::new(&invocation_id, &request.agent_id, &request.skill_id);
        span.instrument(self.run_invocation(invocation_id, request))
            .await
    }

    async fn run_invocation(&self, invocation_id: String, request: InvocationRequest) -> InvocationResponse {
        let started = Instant::now();
        let deadline = request.deadline.map(|d| started + d);
        obs::emit_invocation_started(&invocation_id, &request.agent_id, &request.skill_id);

        let snapshot = self.snapshot();
        let Some(skill) = snapshot.get(&request.skill_id) else {
            let err = InvocationError::new(
                ErrorCode::CapabilityInvalid,
                format!("unknown skill '{}'", request.skill_id),
            );
            return self.finish(&invocation_id, &request, None, Err(err), started).await;
        };

        // Held until the receipt is committed.
        let mut lease: Option<OwnedMutexGuard<()>> = None;
        let result = self
            .dispatch(&invocation_id, &request, &snapshot, &skill, deadline, &mut lease)
            .await;
        let response = self
            .finish(&invocation_id, &request, Some(skill.as_ref()), result, started)
            .await;
        drop(lease);
        response
    }

    async fn authorize(
        &self,
        invocation_id: &str,
        agent_id: &str,
        skill: &SkillEntry,
    ) -> Result<Authorization, InvocationError> {
        let verdict = self.gate.evaluate(agent_id, skill).await;
        let label = match &verdict {
            Ok(auth) => auth.as_str(),
            Err(e) => e.code.as_str(),
        };
        obs::emit_gate_evaluated(invocation_id, label, skill.security_hash.short());
        verdict
    }

    async fn dispatch(
        &self,
        invocation_id: &str,
        request: &InvocationRequest,
        snapshot: &Snapshot,
        skill: &Arc<SkillEntry>,
        deadline: Option<Instant>,
        lease: &mut Option<OwnedMutexGuard<()>>,
    ) -> Result<Dispatched, InvocationError> {
        let mut authorization = self.authorize(invocation_id, &request.agent_id, skill).await?;
        if authorization.is_single_use() {
            // Re-check under the lease so two callers cannot spend one grant.
            *lease = Some(
                self.leases
                    .acquire(&GrantKey::new(&request.agent_id, skill.id()))
                    .await,
            );
            authorization = self.authorize(invocation_id, &request.agent_id, skill).await?;
        }

        let manifest = &skill.manifest;
        snapshot
            .schemas()
            .validate(&manifest.input_schema, &request.tool_args)
            .map_err(|v| InvocationError::new(ErrorCode::SchemaInvalid, v.to_string()))?;

        let (provider, handler) = self
            .registry
            .resolve_first(&manifest.providers)
            .map_err(ProviderError::into_invocation_error)?;
        debug!(provider = %provider, "provider resolved");

        let call = ProviderCall {
            invocation_id: invocation_id.to_string(),
            agent_id: request.agent_id.clone(),
            skill: skill.clone(),
            tool_id: provider.tool_id.clone(),
            args: request.tool_args.clone(),
            session: request.session_context.clone(),
            deadline,
        };
        let attempts = execute_with_retry(&self.retry, invocation_id, || {
            self.registry.invoke(handler.as_ref(), &call)
        });
        let (result, attempts) = match deadline {
            Some(d) => tokio::time::timeout_at(d + DEADLINE_GRACE, attempts)
                .await
                .map_err(|_| {
                    InvocationError::new(ErrorCode::SandboxTimeout, "caller deadline exceeded")
                })?,
            None => attempts.await,
        };
        debug!(attempts, "dispatch finished");
        let data = result?;

        snapshot
            .schemas()
            .validate(&manifest.output_schema, &data)
            .map_err(|v| InvocationError::new(ErrorCode::SchemaInvalid, v.to_string()))?;

        Ok(Dispatched {
            data,
            authorization,
        })
    }

    /// Commit the receipt and build the envelope.
    async fn finish(
        &self,
        invocation_id: &str,
        request: &InvocationRequest,
        skill: Option<&SkillEntry>,
        result: Result<Dispatched, InvocationError>,
        started: Instant,
    ) -> InvocationResponse {
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, data, error, consume) = match result {
            Ok(d) => (
                skillgate_state::Outcome::Ok,
                Some(d.data),
                None,
                d.authorization.consume(),
            ),
            Err(e) => (e.outcome(), None, Some(e), None),
        };

        let output = data.as_ref().map(|v| {
            let rendered = hash::canonical_json(v).unwrap_or_else(|_| v.to_string());
            OutputRef::capture(&rendered, self.preview_bytes)
        });
        let receipt = ProvenanceReceipt {
            invocation_id: invocation_id.to_string(),
            agent_id: request.agent_id.clone(),
            skill_id: request.skill_id.clone(),
            manifest_version: skill.map(|s| s.manifest.version.clone()),
            security_hash: skill.map(|s| s.security_hash.clone()),
            limits: skill.map(|s| s.manifest.isolation.applied_limits()),
            duration_ms,
            outcome: status,
            error_code: error.as_ref().map(|e| e.code.as_str().to_string()),
            output,
            seq: 0,
            recorded_at: Utc::now(),
        };

        let (status, data, error, receipt_seq) = match consume {
            None => {
                let seq = match self.store.commit(receipt, None).await {
                    Ok(stored) => Some(stored.seq),
                    Err(e) => {
                        obs::emit_receipt_persist_failed(invocation_id, &e);
                        None
                    }
                };
                (status, data, error, seq)
            }
            Some(consume) => match self.commit_consuming(invocation_id, &receipt, consume).await {
                Some(seq) => (status, data, error, Some(seq)),
                None => {
                    // The authorization is still live, so the output must not
                    // be released.
                    let err = InvocationError::new(
                        ErrorCode::PolicyDenied,
                        "single-use authorization could not be recorded",
                    );
                    let fallback = ProvenanceReceipt {
                        outcome: err.outcome(),
                        error_code: Some(err.code.as_str().to_string()),
                        output: None,
                        ..receipt
                    };
                    let seq = match self.store.commit(fallback, None).await {
                        Ok(stored) => Some(stored.seq),
                        Err(e) => {
                            obs::emit_receipt_persist_failed(invocation_id, &e);
                            None
                        }
                    };
                    (err.outcome(), None, Some(err), seq)
                }
            },
        };

        let code = error.as_ref().map(|e| e.code);
        obs::emit_invocation_finished(invocation_id, status.as_str(), code, duration_ms);

        InvocationResponse {
            invocation_id: invocation_id.to_string(),
            status,
            data,
            error_code: code,
            message: error.map(|e| e.detail),
            receipt_seq,
        }
    }

    /// Commit a receipt that spends a single-use authorization, retrying
    /// once. `None` means the authorization was not consumed.
    async fn commit_consuming(
        &self,
        invocation_id: &str,
        receipt: &ProvenanceReceipt,
        consume: Consume,
    ) -> Option<u64> {
        for attempt in 1..=2 {
            match self.store.commit(receipt.clone(), Some(consume.clone())).await {
                Ok(stored) => return Some(stored.seq),
                Err(e) => {
                    obs::emit_receipt_persist_failed(invocation_id, &e);
                    debug!(attempt, "consuming commit failed");
                }
            }
        }
        None
    }
}
