//! End-to-end invocation tests: manifests on disk, in-memory governance store
//! and a scripted container runtime.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use skillgate_core::orchestrator::RetryPolicy;
use skillgate_core::provider::builtin::BuiltinProvider;
use skillgate_core::provider::plugin::PluginProvider;
use skillgate_core::provider::remote::{RemoteRequest, RemoteToolProvider, RemoteTransport};
use skillgate_core::provider::{ProviderError, ProviderResult};
use skillgate_core::sandbox::fakes::{Script, ScriptedRuntime};
use skillgate_core::sandbox::{Preflight, RuntimeOptions, SandboxRuntime};
use skillgate_core::{
    AccessRule, AccessRules, ErrorCode, InvocationRequest, Orchestrator, ProviderRegistry,
    RuleAction,
};
use skillgate_state::fakes::MemoryGovernanceStore;
use skillgate_state::{
    Consume, GovernanceStore, Grant, GrantMode, Outcome, ProvenanceReceipt, SecurityHash,
    StorageError, StorageResult, WriteCheckpoint,
};
use tempfile::TempDir;

const AGENT: &str = "agent-a";
const IMAGE: &str =
    "registry.local/py@sha256:1111111111111111111111111111111111111111111111111111111111111111";

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    orch: Orchestrator,
    store: Arc<MemoryGovernanceStore>,
    /// Number of upcoming `commit` calls that fail.
    commit_failures: Arc<AtomicUsize>,
    containers: Arc<ScriptedRuntime>,
    root: TempDir,
}

/// Memory store whose `commit` can be made to fail on demand.
struct FaultyCommitStore {
    inner: Arc<MemoryGovernanceStore>,
    failures: Arc<AtomicUsize>,
}

#[async_trait]
impl GovernanceStore for FaultyCommitStore {
    async fn lookup(&self, agent_id: &str, skill_id: &str, hash: &SecurityHash) -> StorageResult<Option<Grant>> {
        self.inner.lookup(agent_id, skill_id, hash).await
    }

    async fn record(&self, grant: Grant) -> StorageResult<()> {
        self.inner.record(grant).await
    }

    async fn revoke(&self, agent_id: &str, skill_id: &str) -> StorageResult<usize> {
        self.inner.revoke(agent_id, skill_id).await
    }

    async fn record_checkpoint(&self, checkpoint: WriteCheckpoint) -> StorageResult<()> {
        self.inner.record_checkpoint(checkpoint).await
    }

    async fn lookup_checkpoint(
        &self,
        agent_id: &str,
        skill_id: &str,
        hash: &SecurityHash,
    ) -> StorageResult<Option<WriteCheckpoint>> {
        self.inner.lookup_checkpoint(agent_id, skill_id, hash).await
    }

    async fn commit(&self, receipt: ProvenanceReceipt, consume: Option<Consume>) -> StorageResult<ProvenanceReceipt> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Backend("write conflict".into()));
        }
        self.inner.commit(receipt, consume).await
    }

    async fn receipt(&self, invocation_id: &str) -> StorageResult<Option<ProvenanceReceipt>> {
        self.inner.receipt(invocation_id).await
    }

    async fn receipts_for(&self, agent_id: &str, skill_id: &str) -> StorageResult<Vec<ProvenanceReceipt>> {
        self.inner.receipts_for(agent_id, skill_id).await
    }
}

impl Harness {
    fn new(script: Script) -> Self {
        Self::build(script, 4, None)
    }

    fn build(script: Script, max_concurrent: usize, remote: Option<Arc<dyn RemoteTransport>>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryGovernanceStore::new());
        let commit_failures = Arc::new(AtomicUsize::new(0));
        let faulty = Arc::new(FaultyCommitStore {
            inner: store.clone(),
            failures: commit_failures.clone(),
        });
        let containers = Arc::new(ScriptedRuntime::new(script));
        let preflight = Arc::new(Preflight::default());
        let sandbox = Arc::new(SandboxRuntime::new(
            containers.clone(),
            preflight.clone(),
            RuntimeOptions {
                max_concurrent,
                ..RuntimeOptions::default()
            },
        ));

        let mut registry = ProviderRegistry::new()
            .with(Arc::new(BuiltinProvider::standard()))
            .with(Arc::new(PluginProvider::new(sandbox)));
        if let Some(transport) = remote {
            registry.register(Arc::new(RemoteToolProvider::new(transport, ["summarize"])));
        }

        let orch = Orchestrator::new(faulty, registry, preflight)
            .with_retry(RetryPolicy::new(1, Duration::from_millis(10)))
            .with_roots(vec![root.path().to_path_buf()]);
        Self {
            orch,
            store,
            commit_failures,
            containers,
            root,
        }
    }

    fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn reload_clean(&self) {
        let diagnostics = self.orch.reload();
        assert!(diagnostics.is_empty(), "unexpected diagnostics: {diagnostics:?}");
    }

    async fn always_allow(&self, skill: &str) {
        self.orch
            .grant(AGENT, skill, GrantMode::AlwaysAllow, Some("ops"))
            .await
            .unwrap();
    }

    async fn invoke(&self, skill: &str, args: Value) -> skillgate_core::InvocationResponse {
        self.orch.invoke(InvocationRequest::new(AGENT, skill, args)).await
    }
}

fn builtin_manifest(id: &str, tool: &str) -> String {
    format!(
        r#"
id = "{id}"
version = "1.0.0"
providers = ["builtin:{tool}"]
input_schema = "skillgate.any"
output_schema = "skillgate.any"

[[sources]]
path = "main.py"
"#
    )
}

fn plugin_manifest(id: &str, output_schema: &str, isolation: &str) -> String {
    format!(
        r#"
id = "{id}"
version = "2.0.0"
providers = ["plugin:{id}"]
input_schema = "skillgate.any"
output_schema = "{output_schema}"

[isolation]
{isolation}

[[sources]]
path = "main.py"

[plugin]
image = "{IMAGE}"
entrypoint = ["python3", "/skill/src/main.py"]
"#
    )
}

fn echo_skill(h: &Harness) {
    h.write("echo/skill.toml", &builtin_manifest("notes.echo", "echo"));
    h.write("echo/main.py", "print('hello')\n");
}

fn plugin_skill(h: &Harness, isolation: &str) {
    h.write("plug/skill.toml", &plugin_manifest("notes.plug", "skillgate.any", isolation));
    h.write("plug/main.py", "import json\nprint(json.dumps({'ok': True}))\n");
}

async fn receipt_outcome(h: &Harness, invocation_id: &str) -> (Outcome, Option<String>) {
    let receipt = h
        .store
        .receipt(invocation_id)
        .await
        .unwrap()
        .expect("every invocation leaves a receipt");
    (receipt.outcome, receipt.error_code)
}

// ── Builtin path ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_always_allow_invocation_succeeds_with_one_receipt() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();
    h.always_allow("notes.echo").await;

    let resp = h.invoke("notes.echo", json!({"msg": "hi"})).await;
    assert!(resp.is_ok(), "unexpected failure: {resp:?}");
    assert_eq!(resp.data, Some(json!({"echo": {"msg": "hi"}})));
    assert_eq!(resp.receipt_seq, Some(1));
    assert!(resp.error_code.is_none());

    let receipts = h.orch.receipts(AGENT, "notes.echo").await.unwrap();
    assert_eq!(receipts.len(), 1);
    let receipt = &receipts[0];
    assert_eq!(receipt.outcome, Outcome::Ok);
    assert_eq!(receipt.invocation_id, resp.invocation_id);
    assert_eq!(receipt.manifest_version.as_deref(), Some("1.0.0"));
    assert_eq!(
        receipt.security_hash,
        h.orch.security_hash("notes.echo"),
        "receipt binds the hash the gate evaluated"
    );
    assert!(receipt.output.is_some());
}

#[tokio::test]
async fn test_no_grant_requires_approval() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();

    let resp = h.invoke("notes.echo", json!({})).await;
    assert_eq!(resp.status, Outcome::Denied);
    assert_eq!(resp.error_code, Some(ErrorCode::ApprovalRequired));
    assert!(resp.data.is_none());

    let (outcome, code) = receipt_outcome(&h, &resp.invocation_id).await;
    assert_eq!(outcome, Outcome::Denied);
    assert_eq!(code.as_deref(), Some("approval_required"));
}

#[tokio::test]
async fn test_unknown_skill_is_capability_invalid_with_receipt() {
    let h = Harness::new(Script::Hang);
    h.reload_clean();

    let resp = h.invoke("does.not.exist", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::CapabilityInvalid));
    assert_eq!(resp.status, Outcome::Failed);

    let receipt = h
        .store
        .receipt(&resp.invocation_id)
        .await
        .unwrap()
        .unwrap();
    assert!(receipt.security_hash.is_none());
    assert!(receipt.manifest_version.is_none());
}

#[tokio::test]
async fn test_source_edit_and_reload_invalidates_grant() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();
    h.always_allow("notes.echo").await;
    let before = h.orch.security_hash("notes.echo").unwrap();
    assert!(h.invoke("notes.echo", json!({})).await.is_ok());

    h.write("echo/main.py", "print('changed')\n");
    h.reload_clean();
    let after = h.orch.security_hash("notes.echo").unwrap();
    assert_ne!(before, after);

    let resp = h.invoke("notes.echo", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::ApprovalRequired));

    // Re-granting against the new hash restores access.
    h.always_allow("notes.echo").await;
    assert!(h.invoke("notes.echo", json!({})).await.is_ok());
}

#[tokio::test]
async fn test_line_ending_change_keeps_grant() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();
    h.always_allow("notes.echo").await;

    h.write("echo/main.py", "print('hello')\r\n");
    h.reload_clean();
    assert!(h.invoke("notes.echo", json!({})).await.is_ok());
}

#[tokio::test]
async fn test_run_once_grant_is_usable_exactly_once() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();
    h.orch
        .grant(AGENT, "notes.echo", GrantMode::RunOnce, None)
        .await
        .unwrap();

    assert!(h.invoke("notes.echo", json!({})).await.is_ok());
    let second = h.invoke("notes.echo", json!({})).await;
    assert_eq!(second.error_code, Some(ErrorCode::ApprovalRequired));
}

#[tokio::test]
async fn test_run_once_commit_retried_after_transient_store_failure() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();
    h.orch
        .grant(AGENT, "notes.echo", GrantMode::RunOnce, None)
        .await
        .unwrap();
    h.commit_failures.store(1, Ordering::SeqCst);

    let first = h.invoke("notes.echo", json!({})).await;
    assert!(first.is_ok(), "unexpected failure: {first:?}");
    assert_eq!(first.receipt_seq, Some(1));

    let second = h.invoke("notes.echo", json!({})).await;
    assert_eq!(second.error_code, Some(ErrorCode::ApprovalRequired));
    assert_eq!(h.store.receipt_count(), 2);
}

#[tokio::test]
async fn test_run_once_output_withheld_when_grant_cannot_be_spent() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();
    h.orch
        .grant(AGENT, "notes.echo", GrantMode::RunOnce, None)
        .await
        .unwrap();
    // Both consuming attempts fail; the denial receipt still lands.
    h.commit_failures.store(2, Ordering::SeqCst);

    let first = h.invoke("notes.echo", json!({"secret": 1})).await;
    assert_eq!(first.status, Outcome::Denied);
    assert_eq!(first.error_code, Some(ErrorCode::PolicyDenied));
    assert!(first.data.is_none());

    let receipts = h.store.receipts_for(AGENT, "notes.echo").await.unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].outcome, Outcome::Denied);
    assert!(receipts[0].output.is_none());

    // The grant was never spent, so exactly one successful use remains.
    assert!(h.invoke("notes.echo", json!({})).await.is_ok());
    let third = h.invoke("notes.echo", json!({})).await;
    assert_eq!(third.error_code, Some(ErrorCode::ApprovalRequired));
}

#[tokio::test]
async fn test_concurrent_run_once_callers_spend_one_grant() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();
    h.orch
        .grant(AGENT, "notes.echo", GrantMode::RunOnce, None)
        .await
        .unwrap();

    let responses = futures::future::join_all(
        (0..5).map(|i| h.invoke("notes.echo", json!({ "n": i }))),
    )
    .await;
    let ok = responses.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1, "exactly one caller may spend a run-once grant");
    assert!(responses
        .iter()
        .filter(|r| !r.is_ok())
        .all(|r| r.error_code == Some(ErrorCode::ApprovalRequired)));
    assert_eq!(h.store.receipt_count(), 5);
}

#[tokio::test]
async fn test_revoke_removes_access() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();
    h.always_allow("notes.echo").await;
    assert!(h.invoke("notes.echo", json!({})).await.is_ok());

    let removed = h.orch.revoke(AGENT, "notes.echo").await.unwrap();
    assert_eq!(removed, 1);
    let resp = h.invoke("notes.echo", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::ApprovalRequired));
}

#[tokio::test]
async fn test_grant_for_unknown_skill_is_rejected() {
    let h = Harness::new(Script::Hang);
    h.reload_clean();
    let err = h
        .orch
        .grant(AGENT, "ghost", GrantMode::AlwaysAllow, None)
        .await
        .unwrap_err();
    match err {
        skillgate_core::AdminError::UnknownSkill { skill_id } => assert_eq!(skill_id, "ghost"),
        other => panic!("expected UnknownSkill, got {other:?}"),
    }
}

#[tokio::test]
async fn test_input_schema_violation_never_dispatches() {
    let h = Harness::new(Script::Hang);
    h.write(
        "schemas/stats.input.schema.json",
        r#"{"id": "stats.input", "required": ["text"], "properties": {"text": "string"}}"#,
    );
    h.write(
        "stats/skill.toml",
        &builtin_manifest("notes.stats", "text.stats")
            .replace("input_schema = \"skillgate.any\"", "input_schema = \"stats.input\""),
    );
    h.write("stats/main.py", "pass\n");
    h.reload_clean();
    h.always_allow("notes.stats").await;

    let resp = h.invoke("notes.stats", json!({"text": 5})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::SchemaInvalid));
    assert!(resp.message.unwrap().contains("stats.input"));

    let ok = h.invoke("notes.stats", json!({"text": "a b\nc"})).await;
    assert_eq!(ok.data, Some(json!({"chars": 5, "words": 3, "lines": 2})));
}

// ── Access rules ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_deny_rule_overrides_grant() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    let rules = AccessRules::new(vec![AccessRule::new(
        "agent-*",
        "notes.*",
        RuleAction::Deny,
    )]);
    let orch = Orchestrator::new(
        h.store.clone(),
        ProviderRegistry::new().with(Arc::new(BuiltinProvider::standard())),
        Arc::new(Preflight::default()),
    )
    .with_rules(rules)
    .with_roots(vec![h.root.path().to_path_buf()]);
    assert!(orch.reload().is_empty());
    orch.grant(AGENT, "notes.echo", GrantMode::AlwaysAllow, None)
        .await
        .unwrap();

    let resp = orch
        .invoke(InvocationRequest::new(AGENT, "notes.echo", json!({})))
        .await;
    assert_eq!(resp.error_code, Some(ErrorCode::PolicyDenied));
    assert_eq!(resp.status, Outcome::Denied);
}

// ── Write checkpoints ────────────────────────────────────────────────────

#[tokio::test]
async fn test_write_access_needs_checkpoint_even_with_always_allow() {
    let h = Harness::new(Script::Succeed {
        stdout: r#"{"written": true}"#.into(),
    });
    plugin_skill(&h, "write_access = true");
    h.reload_clean();
    h.always_allow("notes.plug").await;

    let resp = h.invoke("notes.plug", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::ApprovalRequired));
    assert_eq!(h.containers.creates(), 0, "no side effects before approval");

    h.orch
        .approve_write(AGENT, "notes.plug", "alice", Some(300), Some("one-off import"))
        .await
        .unwrap();
    let resp = h.invoke("notes.plug", json!({})).await;
    assert!(resp.is_ok(), "unexpected failure: {resp:?}");
    assert_eq!(resp.data, Some(json!({"written": true})));
    assert_eq!(h.containers.creates(), 1);

    // The checkpoint was consumed by the successful call.
    let again = h.invoke("notes.plug", json!({})).await;
    assert_eq!(again.error_code, Some(ErrorCode::ApprovalRequired));
    assert_eq!(h.containers.creates(), 1);
}

#[tokio::test]
async fn test_checkpoint_survives_failed_invocation() {
    let h = Harness::new(Script::Exit {
        code: 1,
        stderr: "boom".into(),
    });
    plugin_skill(&h, "write_access = true");
    h.reload_clean();
    h.orch
        .approve_write(AGENT, "notes.plug", "alice", None, None)
        .await
        .unwrap();

    let failed = h.invoke("notes.plug", json!({})).await;
    assert_eq!(failed.error_code, Some(ErrorCode::SandboxCrashed));

    h.containers.set_script(Script::Succeed {
        stdout: "{}".into(),
    });
    assert!(h.invoke("notes.plug", json!({})).await.is_ok());
}

// ── Plugin path ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_plugin_success_destroys_container() {
    let h = Harness::new(Script::Succeed {
        stdout: r#"{"ok": true}"#.into(),
    });
    plugin_skill(&h, "");
    h.reload_clean();
    h.always_allow("notes.plug").await;

    let resp = h.invoke("notes.plug", json!({"x": 1})).await;
    assert_eq!(resp.data, Some(json!({"ok": true})));
    assert_eq!(h.containers.creates(), 1);
    assert_eq!(h.containers.destroys(), 1);
    assert_eq!(h.containers.live(), 0);

    let spec = &h.containers.created_specs()[0];
    assert_eq!(spec.image, IMAGE);
    assert!(!spec.network);

    let receipts = h.orch.receipts(AGENT, "notes.plug").await.unwrap();
    let limits = receipts[0].limits.as_ref().unwrap();
    assert_eq!(limits.wall_clock_ms, 10_000);
}

#[tokio::test]
async fn test_preflight_denied_plugin_never_creates_container() {
    let h = Harness::new(Script::Succeed {
        stdout: "{}".into(),
    });
    plugin_skill(&h, "");
    h.write("plug/main.py", "import subprocess\nsubprocess.run(['ls'])\n");
    h.reload_clean();
    h.always_allow("notes.plug").await;

    let resp = h.invoke("notes.plug", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::PreflightDenied));
    assert_eq!(resp.status, Outcome::Denied);
    assert_eq!(h.containers.creates(), 0);

    let (outcome, code) = receipt_outcome(&h, &resp.invocation_id).await;
    assert_eq!(outcome, Outcome::Denied);
    assert_eq!(code.as_deref(), Some("preflight_denied"));
}

#[tokio::test]
async fn test_plugin_wall_clock_timeout_kills_and_destroys() {
    let h = Harness::new(Script::Hang);
    plugin_skill(&h, "[isolation.limits]\nwall_clock_ms = 100");
    h.reload_clean();
    h.always_allow("notes.plug").await;

    let resp = h.invoke("notes.plug", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::SandboxTimeout));
    assert_eq!(resp.status, Outcome::TimedOut);
    assert!(h.containers.kills() >= 1);
    assert_eq!(h.containers.live(), 0);

    let (outcome, _) = receipt_outcome(&h, &resp.invocation_id).await;
    assert_eq!(outcome, Outcome::TimedOut);
}

#[tokio::test]
async fn test_caller_deadline_shortens_budget() {
    let h = Harness::new(Script::Hang);
    plugin_skill(&h, "");
    h.reload_clean();
    h.always_allow("notes.plug").await;

    let started = std::time::Instant::now();
    let resp = h
        .orch
        .invoke(
            InvocationRequest::new(AGENT, "notes.plug", json!({}))
                .with_deadline(Duration::from_millis(100)),
        )
        .await;
    assert_eq!(resp.error_code, Some(ErrorCode::SandboxTimeout));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.containers.live(), 0);
}

#[tokio::test]
async fn test_plugin_nonzero_exit_is_crash() {
    let h = Harness::new(Script::Exit {
        code: 137,
        stderr: "Traceback: secret=hunter2".into(),
    });
    plugin_skill(&h, "");
    h.reload_clean();
    h.always_allow("notes.plug").await;

    let resp = h.invoke("notes.plug", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::SandboxCrashed));
    assert_eq!(resp.status, Outcome::Failed);
    assert!(!resp.message.unwrap_or_default().contains("hunter2"));
    assert_eq!(h.containers.creates(), 1, "crashes are not retried");
}

#[tokio::test]
async fn test_plugin_output_schema_violation() {
    let h = Harness::new(Script::WriteResult {
        json: r#"{"wrong": 1}"#.into(),
    });
    h.write(
        "schemas/summary.schema.json",
        r#"{"id": "notes.summary", "required": ["summary"], "properties": {"summary": "string"}}"#,
    );
    h.write(
        "plug/skill.toml",
        &plugin_manifest("notes.plug", "notes.summary", ""),
    );
    h.write("plug/main.py", "print('{}')\n");
    h.reload_clean();
    h.always_allow("notes.plug").await;

    let resp = h.invoke("notes.plug", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::SchemaInvalid));
    assert!(resp.data.is_none(), "invalid output is never returned");
    assert!(resp.message.unwrap().contains("notes.summary"));

    h.containers.set_script(Script::WriteResult {
        json: r#"{"summary": "short"}"#.into(),
    });
    let ok = h.invoke("notes.plug", json!({})).await;
    assert_eq!(ok.data, Some(json!({"summary": "short"})));
}

#[tokio::test]
async fn test_plugin_invalid_json_output() {
    let h = Harness::new(Script::Succeed {
        stdout: "not json".into(),
    });
    plugin_skill(&h, "");
    h.reload_clean();
    h.always_allow("notes.plug").await;

    let resp = h.invoke("notes.plug", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::SchemaInvalid));
    assert_eq!(h.containers.live(), 0);
}

#[tokio::test]
async fn test_concurrent_plugin_invocations_respect_bound() {
    let h = Harness::build(
        Script::Sleep {
            ms: 50,
            stdout: "{}".into(),
        },
        2,
        None,
    );
    plugin_skill(&h, "");
    h.reload_clean();
    h.always_allow("notes.plug").await;

    let responses =
        futures::future::join_all((0..6).map(|_| h.invoke("notes.plug", json!({})))).await;
    assert!(responses.iter().all(|r| r.is_ok()));
    assert_eq!(h.containers.creates(), 6);
    assert!(h.containers.peak_live() <= 2, "peak {}", h.containers.peak_live());
    assert_eq!(h.containers.live(), 0);
}

// ── Remote path ──────────────────────────────────────────────────────────

/// Fails with a transient error `failures` times, then echoes the request.
struct FlakyTransport {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteTransport for FlakyTransport {
    async fn call(&self, tool_id: &str, request: &RemoteRequest) -> ProviderResult<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(ProviderError::Unavailable {
                reason: "connection reset".into(),
            });
        }
        Ok(json!({"tool": tool_id, "args": request.args}))
    }
}

fn remote_harness(failures: usize) -> (Harness, Arc<FlakyTransport>) {
    let transport = Arc::new(FlakyTransport {
        failures,
        calls: AtomicUsize::new(0),
    });
    let h = Harness::build(Script::Hang, 4, Some(transport.clone() as Arc<dyn RemoteTransport>));
    h.write(
        "remote/skill.toml",
        r#"
id = "notes.remote"
version = "1.0.0"
providers = ["remote-tool:summarize"]
input_schema = "skillgate.any"
output_schema = "skillgate.any"
"#,
    );
    h.reload_clean();
    (h, transport)
}

#[tokio::test]
async fn test_transient_remote_failure_is_retried_once() {
    let (h, transport) = remote_harness(1);
    h.always_allow("notes.remote").await;

    let resp = h.invoke("notes.remote", json!({"q": 1})).await;
    assert!(resp.is_ok(), "unexpected failure: {resp:?}");
    assert_eq!(resp.data, Some(json!({"tool": "summarize", "args": {"q": 1}})));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.store.receipt_count(), 1, "one receipt per invocation, not per attempt");
}

#[tokio::test]
async fn test_remote_failure_after_retry_is_transport_unavailable() {
    let (h, transport) = remote_harness(usize::MAX);
    h.always_allow("notes.remote").await;

    let resp = h.invoke("notes.remote", json!({})).await;
    assert_eq!(resp.error_code, Some(ErrorCode::TransportUnavailable));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
}

// ── Discovery ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_list_snapshot_hides_execution_details() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    plugin_skill(&h, "network = false");
    h.reload_clean();

    let listed = h.orch.list_snapshot();
    let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["notes.echo", "notes.plug"]);

    let rendered = serde_json::to_string(&listed).unwrap();
    assert!(!rendered.contains("sha256:"));
    assert!(!rendered.contains("plugin:"));
}

#[tokio::test]
async fn test_reload_does_not_disturb_snapshot_in_use() {
    let h = Harness::new(Script::Hang);
    echo_skill(&h);
    h.reload_clean();
    let held = h.orch.snapshot();

    std::fs::remove_dir_all(h.root.path().join("echo")).unwrap();
    h.reload_clean();

    assert!(held.get("notes.echo").is_some());
    assert!(h.orch.snapshot().get("notes.echo").is_none());
}
