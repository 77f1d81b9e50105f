//! Storage trait definitions for skillgate governance
//!
//! - `SecurityHash`: validated SHA-256 hex digest binding trust to a skill version
//! - `Grant` / `WriteCheckpoint`: cached approval decisions
//! - `ProvenanceReceipt`: append-only audit record of one invocation
//! - `GovernanceStore`: the single mutable shared resource of the substrate
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// SecurityHash
// ---------------------------------------------------------------------------

/// SHA-256 digest (lowercase hex) over a skill's full behavioural surface.
///
/// The inner field is private so the string is always valid lowercase hex,
/// produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecurityHash(String);

impl SecurityHash {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        SecurityHash(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for SecurityHash {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(SecurityHash(s.to_ascii_lowercase()))
    }
}

impl From<SecurityHash> for String {
    fn from(hash: SecurityHash) -> Self {
        hash.0
    }
}

impl std::fmt::Display for SecurityHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Grants and checkpoints
// ---------------------------------------------------------------------------

/// `(agent_id, skill_id)` pair; the unit of write serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrantKey {
    pub agent_id: String,
    pub skill_id: String,
}

impl GrantKey {
    pub fn new(agent_id: impl Into<String>, skill_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            skill_id: skill_id.into(),
        }
    }
}

impl std::fmt::Display for GrantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.skill_id)
    }
}

/// How long an approval lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantMode {
    /// Consumed by the first successful invocation.
    RunOnce,
    /// Persists until explicitly revoked or the security hash changes.
    AlwaysAllow,
}

impl GrantMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantMode::RunOnce => "run-once",
            GrantMode::AlwaysAllow => "always-allow",
        }
    }
}

impl std::fmt::Display for GrantMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GrantMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "run-once" => Ok(GrantMode::RunOnce),
            "always-allow" => Ok(GrantMode::AlwaysAllow),
            other => Err(format!(
                "unknown grant mode '{other}' (expected run-once or always-allow)"
            )),
        }
    }
}

/// A cached approval decision bound to one security hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub agent_id: String,
    pub skill_id: String,
    pub security_hash: SecurityHash,
    pub mode: GrantMode,
    pub granted_at: DateTime<Utc>,
    /// Operator or process that issued the grant.
    pub granted_by: Option<String>,
}

impl Grant {
    pub fn new(
        agent_id: impl Into<String>,
        skill_id: impl Into<String>,
        security_hash: SecurityHash,
        mode: GrantMode,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            skill_id: skill_id.into(),
            security_hash,
            mode,
            granted_at: Utc::now(),
            granted_by: None,
        }
    }

    pub fn with_granted_by(mut self, who: impl Into<String>) -> Self {
        self.granted_by = Some(who.into());
        self
    }

    pub fn key(&self) -> GrantKey {
        GrantKey::new(&self.agent_id, &self.skill_id)
    }
}

/// Human-in-the-loop approval for one side-effecting invocation.
///
/// Checkpoints are single-use and bound to the security hash they were
/// approved against, exactly like run-once grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCheckpoint {
    pub checkpoint_id: String,
    pub agent_id: String,
    pub skill_id: String,
    pub security_hash: SecurityHash,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    /// Deadline after which the approval no longer counts.
    pub expires_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl WriteCheckpoint {
    pub fn new(
        agent_id: impl Into<String>,
        skill_id: impl Into<String>,
        security_hash: SecurityHash,
        approved_by: impl Into<String>,
    ) -> Self {
        Self {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            skill_id: skill_id.into(),
            security_hash,
            approved_by: approved_by.into(),
            approved_at: Utc::now(),
            expires_at: None,
            note: None,
        }
    }

    /// Expire the approval `secs` seconds after it was given.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.expires_at = Some(self.approved_at + chrono::Duration::seconds(secs as i64));
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn key(&self) -> GrantKey {
        GrantKey::new(&self.agent_id, &self.skill_id)
    }

    /// Check whether this checkpoint has expired at the given time.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// Terminal outcome of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Ok,
    Denied,
    Failed,
    TimedOut,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Denied => "denied",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed-out",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits that were in force for a sandboxed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedLimits {
    pub cpu_millis: u32,
    pub memory_mb: u32,
    pub wall_clock_ms: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub output_bytes: u64,
    pub network: bool,
}

/// Capped reference to an invocation's output.
///
/// The full output is never persisted; the digest lets auditors match a
/// caller-side copy against the receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub digest: SecurityHash,
    pub size_bytes: u64,
    pub preview: String,
    pub truncated: bool,
}

impl OutputRef {
    /// Build a reference keeping at most `preview_bytes` of `rendered`
    /// (cut on a char boundary).
    pub fn capture(rendered: &str, preview_bytes: usize) -> Self {
        let mut cut = rendered.len().min(preview_bytes);
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        Self {
            digest: SecurityHash::from_bytes(rendered.as_bytes()),
            size_bytes: rendered.len() as u64,
            preview: rendered[..cut].to_string(),
            truncated: cut < rendered.len(),
        }
    }
}

/// Immutable audit record of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceReceipt {
    pub invocation_id: String,
    pub agent_id: String,
    pub skill_id: String,
    /// Absent when the skill id did not resolve to a manifest.
    pub manifest_version: Option<String>,
    pub security_hash: Option<SecurityHash>,
    pub limits: Option<AppliedLimits>,
    pub duration_ms: u64,
    pub outcome: Outcome,
    /// Stable error code for non-ok outcomes.
    pub error_code: Option<String>,
    pub output: Option<OutputRef>,
    /// Per-(agent, skill) sequence number, assigned by the store on append.
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
}

impl ProvenanceReceipt {
    pub fn key(&self) -> GrantKey {
        GrantKey::new(&self.agent_id, &self.skill_id)
    }
}

/// Single-use authorization consumed together with a receipt append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consume {
    RunOnceGrant { security_hash: SecurityHash },
    Checkpoint { checkpoint_id: String },
}

// ---------------------------------------------------------------------------
// GovernanceStore
// ---------------------------------------------------------------------------

/// Durable store for grants, write checkpoints and receipts.
///
/// Guarantees:
/// - Writes are serialized per `(agent_id, skill_id)`; reads run concurrently
///   and always observe the most recently completed write for a key.
/// - `lookup` only returns a grant whose stored hash equals the given hash.
/// - `record` of an always-allow grant replaces every prior grant for the key;
///   a run-once grant is a single-use entry (a standing always-allow grant for
///   the same hash already covers it and is left untouched).
/// - `commit` appends a receipt and, in the same atomic write, deletes the
///   single-use authorization it consumed.
/// - Receipts are append-only and never mutated.
#[async_trait]
pub trait GovernanceStore: Send + Sync {
    /// Find the grant for `(agent, skill)` bound to exactly `hash`.
    async fn lookup(
        &self,
        agent_id: &str,
        skill_id: &str,
        hash: &SecurityHash,
    ) -> StorageResult<Option<Grant>>;

    /// Persist a grant.
    async fn record(&self, grant: Grant) -> StorageResult<()>;

    /// Remove all grants and pending checkpoints for `(agent, skill)`.
    /// Returns the number of grants removed.
    async fn revoke(&self, agent_id: &str, skill_id: &str) -> StorageResult<usize>;

    /// Persist a human approval checkpoint for a side-effecting invocation.
    async fn record_checkpoint(&self, checkpoint: WriteCheckpoint) -> StorageResult<()>;

    /// Find an unexpired checkpoint for `(agent, skill)` bound to `hash`.
    async fn lookup_checkpoint(
        &self,
        agent_id: &str,
        skill_id: &str,
        hash: &SecurityHash,
    ) -> StorageResult<Option<WriteCheckpoint>>;

    /// Append `receipt`, consuming `consume` atomically with it.
    /// Returns the stored receipt with its sequence number assigned.
    async fn commit(
        &self,
        receipt: ProvenanceReceipt,
        consume: Option<Consume>,
    ) -> StorageResult<ProvenanceReceipt>;

    /// Append a receipt that consumes nothing.
    async fn append(&self, receipt: ProvenanceReceipt) -> StorageResult<ProvenanceReceipt> {
        self.commit(receipt, None).await
    }

    /// Get a receipt by invocation id.
    async fn receipt(&self, invocation_id: &str) -> StorageResult<Option<ProvenanceReceipt>>;

    /// All receipts for `(agent, skill)`, ordered by sequence number.
    async fn receipts_for(
        &self,
        agent_id: &str,
        skill_id: &str,
    ) -> StorageResult<Vec<ProvenanceReceipt>>;
}
