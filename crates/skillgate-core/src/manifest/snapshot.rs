//! Immutable runtime snapshot of loaded skills.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skillgate_state::SecurityHash;

use super::model::{CapabilityManifest, InvocationMode};
use crate::schema::SchemaRegistry;

/// Normalized source file content, exactly as it was hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlob {
    pub path: String,
    pub content: Vec<u8>,
}

/// One registered skill: manifest, sources and the hash computed at load.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillEntry {
    pub manifest: CapabilityManifest,
    pub sources: Vec<SourceBlob>,
    pub security_hash: SecurityHash,
    /// Directory the manifest was loaded from.
    pub dir: PathBuf,
}

impl SkillEntry {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn summary(&self) -> ManifestSummary {
        let m = &self.manifest;
        ManifestSummary {
            id: m.id.clone(),
            version: m.version.clone(),
            description: m.description.clone(),
            invocation_mode: m.invocation_mode,
            input_schema: m.input_schema.clone(),
            output_schema: m.output_schema.clone(),
            write_access: m.isolation.write_access,
            network: m.isolation.network,
        }
    }
}

/// Discovery view of a skill. Carries no provider kind, container details
/// or hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub id: String,
    pub version: String,
    pub description: String,
    pub invocation_mode: InvocationMode,
    pub input_schema: String,
    pub output_schema: String,
    pub write_access: bool,
    pub network: bool,
}

/// Read-only set of skills shared across concurrent invocations.
///
/// Built once per load; a reload produces a new snapshot instead of mutating
/// this one.
#[derive(Debug, Clone)]
pub struct Snapshot {
    skills: BTreeMap<String, Arc<SkillEntry>>,
    schemas: Arc<SchemaRegistry>,
    loaded_at: DateTime<Utc>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new(Vec::new(), SchemaRegistry::new())
    }
}

impl Snapshot {
    /// Build from already-validated entries. Later entries with a duplicate id
    /// replace earlier ones; the loader never passes duplicates.
    pub fn new(entries: Vec<SkillEntry>, schemas: SchemaRegistry) -> Self {
        let skills = entries
            .into_iter()
            .map(|e| (e.manifest.id.clone(), Arc::new(e)))
            .collect();
        Self {
            skills,
            schemas: Arc::new(schemas),
            loaded_at: Utc::now(),
        }
    }

    pub fn get(&self, skill_id: &str) -> Option<Arc<SkillEntry>> {
        self.skills.get(skill_id).cloned()
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.skills.keys().map(String::as_str)
    }

    /// Summaries ordered by id.
    pub fn summaries(&self) -> Vec<ManifestSummary> {
        self.skills.values().map(|e| e.summary()).collect()
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}
