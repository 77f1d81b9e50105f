//! Manifest discovery and validation.
//!
//! `load` walks every root, registers `*.schema.json` documents, then parses
//! each `skill.toml`. A bad file only excludes itself: every failure becomes a
//! [`Diagnostic`] and the rest of the load continues.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use skillgate_state::SecurityHash;
use tracing::{debug, info, warn};

use super::error::{ManifestError, ManifestResult};
use super::model::{is_contained_path, ProviderKind, RawManifest, SourceRef};
use super::snapshot::{SkillEntry, Snapshot, SourceBlob};
use crate::hash;
use crate::schema::SchemaRegistry;

/// File name of a skill declaration.
pub const MANIFEST_FILE: &str = "skill.toml";

/// Suffix of schema documents.
pub const SCHEMA_SUFFIX: &str = ".schema.json";

/// Why a file was excluded from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub path: PathBuf,
    /// Present once the file parsed far enough to reveal an id.
    pub skill_id: Option<String>,
    pub error: ManifestError,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.skill_id {
            Some(id) => write!(f, "{} [{}]: {}", self.path.display(), id, self.error),
            None => write!(f, "{}: {}", self.path.display(), self.error),
        }
    }
}

/// Builds snapshots from manifest roots.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    known_kinds: BTreeSet<ProviderKind>,
}

impl ManifestLoader {
    /// `known_kinds` are the provider kinds the registry can dispatch to; a
    /// manifest declaring any other kind is excluded.
    pub fn new(known_kinds: impl IntoIterator<Item = ProviderKind>) -> Self {
        Self {
            known_kinds: known_kinds.into_iter().collect(),
        }
    }

    /// Scan `roots` and produce an immutable snapshot plus diagnostics.
    pub fn load(&self, roots: &[PathBuf]) -> (Snapshot, Vec<Diagnostic>) {
        let mut diagnostics = Vec::new();
        let mut manifests = Vec::new();
        let mut schema_files = Vec::new();

        for root in roots {
            walk(root, &mut manifests, &mut schema_files, &mut diagnostics);
        }
        manifests.sort();
        schema_files.sort();

        let mut schemas = SchemaRegistry::new();
        for path in schema_files {
            let result = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    schemas
                        .register_json(&text)
                        .map(|s| s.id.clone())
                        .map_err(|e| e.to_string())
                });
            match result {
                Ok(id) => debug!(schema_id = %id, path = %path.display(), "schema registered"),
                Err(reason) => diagnostics.push(Diagnostic {
                    path,
                    skill_id: None,
                    error: ManifestError::Parse(reason),
                }),
            }
        }

        let mut by_id: BTreeMap<String, Vec<(PathBuf, SkillEntry)>> = BTreeMap::new();
        for path in manifests {
            match self.load_one(&path, &schemas) {
                Ok(entry) => by_id
                    .entry(entry.manifest.id.clone())
                    .or_default()
                    .push((path, entry)),
                Err((skill_id, error)) => diagnostics.push(Diagnostic {
                    path,
                    skill_id,
                    error,
                }),
            }
        }

        let mut entries = Vec::new();
        for (id, mut found) in by_id {
            if found.len() == 1 {
                if let Some((_, entry)) = found.pop() {
                    entries.push(entry);
                }
                continue;
            }
            // Every declaration of a duplicated id is excluded.
            let paths: Vec<PathBuf> = found.iter().map(|(p, _)| p.clone()).collect();
            for (i, path) in paths.iter().enumerate() {
                let other = paths[(i + 1) % paths.len()].display().to_string();
                diagnostics.push(Diagnostic {
                    path: path.clone(),
                    skill_id: Some(id.clone()),
                    error: ManifestError::DuplicateId {
                        id: id.clone(),
                        other,
                    },
                });
            }
        }

        for d in &diagnostics {
            warn!(path = %d.path.display(), error = %d.error, "manifest excluded");
        }
        let snapshot = Snapshot::new(entries, schemas);
        info!(
            skills = snapshot.len(),
            excluded = diagnostics.len(),
            "manifest snapshot loaded"
        );
        (snapshot, diagnostics)
    }

    fn load_one(
        &self,
        path: &Path,
        schemas: &SchemaRegistry,
    ) -> Result<SkillEntry, (Option<String>, ManifestError)> {
        let text = std::fs::read_to_string(path).map_err(|e| (None, ManifestError::Io(e.to_string())))?;
        let raw = RawManifest::parse(&text).map_err(|e| (None, e))?;
        let id = raw.id.clone();
        self.build_entry(path, raw, schemas)
            .map_err(|e| (Some(id), e))
    }

    fn build_entry(
        &self,
        path: &Path,
        raw: RawManifest,
        schemas: &SchemaRegistry,
    ) -> ManifestResult<SkillEntry> {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (refs, blobs) = read_sources(&dir, &raw)?;
        let manifest = raw.validate(refs)?;

        if let Some(p) = manifest
            .providers
            .iter()
            .find(|p| !self.known_kinds.contains(&p.kind))
        {
            return Err(ManifestError::UnregisteredProviderKind {
                kind: p.kind.to_string(),
            });
        }

        for schema_id in [&manifest.input_schema, &manifest.output_schema] {
            if !schemas.contains(schema_id) {
                return Err(ManifestError::UnknownSchema {
                    schema_id: schema_id.clone(),
                });
            }
        }

        let security_hash = hash::security_hash(&manifest)?;
        debug!(skill_id = %manifest.id, hash = %security_hash.short(), "manifest validated");

        Ok(SkillEntry {
            manifest,
            sources: blobs,
            security_hash,
            dir,
        })
    }
}

/// Read, normalize and digest every declared source, checking optional pins.
fn read_sources(dir: &Path, raw: &RawManifest) -> ManifestResult<(Vec<SourceRef>, Vec<SourceBlob>)> {
    let canonical_dir = dir
        .canonicalize()
        .map_err(|e| ManifestError::Io(e.to_string()))?;
    let mut seen = BTreeSet::new();
    let mut refs = Vec::with_capacity(raw.sources.len());
    let mut blobs = Vec::with_capacity(raw.sources.len());

    for source in &raw.sources {
        let source_err = |reason: &str| ManifestError::Source {
            path: source.path.clone(),
            reason: reason.to_string(),
        };

        if !is_contained_path(&source.path) {
            return Err(source_err("must be a relative path inside the skill directory"));
        }
        if !seen.insert(source.path.as_str()) {
            return Err(source_err("declared more than once"));
        }

        let full = canonical_dir
            .join(&source.path)
            .canonicalize()
            .map_err(|_| source_err("file not found"))?;
        if !full.starts_with(&canonical_dir) {
            return Err(source_err("resolves outside the skill directory"));
        }
        let bytes = std::fs::read(&full).map_err(|e| source_err(&e.to_string()))?;

        let content = hash::normalize_text(&bytes);
        let digest = SecurityHash::from_bytes(&content);

        if let Some(pin) = &source.digest {
            let expected = SecurityHash::try_from(pin.clone()).map_err(|_| {
                ManifestError::InvalidField {
                    field: format!("sources.{}.digest", source.path),
                    reason: "must be 64 hex characters".to_string(),
                }
            })?;
            if expected != digest {
                return Err(ManifestError::DigestMismatch {
                    path: source.path.clone(),
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        refs.push(SourceRef {
            path: source.path.clone(),
            digest,
        });
        blobs.push(SourceBlob {
            path: source.path.clone(),
            content,
        });
    }
    Ok((refs, blobs))
}

/// Collect manifest and schema files below `dir`, skipping hidden entries.
/// An unreadable directory is reported and skipped; its siblings are still
/// scanned.
fn walk(
    dir: &Path,
    manifests: &mut Vec<PathBuf>,
    schemas: &mut Vec<PathBuf>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let unreadable = |path: &Path, e: std::io::Error| Diagnostic {
        path: path.to_path_buf(),
        skill_id: None,
        error: ManifestError::Io(e.to_string()),
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            diagnostics.push(unreadable(dir, e));
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                diagnostics.push(unreadable(dir, e));
                continue;
            }
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                diagnostics.push(unreadable(&path, e));
                continue;
            }
        };
        if file_type.is_dir() {
            walk(&path, manifests, schemas, diagnostics);
        } else if name == MANIFEST_FILE {
            manifests.push(path);
        } else if name.ends_with(SCHEMA_SUFFIX) {
            schemas.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn builtin_manifest(id: &str) -> String {
        format!(
            r#"
            id = "{id}"
            version = "1.0.0"
            providers = ["builtin:echo"]
            input_schema = "skillgate.any"
            output_schema = "skillgate.any"
            "#
        )
    }

    fn loader() -> ManifestLoader {
        ManifestLoader::new([ProviderKind::Builtin, ProviderKind::RemoteTool, ProviderKind::Plugin])
    }

    #[test]
    fn test_load_orders_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "zeta/skill.toml", &builtin_manifest("zeta"));
        write(tmp.path(), "alpha/skill.toml", &builtin_manifest("alpha"));

        let (snapshot, diags) = loader().load(&[tmp.path().to_path_buf()]);
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(snapshot.ids().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_malformed_manifest_excluded_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "good/skill.toml", &builtin_manifest("good"));
        write(tmp.path(), "bad/skill.toml", "id = \"bad\"\nversion = \"1\"\n");

        let (snapshot, diags) = loader().load(&[tmp.path().to_path_buf()]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].path.ends_with("bad/skill.toml"));
    }

    #[test]
    fn test_duplicate_ids_exclude_all_declarations() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a/skill.toml", &builtin_manifest("same"));
        write(tmp.path(), "b/skill.toml", &builtin_manifest("same"));

        let (snapshot, diags) = loader().load(&[tmp.path().to_path_buf()]);
        assert!(snapshot.is_empty());
        assert_eq!(diags.len(), 2);
        assert!(diags
            .iter()
            .all(|d| matches!(d.error, ManifestError::DuplicateId { .. })));
    }

    #[test]
    fn test_unregistered_kind_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "s/skill.toml", &builtin_manifest("s"));

        let (snapshot, diags) =
            ManifestLoader::new([ProviderKind::Plugin]).load(&[tmp.path().to_path_buf()]);
        assert!(snapshot.is_empty());
        match &diags[0].error {
            ManifestError::UnregisteredProviderKind { kind } => assert_eq!(kind, "builtin"),
            other => panic!("expected UnregisteredProviderKind, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_schema_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        let text = builtin_manifest("s").replacen("skillgate.any", "s.input", 1);
        write(tmp.path(), "s/skill.toml", &text);

        let (snapshot, diags) = loader().load(&[tmp.path().to_path_buf()]);
        assert!(snapshot.is_empty());
        assert_eq!(diags[0].skill_id.as_deref(), Some("s"));
        assert!(matches!(diags[0].error, ManifestError::UnknownSchema { .. }));

        write(
            tmp.path(),
            "schemas/s.input.schema.json",
            r#"{"id": "s.input", "required": ["text"], "properties": {"text": "string"}}"#,
        );
        let (snapshot, diags) = loader().load(&[tmp.path().to_path_buf()]);
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_source_escape_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "secret.txt", "x");
        let text = format!("{}\n[[sources]]\npath = \"../secret.txt\"\n", builtin_manifest("s"));
        write(tmp.path(), "s/skill.toml", &text);

        let (_, diags) = loader().load(&[tmp.path().to_path_buf()]);
        assert!(matches!(diags[0].error, ManifestError::Source { .. }));
    }

    #[test]
    fn test_source_pin_checked() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "s/main.py", "print(1)\n");
        let wrong = "0".repeat(64);
        let text = format!(
            "{}\n[[sources]]\npath = \"main.py\"\ndigest = \"{wrong}\"\n",
            builtin_manifest("s")
        );
        write(tmp.path(), "s/skill.toml", &text);

        let (_, diags) = loader().load(&[tmp.path().to_path_buf()]);
        assert!(matches!(diags[0].error, ManifestError::DigestMismatch { .. }));

        let right = hash::source_digest(b"print(1)\n");
        let text = format!(
            "{}\n[[sources]]\npath = \"main.py\"\ndigest = \"{right}\"\n",
            builtin_manifest("s")
        );
        write(tmp.path(), "s/skill.toml", &text);
        let (snapshot, diags) = loader().load(&[tmp.path().to_path_buf()]);
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(snapshot.get("s").unwrap().sources[0].content, b"print(1)\n");
    }

    #[test]
    fn test_missing_root_reported() {
        let (snapshot, diags) = loader().load(&[PathBuf::from("/definitely/not/here")]);
        assert!(snapshot.is_empty());
        assert!(matches!(diags[0].error, ManifestError::Io(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_subdirectory_skipped_not_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "team/alpha/skill.toml", &builtin_manifest("alpha"));
        write(tmp.path(), "team/zeta/skill.toml", &builtin_manifest("zeta"));
        let locked = tmp.path().join("team/locked");
        fs::create_dir_all(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Privileged users read through the mode bits.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let (snapshot, diags) = loader().load(&[tmp.path().to_path_buf()]);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(snapshot.ids().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
        assert_eq!(diags.len(), 1, "{diags:?}");
        assert_eq!(diags[0].path, locked);
        assert!(matches!(diags[0].error, ManifestError::Io(_)));
    }

    #[test]
    fn test_hash_stable_across_loads() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "s/main.py", "print(1)\n");
        let text = format!("{}\n[[sources]]\npath = \"main.py\"\n", builtin_manifest("s"));
        write(tmp.path(), "s/skill.toml", &text);

        let roots = [tmp.path().to_path_buf()];
        let (a, _) = loader().load(&roots);
        let (b, _) = loader().load(&roots);
        assert_eq!(
            a.get("s").unwrap().security_hash,
            b.get("s").unwrap().security_hash
        );

        write(tmp.path(), "s/main.py", "print(2)\n");
        let (c, _) = loader().load(&roots);
        assert_ne!(
            a.get("s").unwrap().security_hash,
            c.get("s").unwrap().security_hash
        );
    }
}
