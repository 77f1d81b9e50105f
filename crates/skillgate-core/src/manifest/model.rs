//! Capability manifest types.
//!
//! `RawManifest` mirrors the `skill.toml` file. `CapabilityManifest` is the
//! validated, closed form produced by [`RawManifest::validate`]; nothing
//! downstream ever sees the raw shape.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use skillgate_state::{AppliedLimits, SecurityHash};

use super::error::{ManifestError, ManifestResult};

// ---------------------------------------------------------------------------
// Provider references
// ---------------------------------------------------------------------------

/// Dispatch target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// In-process, synchronous.
    Builtin,
    /// Out-of-process request/response over a typed transport.
    RemoteTool,
    /// Untrusted code, always executed in the sandbox.
    Plugin,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Builtin => "builtin",
            ProviderKind::RemoteTool => "remote-tool",
            ProviderKind::Plugin => "plugin",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "builtin" => Ok(ProviderKind::Builtin),
            "remote-tool" => Ok(ProviderKind::RemoteTool),
            "plugin" => Ok(ProviderKind::Plugin),
            other => Err(ManifestError::UnknownProviderKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// A declared `provider_kind:tool_id` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderRef {
    pub kind: ProviderKind,
    pub tool_id: String,
}

impl ProviderRef {
    pub fn new(kind: ProviderKind, tool_id: impl Into<String>) -> Self {
        Self {
            kind,
            tool_id: tool_id.into(),
        }
    }
}

impl TryFrom<String> for ProviderRef {
    type Error = ManifestError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (kind, tool_id) = s
            .split_once(':')
            .ok_or_else(|| ManifestError::InvalidProviderRef { reference: s.clone() })?;
        let kind: ProviderKind = kind.parse()?;
        if !is_identifier(tool_id) {
            return Err(ManifestError::InvalidProviderRef { reference: s });
        }
        Ok(Self::new(kind, tool_id))
    }
}

impl From<ProviderRef> for String {
    fn from(r: ProviderRef) -> Self {
        r.to_string()
    }
}

impl std::fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.tool_id)
    }
}

// ---------------------------------------------------------------------------
// Isolation policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationMode {
    #[default]
    DirectDispatch,
    Orchestrated,
}

impl InvocationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationMode::DirectDispatch => "direct-dispatch",
            InvocationMode::Orchestrated => "orchestrated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default = "default_cpu_millis")]
    pub cpu_millis: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_wall_clock_ms")]
    pub wall_clock_ms: u64,
    #[serde(default = "default_stdout_bytes")]
    pub stdout_bytes: u64,
    #[serde(default = "default_stderr_bytes")]
    pub stderr_bytes: u64,
    #[serde(default = "default_output_bytes")]
    pub output_bytes: u64,
}

fn default_cpu_millis() -> u32 {
    1000
}
fn default_memory_mb() -> u32 {
    256
}
fn default_wall_clock_ms() -> u64 {
    10_000
}
fn default_stdout_bytes() -> u64 {
    64 * 1024
}
fn default_stderr_bytes() -> u64 {
    16 * 1024
}
fn default_output_bytes() -> u64 {
    64 * 1024
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_millis: default_cpu_millis(),
            memory_mb: default_memory_mb(),
            wall_clock_ms: default_wall_clock_ms(),
            stdout_bytes: default_stdout_bytes(),
            stderr_bytes: default_stderr_bytes(),
            output_bytes: default_output_bytes(),
        }
    }
}

impl ResourceLimits {
    fn validate(&self) -> ManifestResult<()> {
        let zero = [
            ("cpu_millis", self.cpu_millis as u64),
            ("memory_mb", self.memory_mb as u64),
            ("wall_clock_ms", self.wall_clock_ms),
            ("stdout_bytes", self.stdout_bytes),
            ("stderr_bytes", self.stderr_bytes),
            ("output_bytes", self.output_bytes),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        match zero {
            Some((field, _)) => Err(ManifestError::InvalidField {
                field: format!("isolation.limits.{field}"),
                reason: "must be greater than zero".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IsolationPolicy {
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Declares side effects; every call then needs a write checkpoint.
    #[serde(default)]
    pub write_access: bool,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

fn default_profile() -> String {
    "default".to_string()
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            write_access: false,
            network: false,
            env_allowlist: Vec::new(),
            limits: ResourceLimits::default(),
        }
    }
}

impl IsolationPolicy {
    /// Limits as recorded on receipts.
    pub fn applied_limits(&self) -> AppliedLimits {
        AppliedLimits {
            cpu_millis: self.limits.cpu_millis,
            memory_mb: self.limits.memory_mb,
            wall_clock_ms: self.limits.wall_clock_ms,
            stdout_bytes: self.limits.stdout_bytes,
            stderr_bytes: self.limits.stderr_bytes,
            output_bytes: self.limits.output_bytes,
            network: self.network,
        }
    }

    fn validate(&self) -> ManifestResult<()> {
        if !is_identifier(&self.profile) {
            return Err(ManifestError::InvalidField {
                field: "isolation.profile".to_string(),
                reason: format!("'{}' is not a valid profile name", self.profile),
            });
        }
        for name in &self.env_allowlist {
            if !is_env_name(name) {
                return Err(ManifestError::InvalidField {
                    field: "isolation.env_allowlist".to_string(),
                    reason: format!("'{name}' is not a valid environment variable name"),
                });
            }
        }
        self.limits.validate()
    }
}

// ---------------------------------------------------------------------------
// Sources and plugin spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSource {
    pub path: String,
    /// Optional pin; loading fails if the file's digest differs.
    #[serde(default)]
    pub digest: Option<String>,
}

/// A source file reference with its computed digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub path: String,
    pub digest: SecurityHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginSpec {
    /// Container image pinned by digest (`name@sha256:<64 hex>`).
    pub image: String,
    pub entrypoint: Vec<String>,
}

impl PluginSpec {
    /// The `sha256:<hex>` digest part of the image reference.
    pub fn image_digest(&self) -> Option<&str> {
        self.image.rsplit_once('@').map(|(_, d)| d)
    }

    fn validate(&self) -> ManifestResult<()> {
        let pinned = self
            .image_digest()
            .and_then(|d| d.strip_prefix("sha256:"))
            .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()));
        if !pinned {
            return Err(ManifestError::UnpinnedImage {
                image: self.image.clone(),
            });
        }
        if self.entrypoint.is_empty() || self.entrypoint.iter().any(|a| a.is_empty()) {
            return Err(ManifestError::InvalidField {
                field: "plugin.entrypoint".to_string(),
                reason: "must be a non-empty list of non-empty strings".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Raw and validated manifests
// ---------------------------------------------------------------------------

/// `skill.toml` as written on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawManifest {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub invocation_mode: InvocationMode,
    pub providers: Vec<String>,
    pub input_schema: String,
    pub output_schema: String,
    #[serde(default)]
    pub isolation: IsolationPolicy,
    #[serde(default)]
    pub sources: Vec<RawSource>,
    #[serde(default)]
    pub plugin: Option<PluginSpec>,
    #[serde(default)]
    pub metadata: toml::Table,
}

/// A validated skill declaration. Immutable once placed in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub id: String,
    pub version: String,
    pub description: String,
    pub invocation_mode: InvocationMode,
    pub providers: Vec<ProviderRef>,
    pub input_schema: String,
    pub output_schema: String,
    pub isolation: IsolationPolicy,
    pub sources: Vec<SourceRef>,
    pub plugin: Option<PluginSpec>,
    pub metadata: serde_json::Value,
}

impl CapabilityManifest {
    pub fn declares(&self, kind: ProviderKind) -> bool {
        self.providers.iter().any(|p| p.kind == kind)
    }

    /// Container image digest, present for plugin-kind skills.
    pub fn container_image_digest(&self) -> Option<&str> {
        self.plugin.as_ref().and_then(PluginSpec::image_digest)
    }
}

impl RawManifest {
    pub fn parse(text: &str) -> ManifestResult<Self> {
        toml::from_str(text).map_err(|e| ManifestError::Parse(e.message().to_string()))
    }

    /// Check every field that can be checked without touching the filesystem
    /// or the schema registry, and produce the closed form.
    ///
    /// `sources` carries the digests computed by the loader, in declaration
    /// order.
    pub fn validate(self, sources: Vec<SourceRef>) -> ManifestResult<CapabilityManifest> {
        if !is_identifier(&self.id) {
            return Err(ManifestError::InvalidField {
                field: "id".to_string(),
                reason: format!("'{}' must match [a-z0-9][a-z0-9._-]*", self.id),
            });
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::MissingField {
                field: "version".to_string(),
            });
        }
        if self.providers.is_empty() {
            return Err(ManifestError::MissingField {
                field: "providers".to_string(),
            });
        }

        let mut providers: Vec<ProviderRef> = Vec::with_capacity(self.providers.len());
        for raw in self.providers {
            let provider = ProviderRef::try_from(raw)?;
            if providers.contains(&provider) {
                return Err(ManifestError::InvalidField {
                    field: "providers".to_string(),
                    reason: format!("'{provider}' is declared twice"),
                });
            }
            providers.push(provider);
        }

        for (field, value) in [
            ("input_schema", &self.input_schema),
            ("output_schema", &self.output_schema),
        ] {
            if value.trim().is_empty() {
                return Err(ManifestError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        self.isolation.validate()?;

        let needs_plugin = providers.iter().any(|p| p.kind == ProviderKind::Plugin);
        match (&self.plugin, needs_plugin) {
            (Some(plugin), true) => plugin.validate()?,
            (None, true) => {
                return Err(ManifestError::MissingField {
                    field: "plugin".to_string(),
                })
            }
            (Some(_), false) => {
                return Err(ManifestError::InvalidField {
                    field: "plugin".to_string(),
                    reason: "only plugin-kind skills may declare a container image".to_string(),
                })
            }
            (None, false) => {}
        }

        let metadata = toml_to_json("metadata", toml::Value::Table(self.metadata))?;

        Ok(CapabilityManifest {
            id: self.id,
            version: self.version,
            description: self.description,
            invocation_mode: self.invocation_mode,
            providers,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            isolation: self.isolation,
            sources,
            plugin: self.plugin,
            metadata,
        })
    }
}

/// Convert free-form TOML into JSON for hashing. Datetimes have no canonical
/// JSON form and are rejected.
fn toml_to_json(path: &str, value: toml::Value) -> ManifestResult<serde_json::Value> {
    use serde_json::Value as J;
    Ok(match value {
        toml::Value::String(s) => J::String(s),
        toml::Value::Integer(i) => J::from(i),
        toml::Value::Float(f) => {
            serde_json::Number::from_f64(f)
                .map(J::Number)
                .ok_or_else(|| ManifestError::UnsupportedValue {
                    path: path.to_string(),
                    reason: "non-finite float".to_string(),
                })?
        }
        toml::Value::Boolean(b) => J::Bool(b),
        toml::Value::Datetime(_) => {
            return Err(ManifestError::UnsupportedValue {
                path: path.to_string(),
                reason: "datetime values are not supported".to_string(),
            })
        }
        toml::Value::Array(items) => J::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| toml_to_json(&format!("{path}[{i}]"), v))
                .collect::<ManifestResult<Vec<_>>>()?,
        ),
        toml::Value::Table(table) => {
            let mut map = serde_json::Map::new();
            for (k, v) in table {
                let child = toml_to_json(&format!("{path}.{k}"), v)?;
                map.insert(k, child);
            }
            J::Object(map)
        }
    })
}

/// Lowercase identifier: `[a-z0-9][a-z0-9._-]*`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

fn is_env_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// A relative path that stays inside its base directory.
pub fn is_contained_path(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLUGIN: &str = r#"
        id = "notes.summarize"
        version = "1.0.0"
        providers = ["plugin:summarize"]
        input_schema = "notes.input"
        output_schema = "notes.output"

        [isolation]
        env_allowlist = ["LANG"]

        [plugin]
        image = "registry.local/py@sha256:0000000000000000000000000000000000000000000000000000000000000000"
        entrypoint = ["python3", "/skill/src/main.py"]

        [metadata]
        owner = "team-notes"
        tags = ["a", "b"]
    "#;

    fn validate(text: &str) -> ManifestResult<CapabilityManifest> {
        RawManifest::parse(text)?.validate(Vec::new())
    }

    #[test]
    fn test_valid_plugin_manifest() {
        let m = validate(PLUGIN).unwrap();
        assert_eq!(m.providers, vec![ProviderRef::new(ProviderKind::Plugin, "summarize")]);
        assert_eq!(m.invocation_mode, InvocationMode::DirectDispatch);
        assert_eq!(
            m.container_image_digest().map(|d| d.len()),
            Some("sha256:".len() + 64)
        );
        assert_eq!(m.metadata["tags"][1], "b");
    }

    #[test]
    fn test_plugin_requires_pinned_image() {
        let text = PLUGIN.replace(
            "registry.local/py@sha256:0000000000000000000000000000000000000000000000000000000000000000",
            "registry.local/py:latest",
        );
        match validate(&text) {
            Err(ManifestError::UnpinnedImage { image }) => assert!(image.contains("latest")),
            other => panic!("expected UnpinnedImage, got {other:?}"),
        }
    }

    #[test]
    fn test_plugin_requires_plugin_section() {
        let text = PLUGIN.split("[plugin]").next().unwrap().to_string();
        match validate(&text) {
            Err(ManifestError::MissingField { field }) => assert_eq!(field, "plugin"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = format!("surprise = true\n{PLUGIN}");
        assert!(matches!(validate(&text), Err(ManifestError::Parse(_))));
    }

    #[test]
    fn test_unknown_provider_kind_rejected() {
        let text = PLUGIN.replace("plugin:summarize", "wasm:summarize");
        match validate(&text) {
            Err(ManifestError::UnknownProviderKind { kind }) => assert_eq!(kind, "wasm"),
            other => panic!("expected UnknownProviderKind, got {other:?}"),
        }
    }

    #[test]
    fn test_datetime_metadata_rejected() {
        let text = format!("{PLUGIN}\ncreated = 1979-05-27T07:32:00Z\n");
        match validate(&text) {
            Err(ManifestError::UnsupportedValue { path, .. }) => {
                assert_eq!(path, "metadata.created")
            }
            other => panic!("expected UnsupportedValue, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_limit_rejected() {
        let text = PLUGIN.replace(
            "env_allowlist = [\"LANG\"]",
            "env_allowlist = [\"LANG\"]\n[isolation.limits]\nwall_clock_ms = 0",
        );
        match validate(&text) {
            Err(ManifestError::InvalidField { field, .. }) => {
                assert_eq!(field, "isolation.limits.wall_clock_ms")
            }
            other => panic!("expected InvalidField, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_env_name_rejected() {
        let text = PLUGIN.replace("\"LANG\"", "\"lang-x\"");
        assert!(matches!(
            validate(&text),
            Err(ManifestError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("notes.summarize"));
        assert!(is_identifier("a1_b-c"));
        assert!(!is_identifier("Notes"));
        assert!(!is_identifier(".hidden"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_contained_paths() {
        assert!(is_contained_path("main.py"));
        assert!(is_contained_path("lib/util.py"));
        assert!(!is_contained_path("../escape.py"));
        assert!(!is_contained_path("/etc/passwd"));
        assert!(!is_contained_path(""));
    }
}
