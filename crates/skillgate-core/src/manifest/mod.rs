//! Capability manifests: file model, validation, loading and snapshots.

pub mod error;
mod loader;
mod model;
mod snapshot;

pub use error::{ManifestError, ManifestResult};
pub use loader::{Diagnostic, ManifestLoader, MANIFEST_FILE, SCHEMA_SUFFIX};
pub use model::{
    is_contained_path, is_identifier, CapabilityManifest, InvocationMode, IsolationPolicy,
    PluginSpec, ProviderKind, ProviderRef, RawManifest, RawSource, ResourceLimits, SourceRef,
};
pub use snapshot::{ManifestSummary, SkillEntry, Snapshot, SourceBlob};
