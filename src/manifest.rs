//! Run manifest: engine settings, resources to declare and faults to inject.
//!
//! ```toml
//! [engine]
//! workers = 2
//!
//! [[resource]]
//! kind = "replicaset"
//! name = "web"
//! replicas = 3
//! template = { image = "nginx:1.25" }
//!
//! [[fault]]
//! kind = "replicaset"
//! child = "web-2"
//! mode = "retryable"
//! times = 4
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use converge_reconciler::{
    ChildId, ChildSpec, DesiredSpec, Fault, FieldMap, ReconcilerConfig, ResourceKey,
};
use serde::Deserialize;
use thiserror::Error;

/// Errors loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid engine settings: {0}")]
    Engine(#[source] converge_reconciler::Error),

    #[error("resource '{key}': {reason}")]
    Resource { key: ResourceKey, reason: String },

    #[error("duplicate resource '{0}'")]
    Duplicate(ResourceKey),
}

/// One explicitly declared child.
#[derive(Debug, Clone, Deserialize)]
pub struct ChildEntry {
    pub id: ChildId,
    #[serde(default)]
    pub parent: Option<ChildId>,
    #[serde(default)]
    pub fields: FieldMap,
}

/// One resource to declare.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceEntry {
    pub kind: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(default = "default_generation")]
    pub generation: u64,
    /// Number of identical children built from `template`.
    #[serde(default)]
    pub replicas: usize,
    /// Child ID prefix for replicas; defaults to `{name}-`.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub template: FieldMap,
    /// Children declared one by one, after the replicas.
    #[serde(default, rename = "child")]
    pub children: Vec<ChildEntry>,
}

fn default_namespace() -> String {
    "default".to_string()
}

const fn default_generation() -> u64 {
    1
}

impl ResourceEntry {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, &self.namespace, &self.name)
    }

    /// Build the desired spec this entry describes.
    pub fn desired(&self) -> DesiredSpec {
        let prefix = self
            .prefix
            .clone()
            .unwrap_or_else(|| format!("{}-", self.name));
        self.children.iter().fold(
            DesiredSpec::replicated(self.generation, &prefix, self.replicas, &self.template),
            |spec, entry| {
                spec.with_child(ChildSpec {
                    id: entry.id.clone(),
                    parent: entry.parent.clone(),
                    fields: entry.fields.clone(),
                })
            },
        )
    }
}

/// A fault to inject into the cluster serving `kind` (every kind if unset).
#[derive(Debug, Clone, Deserialize)]
pub struct FaultEntry {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub fault: Fault,
}

/// Parsed run manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub engine: ReconcilerConfig,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceEntry>,
    #[serde(default, rename = "fault")]
    pub faults: Vec<FaultEntry>,
}

impl Manifest {
    /// Parse and validate a manifest document.
    pub fn from_toml_str(input: &str) -> Result<Self, ManifestError> {
        let manifest: Self = toml::from_str(input)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read, parse and validate a manifest file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        self.engine.validate().map_err(ManifestError::Engine)?;

        let mut seen = BTreeSet::new();
        for resource in &self.resources {
            let key = resource.key();
            resource
                .desired()
                .validate()
                .map_err(|violation| ManifestError::Resource {
                    key: key.clone(),
                    reason: violation.to_string(),
                })?;
            if !seen.insert(key.clone()) {
                return Err(ManifestError::Duplicate(key));
            }
        }
        Ok(())
    }

    /// Every kind that needs a controller, sorted.
    pub fn kinds(&self) -> BTreeSet<&str> {
        self.resources.iter().map(|r| r.kind.as_str()).collect()
    }

    /// Faults that apply to `kind`.
    pub fn faults_for<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Fault> + 'a {
        self.faults
            .iter()
            .filter(move |entry| entry.kind.as_deref().is_none_or(|k| k == kind))
            .map(|entry| &entry.fault)
    }
}
