//! Bundle manifest (`config.json`) model.
//!
//! A manifest is kept as a JSON tree so that keys the resolver does not know
//! about pass through to the engine untouched. The one thing decoded up front
//! is the model kind: exactly one top-level section (`dialog`, `embedding`,
//! ...) selects it, and [`Manifest::into_section`] splits that section out so
//! the rest of the pipeline works on a typed [`ModelSection`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{BundleError, Result};

/// JSON pointers into a model section or engine node.
pub(crate) mod keys {
    pub const ENGINE: &str = "engine";
    pub const LUT: &str = "lut";

    pub const TOKENIZER_PATH: &str = "/tokenizer/path";
    pub const EMBEDDING_TYPE: &str = "/embedding/type";
    pub const EMBEDDING_LUT_PATH: &str = "/embedding/lut-path";
    pub const LUT_PATH: &str = "/lut/lut-path";

    pub const BACKEND: &str = "backend";
    pub const BACKEND_TYPE: &str = "/backend/type";
    pub const EXTENSIONS: &str = "extensions";
    pub const QNN_HTP: &str = "QnnHtp";
    pub const USE_MMAP: &str = "use-mmap";
    pub const MODEL_TYPE: &str = "/model/type";
    pub const CTX_BINS: &str = "/model/binary/ctx-bins";
    pub const MODEL_BIN: &str = "/model/library/model-bin";
    pub const N_THREADS: &str = "n-threads";

    pub const LUT_TYPE: &str = "lut";
    pub const BINARY_MODEL: &str = "binary";
}

/// Model kind, selected by the manifest's top-level section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    Dialog,
    Embedding,
    TextGenerator,
    TextEncoder,
    ImageEncoder,
}

impl ModelKind {
    /// All kinds in section lookup priority order.
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Dialog,
        ModelKind::Embedding,
        ModelKind::TextGenerator,
        ModelKind::TextEncoder,
        ModelKind::ImageEncoder,
    ];

    /// Top-level manifest key for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Dialog => "dialog",
            ModelKind::Embedding => "embedding",
            ModelKind::TextGenerator => "text-generator",
            ModelKind::TextEncoder => "text-encoder",
            ModelKind::ImageEncoder => "image-encoder",
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dialog" => Ok(ModelKind::Dialog),
            "embedding" => Ok(ModelKind::Embedding),
            "text-generator" => Ok(ModelKind::TextGenerator),
            "text-encoder" => Ok(ModelKind::TextEncoder),
            "image-encoder" => Ok(ModelKind::ImageEncoder),
            _ => {
                let known: Vec<&str> = ModelKind::ALL.iter().map(ModelKind::as_str).collect();
                Err(format!(
                    "unknown model kind '{}' (expected one of {})",
                    s,
                    known.join(", ")
                ))
            }
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed manifest document.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    root: Map<String, Value>,
}

impl Manifest {
    /// Load a manifest from disk without blocking the runtime.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| BundleError::ManifestUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_slice(path, &bytes)
    }

    /// Load a manifest from disk synchronously.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| BundleError::ManifestUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(path, &bytes)
    }

    /// Parse manifest bytes. `path` is only used for error context.
    pub fn from_slice(path: impl Into<PathBuf>, bytes: &[u8]) -> Result<Self> {
        let path = path.into();
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| BundleError::ManifestMalformed {
                path: path.clone(),
                message: e.to_string(),
                source: Some(e),
            })?;

        match value {
            Value::Object(root) => Ok(Self { path, root }),
            other => Err(BundleError::malformed(
                path,
                format!("top-level value must be an object, got {}", json_type(&other)),
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Kinds whose section is present, in priority order.
    pub fn present_kinds(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|kind| self.root.contains_key(kind.as_str()))
            .collect()
    }

    /// The first present section in priority order.
    pub fn discover_kind(&self) -> Option<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| self.root.contains_key(kind.as_str()))
    }

    /// Split out the model section, validating it against `expected`.
    pub fn into_section(mut self, expected: Option<ModelKind>) -> Result<ModelSection> {
        let present = self.present_kinds();
        let Some(&kind) = present.first() else {
            return Err(BundleError::NoRecognizedSection { path: self.path });
        };
        if present.len() > 1 {
            warn!(
                "Manifest {} has several model sections {:?}, using {}",
                self.path.display(),
                present.iter().map(ModelKind::as_str).collect::<Vec<_>>(),
                kind
            );
        }

        if let Some(expected) = expected {
            if expected != kind {
                return Err(BundleError::KindMismatch {
                    expected,
                    found: kind,
                });
            }
        }

        let node = self.root.remove(kind.as_str()).unwrap_or(Value::Null);
        if !node.is_object() {
            return Err(BundleError::malformed(
                self.path,
                format!("{} must be an object, got {}", kind, json_type(&node)),
            ));
        }

        Ok(ModelSection {
            kind,
            manifest_path: self.path,
            node,
            rest: self.root,
        })
    }
}

/// The selected model section plus the remainder of the manifest.
#[derive(Debug, Clone)]
pub struct ModelSection {
    kind: ModelKind,
    manifest_path: PathBuf,
    node: Value,
    rest: Map<String, Value>,
}

impl ModelSection {
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn node(&self) -> &Value {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Value {
        &mut self.node
    }

    /// Reassemble the full document.
    pub fn into_resolved(self) -> ResolvedConfig {
        let mut root = self.rest;
        root.insert(self.kind.as_str().to_string(), self.node);
        ResolvedConfig {
            kind: self.kind,
            document: Value::Object(root),
        }
    }
}

/// A manifest with every bundle-relative path rewritten, ready for
/// engine construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    kind: ModelKind,
    document: Value,
}

impl ResolvedConfig {
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn into_document(self) -> Value {
        self.document
    }

    /// The model section of the resolved document.
    pub fn section(&self) -> &Value {
        &self.document[self.kind.as_str()]
    }

    /// Engine nodes of the resolved document in order.
    pub fn engines(&self) -> Vec<&Value> {
        engines(self.section()).unwrap_or_default()
    }

    /// Compact JSON, the form handed to the engine.
    pub fn to_json_string(&self) -> String {
        self.document.to_string()
    }

    pub fn to_json_pretty(&self) -> String {
        format!("{:#}", self.document)
    }
}

impl Serialize for ResolvedConfig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.document.serialize(serializer)
    }
}

/// Engine nodes of a section: a lone object becomes a one-element list.
pub(crate) fn engines(section: &Value) -> Option<Vec<&Value>> {
    let node = section.get(keys::ENGINE)?;
    if node.is_object() {
        return Some(vec![node]);
    }
    node.as_array().map(|items| items.iter().collect())
}

/// Mutable variant of [`engines`]; the original shape is left as is.
pub(crate) fn engines_mut(section: &mut Value) -> Option<Vec<&mut Value>> {
    let node = section.get_mut(keys::ENGINE)?;
    if node.is_object() {
        return Some(vec![node]);
    }
    node.as_array_mut().map(|items| items.iter_mut().collect())
}

/// Human-readable label for an engine node, e.g. `dialog.engine[1]`.
pub(crate) fn engine_label(kind: ModelKind, index: usize, section: &Value) -> String {
    if section.get(keys::ENGINE).is_some_and(Value::is_array) {
        format!("{}.engine[{}]", kind, index)
    } else {
        format!("{}.engine", kind)
    }
}

/// Dotted label for a JSON pointer, e.g. `/tokenizer/path` -> `tokenizer.path`.
pub(crate) fn pointer_label(prefix: &str, pointer: &str) -> String {
    format!("{}{}", prefix, pointer.replace('/', "."))
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
