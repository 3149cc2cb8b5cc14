//! Bundle packing.
//!
//! [`pack_bundle`] reads a manifest next to its model files, collects every
//! file the manifest references and writes a `QGENIE1` container. References
//! are normalized to `/`-separated names relative to the manifest directory,
//! and the stored manifest is rewritten to use those names, so the bundle
//! resolves the same way regardless of where it was packed.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::config::ContainerConfig;
use crate::container::{reject_input_overwrite, safe_entry_path, write_bundle, PackEntry, TocEntry};
use crate::error::{BundleError, Result};
use crate::manifest::{self, json_type, keys, Manifest};

/// Result of a completed pack.
#[derive(Debug, Clone, Serialize)]
pub struct PackSummary {
    pub output: PathBuf,
    pub entries: Vec<TocEntry>,
}

impl PackSummary {
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Pack the manifest at `config_path` and its referenced files into `output`.
pub fn pack_bundle(config_path: &Path, output: &Path, level: i32) -> Result<PackSummary> {
    if !(ContainerConfig::MIN_ZSTD_LEVEL..=ContainerConfig::MAX_ZSTD_LEVEL).contains(&level) {
        return Err(BundleError::container(format!(
            "Compression level {} outside {}..={}",
            level,
            ContainerConfig::MIN_ZSTD_LEVEL,
            ContainerConfig::MAX_ZSTD_LEVEL
        )));
    }

    reject_input_overwrite(output, [config_path])?;
    let manifest = Manifest::from_file(config_path)?;
    let mut section = manifest.into_section(None)?;
    let kind = section.kind();

    let base = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut collector = Collector::new(base, config_path)?;

    let node = section.node_mut();
    collector.collect(node, keys::TOKENIZER_PATH, kind.as_str())?;
    if node.pointer(keys::EMBEDDING_TYPE).and_then(Value::as_str) == Some(keys::LUT_TYPE) {
        collector.collect(node, keys::EMBEDDING_LUT_PATH, kind.as_str())?;
    }
    if node.get(keys::LUT).is_some() {
        collector.collect(node, keys::LUT_PATH, kind.as_str())?;
    }

    let labels: Vec<String> = match manifest::engines(node) {
        Some(engines) => (0..engines.len())
            .map(|index| manifest::engine_label(kind, index, node))
            .collect(),
        None => {
            return Err(BundleError::malformed(
                config_path,
                format!("{}.engine must be an object or an array of objects", kind),
            ))
        }
    };
    let engines = manifest::engines_mut(node).unwrap_or_default();
    for (engine, label) in engines.into_iter().zip(labels) {
        collector.collect_engine(engine, &label)?;
    }

    let document = section.into_resolved().into_document();
    let config = serde_json::to_vec_pretty(&document).map_err(|e| BundleError::ManifestMalformed {
        path: config_path.to_path_buf(),
        message: e.to_string(),
        source: Some(e),
    })?;

    let entries = write_bundle(output, &config, &collector.entries, level)?;
    info!(
        "Packed {} ({} files) into {}",
        config_path.display(),
        entries.len(),
        output.display()
    );
    Ok(PackSummary {
        output: output.to_path_buf(),
        entries,
    })
}

/// Gathers referenced files in first-seen order.
struct Collector<'a> {
    base: &'a Path,
    canonical_base: PathBuf,
    config_path: &'a Path,
    entries: Vec<PackEntry>,
    seen: HashSet<String>,
}

impl<'a> Collector<'a> {
    fn new(base: &'a Path, config_path: &'a Path) -> Result<Self> {
        let canonical_base = fs::canonicalize(base).map_err(|e| BundleError::io_with_path(e, base))?;
        Ok(Self {
            base,
            canonical_base,
            config_path,
            entries: Vec::new(),
            seen: HashSet::new(),
        })
    }

    /// Collect the reference at `pointer`, if any. The file must exist.
    fn collect(&mut self, node: &mut Value, pointer: &str, prefix: &str) -> Result<Option<String>> {
        let field = manifest::pointer_label(prefix, pointer);
        match node.pointer_mut(pointer) {
            None => Ok(None),
            Some(Value::String(value)) => {
                let name = self.add(&field, value)?;
                *value = name.clone();
                Ok(Some(name))
            }
            Some(other) => Err(BundleError::malformed(
                self.config_path,
                format!("{} must be a string, got {}", field, json_type(other)),
            )),
        }
    }

    fn collect_engine(&mut self, engine: &mut Value, label: &str) -> Result<()> {
        if !engine.is_object() {
            return Err(BundleError::malformed(
                self.config_path,
                format!("{} must be an object, got {}", label, json_type(engine)),
            ));
        }

        if engine.pointer(keys::BACKEND_TYPE).and_then(Value::as_str) == Some(keys::QNN_HTP) {
            self.collect_extensions(engine, label)?;
        }

        if engine.pointer(keys::MODEL_TYPE).and_then(Value::as_str) == Some(keys::BINARY_MODEL) {
            let field = manifest::pointer_label(label, keys::CTX_BINS);
            let Some(Value::Array(items)) = engine.pointer_mut(keys::CTX_BINS) else {
                return Err(BundleError::malformed(
                    self.config_path,
                    format!("{} must be an array of paths for binary models", field),
                ));
            };
            for (index, item) in items.iter_mut().enumerate() {
                let item_field = format!("{}[{}]", field, index);
                let value = match item {
                    Value::String(value) => value,
                    other => {
                        return Err(BundleError::malformed(
                            self.config_path,
                            format!("{} must be a string, got {}", item_field, json_type(other)),
                        ))
                    }
                };
                *value = self.add(&item_field, value)?;
            }
        } else if self.collect(engine, keys::MODEL_BIN, label)?.is_none() {
            return Err(BundleError::malformed(
                self.config_path,
                format!(
                    "{} is required for library models",
                    manifest::pointer_label(label, keys::MODEL_BIN)
                ),
            ));
        }
        Ok(())
    }

    /// Bundle a relative extension config if it exists; otherwise leave the
    /// value for the resolver's default fallback.
    fn collect_extensions(&mut self, engine: &mut Value, label: &str) -> Result<()> {
        let Some(Value::String(value)) = engine
            .get_mut(keys::BACKEND)
            .and_then(|backend| backend.get_mut(keys::EXTENSIONS))
        else {
            return Ok(());
        };
        if Path::new(value.as_str()).is_absolute() || !self.base.join(value.as_str()).is_file() {
            debug!("{}: extension config {} not bundled", label, value);
            return Ok(());
        }
        let field = format!("{}.backend.extensions", label);
        *value = self.add(&field, value)?;
        Ok(())
    }

    /// Register `reference` and return its entry name.
    fn add(&mut self, field: &str, reference: &str) -> Result<String> {
        let name = self.entry_name(field, reference)?;
        let source = self.base.join(&name);
        if !source.is_file() {
            return Err(BundleError::PathResolutionFailure {
                field: field.to_string(),
                path: source,
            });
        }
        if self.seen.insert(name.clone()) {
            debug!("Collected {} for {}", name, field);
            self.entries.push(PackEntry {
                name: name.clone(),
                source,
            });
        }
        Ok(name)
    }

    fn entry_name(&self, field: &str, reference: &str) -> Result<String> {
        let path = Path::new(reference);
        let relative = if path.is_absolute() {
            let canonical = fs::canonicalize(path).map_err(|_| BundleError::PathResolutionFailure {
                field: field.to_string(),
                path: path.to_path_buf(),
            })?;
            canonical
                .strip_prefix(&self.canonical_base)
                .map(Path::to_path_buf)
                .map_err(|_| self.escapes(field, reference))?
        } else {
            path.to_path_buf()
        };
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(self.escapes(field, reference));
        }

        let name = safe_entry_path(&relative.to_string_lossy())
            .map_err(|e| BundleError::malformed(self.config_path, format!("{}: {}", field, e)))?;
        let parts: Vec<String> = name
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }

    fn escapes(&self, field: &str, reference: &str) -> BundleError {
        BundleError::malformed(
            self.config_path,
            format!(
                "{} ({}) is outside {}",
                field,
                reference,
                self.base.display()
            ),
        )
    }
}
