//! Bundle resolution: unpack, parse, select, rewrite.
//!
//! [`BundleResolver::resolve`] turns a bundle plus an unpack directory into a
//! [`ResolvedConfig`] whose file references are all absolute. It runs five
//! steps in order and checks its [`CancellationToken`] before each one:
//!
//! 1. ensure the bundle is unpacked (under an exclusive lock on the directory)
//! 2. read and parse `config.json`
//! 3. select the model section
//! 4. rewrite tokenizer and LUT paths
//! 5. rewrite engine paths and apply backend patches
//!
//! Any failure aborts the whole call; no partially resolved config escapes.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::BundleConfig;
use crate::container::ContainerUnpacker;
use crate::defaults::default_extensions_path;
use crate::error::{BundleError, Result, UnpackError};
use crate::manifest::{self, keys, json_type, Manifest, ModelKind, ModelSection, ResolvedConfig};

/// Extracts a bundle archive into a directory.
///
/// The default implementation is [`ContainerUnpacker`]; hosts with their own
/// archive format plug in here.
pub trait BundleUnpacker: Send + Sync {
    fn unpack(&self, bundle_path: &Path, unpack_dir: &Path) -> std::result::Result<(), UnpackError>;
}

/// Whether the HTP backend may memory-map weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MmapPolicy {
    /// Set `use-mmap: true`.
    Enabled,
    /// Set `use-mmap: false`.
    Disabled,
    /// Leave whatever the manifest says.
    Manifest,
}

impl MmapPolicy {
    /// Memory-mapped loading is disabled on Windows and enabled elsewhere.
    pub fn for_current_platform() -> Self {
        if cfg!(windows) {
            MmapPolicy::Disabled
        } else {
            MmapPolicy::Enabled
        }
    }

    fn flag(&self) -> Option<bool> {
        match self {
            MmapPolicy::Enabled => Some(true),
            MmapPolicy::Disabled => Some(false),
            MmapPolicy::Manifest => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MmapPolicy::Enabled => "enabled",
            MmapPolicy::Disabled => "disabled",
            MmapPolicy::Manifest => "manifest",
        }
    }
}

impl std::str::FromStr for MmapPolicy {
    type Err = String;

    /// `auto` maps to [`MmapPolicy::for_current_platform`].
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "enabled" | "on" | "true" => Ok(MmapPolicy::Enabled),
            "disabled" | "off" | "false" => Ok(MmapPolicy::Disabled),
            "manifest" => Ok(MmapPolicy::Manifest),
            "auto" => Ok(MmapPolicy::for_current_platform()),
            _ => Err(format!(
                "unknown mmap policy '{}' (expected enabled, disabled, manifest or auto)",
                s
            )),
        }
    }
}

impl std::fmt::Display for MmapPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-call options for [`BundleResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Section the caller requires; `None` accepts any.
    pub expected_kind: Option<ModelKind>,
    /// Engine thread count; only strictly positive values take effect.
    pub thread_override: Option<u32>,
    pub mmap_policy: MmapPolicy,
    /// Unpack even if `config.json` already exists.
    pub force_unpack: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            expected_kind: None,
            thread_override: None,
            mmap_policy: MmapPolicy::for_current_platform(),
            force_unpack: false,
        }
    }
}

impl ResolveOptions {
    pub fn expect_kind(mut self, kind: ModelKind) -> Self {
        self.expected_kind = Some(kind);
        self
    }

    pub fn threads(mut self, n_threads: u32) -> Self {
        self.thread_override = Some(n_threads);
        self
    }

    pub fn mmap(mut self, policy: MmapPolicy) -> Self {
        self.mmap_policy = policy;
        self
    }

    pub fn force_unpack(mut self, force: bool) -> Self {
        self.force_unpack = force;
        self
    }

    fn effective_threads(&self) -> Option<u32> {
        self.thread_override.filter(|n| *n > 0)
    }
}

/// Progress of a single resolve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStage {
    Unresolved,
    Unpacking,
    Parsing,
    SectionSelected,
    PathsRewritten,
    Resolved,
}

impl ResolveStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveStage::Unresolved => "unresolved",
            ResolveStage::Unpacking => "unpacking",
            ResolveStage::Parsing => "parsing",
            ResolveStage::SectionSelected => "section-selected",
            ResolveStage::PathsRewritten => "paths-rewritten",
            ResolveStage::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for ResolveStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Turns bundles into resolved engine configs.
///
/// Cheap to clone; clones share the unpacker.
#[derive(Clone)]
pub struct BundleResolver {
    unpacker: Arc<dyn BundleUnpacker>,
    default_extensions: PathBuf,
}

impl std::fmt::Debug for BundleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleResolver")
            .field("default_extensions", &self.default_extensions)
            .finish_non_exhaustive()
    }
}

impl Default for BundleResolver {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BundleResolver {
    /// Resolver using [`ContainerUnpacker`] and the default extensions path.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> BundleResolverBuilder {
        BundleResolverBuilder::new()
    }

    /// Path substituted for missing HTP extension configs.
    pub fn default_extensions(&self) -> &Path {
        &self.default_extensions
    }

    /// Resolve `bundle_path` into `unpack_dir`.
    pub async fn resolve(
        &self,
        bundle_path: impl AsRef<Path>,
        unpack_dir: impl AsRef<Path>,
        options: &ResolveOptions,
        cancel: &CancellationToken,
    ) -> Result<ResolvedConfig> {
        let bundle_path = bundle_path.as_ref().to_path_buf();
        let unpack_dir = unpack_dir.as_ref().to_path_buf();
        let mut stage = ResolveStage::Unresolved;

        let result = self
            .run(&bundle_path, &unpack_dir, options, cancel, &mut stage)
            .await;
        match &result {
            Ok(config) => info!(
                "Resolved {} bundle {} in {}",
                config.kind(),
                bundle_path.display(),
                unpack_dir.display()
            ),
            Err(e) => warn!(
                "Resolving {} failed during {}: {}",
                bundle_path.display(),
                stage,
                e
            ),
        }
        result
    }

    async fn run(
        &self,
        bundle_path: &Path,
        unpack_dir: &Path,
        options: &ResolveOptions,
        cancel: &CancellationToken,
        stage: &mut ResolveStage,
    ) -> Result<ResolvedConfig> {
        cancel.check()?;
        advance(stage, ResolveStage::Unpacking);
        self.ensure_unpacked(bundle_path, unpack_dir, options.force_unpack)
            .await?;

        cancel.check()?;
        advance(stage, ResolveStage::Parsing);
        let manifest_path = unpack_dir.join(BundleConfig::MANIFEST_FILE_NAME);
        let manifest = Manifest::load(&manifest_path).await?;

        cancel.check()?;
        let mut section = manifest.into_section(options.expected_kind)?;
        advance(stage, ResolveStage::SectionSelected);

        cancel.check()?;
        let rewriter = PathRewriter {
            unpack_dir: unpack_dir.to_path_buf(),
            default_extensions: self.default_extensions.clone(),
            options: options.clone(),
        };
        rewriter.rewrite_auxiliary(&mut section)?;

        cancel.check()?;
        let section = tokio::task::spawn_blocking(move || {
            rewriter.rewrite_engines(&mut section)?;
            Ok::<_, BundleError>(section)
        })
        .await
        .map_err(join_error)??;
        advance(stage, ResolveStage::PathsRewritten);

        let resolved = section.into_resolved();
        advance(stage, ResolveStage::Resolved);
        Ok(resolved)
    }

    async fn ensure_unpacked(&self, bundle_path: &Path, unpack_dir: &Path, force: bool) -> Result<()> {
        let unpacker = Arc::clone(&self.unpacker);
        let bundle_path = bundle_path.to_path_buf();
        let unpack_dir = unpack_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            ensure_unpacked_blocking(unpacker.as_ref(), &bundle_path, &unpack_dir, force)
        })
        .await
        .map_err(join_error)?
    }
}

/// Builder for [`BundleResolver`].
pub struct BundleResolverBuilder {
    unpacker: Option<Arc<dyn BundleUnpacker>>,
    default_extensions: Option<PathBuf>,
}

impl BundleResolverBuilder {
    pub fn new() -> Self {
        Self {
            unpacker: None,
            default_extensions: None,
        }
    }

    /// Use a custom unpacker.
    ///
    /// Default: [`ContainerUnpacker`]
    pub fn unpacker(mut self, unpacker: impl BundleUnpacker + 'static) -> Self {
        self.unpacker = Some(Arc::new(unpacker));
        self
    }

    /// Path substituted when an HTP engine has no usable extension config.
    ///
    /// Default: `htp_backend_ext_config.json` next to the executable
    pub fn default_extensions(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_extensions = Some(path.into());
        self
    }

    pub fn build(self) -> BundleResolver {
        BundleResolver {
            unpacker: self
                .unpacker
                .unwrap_or_else(|| Arc::new(ContainerUnpacker)),
            default_extensions: self
                .default_extensions
                .unwrap_or_else(default_extensions_path),
        }
    }
}

impl Default for BundleResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn advance(stage: &mut ResolveStage, next: ResolveStage) {
    debug!("Resolve stage {} -> {}", stage, next);
    *stage = next;
}

fn join_error(err: tokio::task::JoinError) -> BundleError {
    BundleError::Io {
        message: format!("Blocking task failed: {}", err),
        path: None,
        source: None,
    }
}

fn ensure_unpacked_blocking(
    unpacker: &dyn BundleUnpacker,
    bundle_path: &Path,
    unpack_dir: &Path,
    force: bool,
) -> Result<()> {
    fs::create_dir_all(unpack_dir).map_err(|e| BundleError::io_with_path(e, unpack_dir))?;

    let lock_path = unpack_dir.join(BundleConfig::LOCK_FILE_NAME);
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| BundleError::io_with_path(e, &lock_path))?;
    lock_file
        .lock_exclusive()
        .map_err(|e| BundleError::io_with_path(e, &lock_path))?;

    let result = unpack_locked(unpacker, bundle_path, unpack_dir, force);

    if let Err(e) = FileExt::unlock(&lock_file) {
        warn!("Failed to release lock {}: {}", lock_path.display(), e);
    }
    result
}

/// Unpack while the directory lock is held.
///
/// A forced unpack removes the old `config.json` first, so a failure midway
/// leaves a directory that no later call will mistake for a complete one.
fn unpack_locked(
    unpacker: &dyn BundleUnpacker,
    bundle_path: &Path,
    unpack_dir: &Path,
    force: bool,
) -> Result<()> {
    let manifest_path = unpack_dir.join(BundleConfig::MANIFEST_FILE_NAME);
    if !force && manifest_path.is_file() {
        debug!(
            "Manifest already present at {}, skipping unpack",
            manifest_path.display()
        );
        return Ok(());
    }

    match fs::remove_file(&manifest_path) {
        Ok(()) => debug!("Removed stale {}", manifest_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(BundleError::io_with_path(e, &manifest_path)),
    }

    info!(
        "Unpacking {} into {}",
        bundle_path.display(),
        unpack_dir.display()
    );
    unpacker
        .unpack(bundle_path, unpack_dir)
        .and_then(|()| {
            if manifest_path.is_file() {
                Ok(())
            } else {
                Err(format!("bundle produced no {}", BundleConfig::MANIFEST_FILE_NAME).into())
            }
        })
        .map_err(|source| BundleError::UnpackFailure {
            bundle: bundle_path.to_path_buf(),
            source,
        })
}

/// Rewrites bundle-relative references against the unpack directory.
struct PathRewriter {
    unpack_dir: PathBuf,
    default_extensions: PathBuf,
    options: ResolveOptions,
}

impl PathRewriter {
    fn join(&self, value: &str) -> PathBuf {
        self.unpack_dir.join(value)
    }

    fn rewrite_auxiliary(&self, section: &mut ModelSection) -> Result<()> {
        let prefix = section.kind().as_str();
        let manifest_path = section.manifest_path().to_path_buf();
        let node = section.node_mut();

        self.rewrite_string(node, keys::TOKENIZER_PATH, &manifest_path, prefix)?;

        if node.pointer(keys::EMBEDDING_TYPE).and_then(Value::as_str) == Some(keys::LUT_TYPE) {
            self.rewrite_string(node, keys::EMBEDDING_LUT_PATH, &manifest_path, prefix)?;
        }
        if node.get(keys::LUT).is_some() {
            self.rewrite_string(node, keys::LUT_PATH, &manifest_path, prefix)?;
        }
        Ok(())
    }

    /// Rewrite the string at `pointer` if present; returns the new path.
    fn rewrite_string(
        &self,
        node: &mut Value,
        pointer: &str,
        manifest_path: &Path,
        prefix: &str,
    ) -> Result<Option<PathBuf>> {
        match node.pointer_mut(pointer) {
            None => Ok(None),
            Some(Value::String(value)) => {
                let resolved = self.join(value);
                *value = path_string(&resolved);
                Ok(Some(resolved))
            }
            Some(other) => Err(BundleError::malformed(
                manifest_path,
                format!(
                    "{} must be a string, got {}",
                    manifest::pointer_label(prefix, pointer),
                    json_type(other)
                ),
            )),
        }
    }

    fn rewrite_engines(&self, section: &mut ModelSection) -> Result<()> {
        let kind = section.kind();
        let manifest_path = section.manifest_path().to_path_buf();
        let labels: Vec<String> = match manifest::engines(section.node()) {
            Some(engines) => (0..engines.len())
                .map(|index| manifest::engine_label(kind, index, section.node()))
                .collect(),
            None => {
                return Err(BundleError::malformed(
                    &manifest_path,
                    format!("{}.engine must be an object or an array of objects", kind),
                ))
            }
        };

        let engines = manifest::engines_mut(section.node_mut()).unwrap_or_default();
        for (engine, label) in engines.into_iter().zip(labels) {
            self.rewrite_engine(engine, &label, &manifest_path)?;
        }
        Ok(())
    }

    fn rewrite_engine(&self, engine: &mut Value, label: &str, manifest_path: &Path) -> Result<()> {
        if !engine.is_object() {
            return Err(BundleError::malformed(
                manifest_path,
                format!("{} must be an object, got {}", label, json_type(engine)),
            ));
        }

        if engine.pointer(keys::BACKEND_TYPE).and_then(Value::as_str) == Some(keys::QNN_HTP) {
            self.patch_htp_backend(engine, label, manifest_path)?;
        }

        let is_binary =
            engine.pointer(keys::MODEL_TYPE).and_then(Value::as_str) == Some(keys::BINARY_MODEL);
        if is_binary {
            self.rewrite_ctx_bins(engine, label, manifest_path)?;
        } else {
            let field = manifest::pointer_label(label, keys::MODEL_BIN);
            match self.rewrite_string(engine, keys::MODEL_BIN, manifest_path, label)? {
                Some(path) => require_file(&field, &path)?,
                None => {
                    return Err(BundleError::malformed(
                        manifest_path,
                        format!("{} is required for library models", field),
                    ))
                }
            }
        }

        if let Some(n_threads) = self.options.effective_threads() {
            if let Some(object) = engine.as_object_mut() {
                object.insert(keys::N_THREADS.to_string(), json!(n_threads));
            }
        }
        Ok(())
    }

    fn rewrite_ctx_bins(&self, engine: &mut Value, label: &str, manifest_path: &Path) -> Result<()> {
        let field = manifest::pointer_label(label, keys::CTX_BINS);
        let Some(Value::Array(entries)) = engine.pointer_mut(keys::CTX_BINS) else {
            return Err(BundleError::malformed(
                manifest_path,
                format!("{} must be an array of paths for binary models", field),
            ));
        };

        for (index, entry) in entries.iter_mut().enumerate() {
            let value = match entry {
                Value::String(value) => value,
                other => {
                    return Err(BundleError::malformed(
                        manifest_path,
                        format!("{}[{}] must be a string, got {}", field, index, json_type(other)),
                    ))
                }
            };
            let resolved = self.join(value);
            require_file(&format!("{}[{}]", field, index), &resolved)?;
            *value = path_string(&resolved);
        }
        Ok(())
    }

    fn patch_htp_backend(&self, engine: &mut Value, label: &str, manifest_path: &Path) -> Result<()> {
        let Some(backend) = engine.get_mut(keys::BACKEND).and_then(Value::as_object_mut) else {
            return Ok(());
        };

        let bundled = backend
            .get(keys::EXTENSIONS)
            .and_then(Value::as_str)
            .map(|value| self.join(value))
            .filter(|path| path.is_file());
        let extensions = match bundled {
            Some(path) => path,
            None => {
                debug!(
                    "{}: no extension config in bundle, using {}",
                    label,
                    self.default_extensions.display()
                );
                self.default_extensions.clone()
            }
        };
        backend.insert(keys::EXTENSIONS.to_string(), Value::String(path_string(&extensions)));

        if let Some(flag) = self.options.mmap_policy.flag() {
            let htp = backend
                .entry(keys::QNN_HTP.to_string())
                .or_insert_with(|| json!({}));
            let Some(htp) = htp.as_object_mut() else {
                return Err(BundleError::malformed(
                    manifest_path,
                    format!("{}.backend.QnnHtp must be an object", label),
                ));
            };
            htp.insert(keys::USE_MMAP.to_string(), Value::Bool(flag));
        }
        Ok(())
    }
}

fn require_file(field: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BundleError::PathResolutionFailure {
            field: field.to_string(),
            path: path.to_path_buf(),
        })
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Unpacker that writes a fixed manifest and counts calls.
    struct FixtureUnpacker {
        manifest: Value,
        files: Vec<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl BundleUnpacker for FixtureUnpacker {
        fn unpack(&self, _bundle: &Path, dir: &Path) -> std::result::Result<(), UnpackError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for file in &self.files {
                let path = dir.join(file);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, b"data")?;
            }
            fs::write(dir.join("config.json"), self.manifest.to_string())?;
            Ok(())
        }
    }

    struct FailingUnpacker;

    impl BundleUnpacker for FailingUnpacker {
        fn unpack(&self, _bundle: &Path, _dir: &Path) -> std::result::Result<(), UnpackError> {
            Err("archive is corrupt".into())
        }
    }

    fn resolver(manifest: Value, files: Vec<&'static str>) -> (BundleResolver, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = BundleResolver::builder()
            .unpacker(FixtureUnpacker {
                manifest,
                files,
                calls: Arc::clone(&calls),
            })
            .default_extensions("/opt/qgenie/htp_backend_ext_config.json")
            .build();
        (resolver, calls)
    }

    fn library_dialog() -> Value {
        json!({
            "dialog": {
                "tokenizer": { "path": "tok.json" },
                "engine": {
                    "backend": { "type": "QnnHtp" },
                    "model": { "type": "library", "library": { "model-bin": "m.bin" } }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_resolve_library_dialog() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("u");
        let (resolver, _) = resolver(library_dialog(), vec!["tok.json", "m.bin"]);

        let options = ResolveOptions::default().mmap(MmapPolicy::Disabled);
        let resolved = resolver
            .resolve("model.bin", &dir, &options, &CancellationToken::new())
            .await
            .unwrap();

        let section = resolved.section();
        assert_eq!(section["tokenizer"]["path"], path_string(&dir.join("tok.json")));
        assert_eq!(
            section["engine"]["model"]["library"]["model-bin"],
            path_string(&dir.join("m.bin"))
        );
        assert_eq!(
            section["engine"]["backend"]["extensions"],
            "/opt/qgenie/htp_backend_ext_config.json"
        );
        assert_eq!(section["engine"]["backend"]["QnnHtp"]["use-mmap"], false);
    }

    #[tokio::test]
    async fn test_existing_manifest_skips_unpack() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, calls) = resolver(library_dialog(), vec!["tok.json", "m.bin"]);
        let options = ResolveOptions::default();
        let cancel = CancellationToken::new();

        let first = resolver.resolve("b", temp_dir.path(), &options, &cancel).await.unwrap();
        let second = resolver.resolve("b", temp_dir.path(), &options, &cancel).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.to_json_string(), second.to_json_string());
    }

    #[tokio::test]
    async fn test_force_unpack_always_unpacks() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, calls) = resolver(library_dialog(), vec!["tok.json", "m.bin"]);
        let options = ResolveOptions::default().force_unpack(true);
        let cancel = CancellationToken::new();

        resolver.resolve("b", temp_dir.path(), &options, &cancel).await.unwrap();
        resolver.resolve("b", temp_dir.path(), &options, &cancel).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unpack_failure_is_propagated() {
        let temp_dir = TempDir::new().unwrap();
        let resolver = BundleResolver::builder().unpacker(FailingUnpacker).build();

        let err = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            BundleError::UnpackFailure { source, .. } => {
                assert_eq!(source.to_string(), "archive is corrupt")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    struct EmptyUnpacker;

    impl BundleUnpacker for EmptyUnpacker {
        fn unpack(&self, _bundle: &Path, _dir: &Path) -> std::result::Result<(), UnpackError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unpack_without_manifest_is_failure() {
        let temp_dir = TempDir::new().unwrap();
        let resolver = BundleResolver::builder().unpacker(EmptyUnpacker).build();

        let err = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BundleError::UnpackFailure { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, calls) = resolver(library_dialog(), vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BundleError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    fn dialog_fixture(calls: &Arc<AtomicUsize>) -> FixtureUnpacker {
        FixtureUnpacker {
            manifest: library_dialog(),
            files: vec!["tok.json", "m.bin"],
            calls: Arc::clone(calls),
        }
    }

    /// Holds the directory lock long enough for a second caller to queue.
    struct SlowUnpacker(FixtureUnpacker);

    impl BundleUnpacker for SlowUnpacker {
        fn unpack(&self, bundle: &Path, dir: &Path) -> std::result::Result<(), UnpackError> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            self.0.unpack(bundle, dir)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_resolves_share_one_unpack() {
        let temp_dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = BundleResolver::builder()
            .unpacker(SlowUnpacker(dialog_fixture(&calls)))
            .build();
        let options = ResolveOptions::default();
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            resolver.resolve("b", temp_dir.path(), &options, &cancel),
            resolver.resolve("b", temp_dir.path(), &options, &cancel),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.unwrap().to_json_string(), second.unwrap().to_json_string());
    }

    /// Cancels its token partway through, then completes the unpack.
    struct CancellingUnpacker {
        cancel: CancellationToken,
        inner: FixtureUnpacker,
    }

    impl BundleUnpacker for CancellingUnpacker {
        fn unpack(&self, bundle: &Path, dir: &Path) -> std::result::Result<(), UnpackError> {
            self.cancel.cancel();
            self.inner.unpack(bundle, dir)
        }
    }

    #[tokio::test]
    async fn test_cancel_during_unpack_stops_before_parsing() {
        let temp_dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let resolver = BundleResolver::builder()
            .unpacker(CancellingUnpacker {
                cancel: cancel.clone(),
                inner: dialog_fixture(&calls),
            })
            .build();
        let options = ResolveOptions::default();

        let err = resolver
            .resolve("b", temp_dir.path(), &options, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::Cancelled));
        assert!(temp_dir.path().join("config.json").is_file());

        // A fresh call reuses the finished unpack.
        resolver
            .resolve("b", temp_dir.path(), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Overwrites a weight file and then fails.
    struct PartialUnpacker;

    impl BundleUnpacker for PartialUnpacker {
        fn unpack(&self, _bundle: &Path, dir: &Path) -> std::result::Result<(), UnpackError> {
            fs::write(dir.join("m.bin"), b"v2-partial")?;
            Err("disk full".into())
        }
    }

    #[tokio::test]
    async fn test_failed_force_unpack_invalidates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let (good, _) = resolver(library_dialog(), vec!["tok.json", "m.bin"]);
        good.resolve("b", temp_dir.path(), &ResolveOptions::default(), &cancel)
            .await
            .unwrap();

        let partial = BundleResolver::builder().unpacker(PartialUnpacker).build();
        let err = partial
            .resolve("b", temp_dir.path(), &ResolveOptions::default().force_unpack(true), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::UnpackFailure { .. }));
        assert!(!temp_dir.path().join("config.json").exists());

        // The half-written directory must not be accepted as unpacked.
        let err = partial
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::UnpackFailure { .. }));
    }

    #[tokio::test]
    async fn test_binary_ctx_bins_keep_order() {
        let manifest = json!({
            "text-generator": {
                "engine": {
                    "backend": { "type": "QnnGpu" },
                    "model": {
                        "type": "binary",
                        "binary": { "ctx-bins": ["c/3.bin", "c/1.bin", "c/2.bin"] }
                    }
                }
            }
        });
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver(manifest, vec!["c/1.bin", "c/2.bin", "c/3.bin"]);

        let resolved = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let bins: Vec<String> = resolved.section()["engine"]["model"]["binary"]["ctx-bins"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = ["c/3.bin", "c/1.bin", "c/2.bin"]
            .iter()
            .map(|p| path_string(&temp_dir.path().join(p)))
            .collect();
        assert_eq!(bins, expected);
        // Non-HTP backends pass through untouched.
        assert!(resolved.section()["engine"]["backend"].get("extensions").is_none());
    }

    #[tokio::test]
    async fn test_missing_ctx_bin_is_path_resolution_failure() {
        let manifest = json!({
            "dialog": {
                "engine": {
                    "model": { "type": "binary", "binary": { "ctx-bins": ["a.bin", "b.bin"] } }
                }
            }
        });
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver(manifest, vec!["a.bin"]);

        let err = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            BundleError::PathResolutionFailure { field, path } => {
                assert_eq!(field, "dialog.engine.model.binary.ctx-bins[1]");
                assert_eq!(path, temp_dir.path().join("b.bin"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_engine_is_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver(json!({ "embedding": { "tokenizer": { "path": "t" } } }), vec![]);

        let err = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BundleError::ManifestMalformed { .. }));
    }

    #[tokio::test]
    async fn test_thread_override() {
        let mut manifest = library_dialog();
        manifest["dialog"]["engine"]["n-threads"] = json!(1);
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver(manifest, vec!["tok.json", "m.bin"]);
        let cancel = CancellationToken::new();

        let four = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default().threads(4), &cancel)
            .await
            .unwrap();
        assert_eq!(four.section()["engine"]["n-threads"], 4);

        let zero = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default().threads(0), &cancel)
            .await
            .unwrap();
        assert_eq!(zero.section()["engine"]["n-threads"], 1);

        let absent = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(absent.section()["engine"]["n-threads"], 1);
    }

    #[tokio::test]
    async fn test_bundled_extensions_are_used_when_present() {
        let mut manifest = library_dialog();
        manifest["dialog"]["engine"]["backend"]["extensions"] = json!("htp_ext.json");
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver(manifest, vec!["tok.json", "m.bin", "htp_ext.json"]);

        let resolved = resolver
            .resolve(
                "b",
                temp_dir.path(),
                &ResolveOptions::default().mmap(MmapPolicy::Manifest),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let backend = &resolved.section()["engine"]["backend"];
        assert_eq!(backend["extensions"], path_string(&temp_dir.path().join("htp_ext.json")));
        assert!(backend.get("QnnHtp").is_none());
    }

    #[tokio::test]
    async fn test_lut_paths_rewritten_only_when_applicable() {
        let manifest = json!({
            "embedding": {
                "embedding": { "type": "lut", "lut-path": "lut.bin" },
                "lut": { "lut-path": "other_lut.bin" },
                "engine": [{
                    "model": { "type": "library", "library": { "model-bin": "m.bin" } }
                }]
            },
            "profile": { "lut-path": "untouched" }
        });
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver(manifest, vec!["m.bin"]);

        let resolved = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let section = resolved.section();
        assert_eq!(section["embedding"]["lut-path"], path_string(&temp_dir.path().join("lut.bin")));
        assert_eq!(section["lut"]["lut-path"], path_string(&temp_dir.path().join("other_lut.bin")));
        assert!(section.get("tokenizer").is_none());
        assert_eq!(resolved.document()["profile"]["lut-path"], "untouched");
    }

    #[tokio::test]
    async fn test_non_lut_embedding_path_untouched() {
        let manifest = json!({
            "embedding": {
                "embedding": { "type": "dense", "lut-path": "ignored.bin" },
                "engine": { "model": { "library": { "model-bin": "m.bin" } } }
            }
        });
        let temp_dir = TempDir::new().unwrap();
        let (resolver, _) = resolver(manifest, vec!["m.bin"]);

        let resolved = resolver
            .resolve("b", temp_dir.path(), &ResolveOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolved.section()["embedding"]["lut-path"], "ignored.bin");
    }

    #[test]
    fn test_mmap_policy_parse() {
        assert_eq!("Disabled".parse::<MmapPolicy>(), Ok(MmapPolicy::Disabled));
        assert_eq!("manifest".parse::<MmapPolicy>(), Ok(MmapPolicy::Manifest));
        assert_eq!("auto".parse::<MmapPolicy>(), Ok(MmapPolicy::for_current_platform()));
        assert!("sometimes".parse::<MmapPolicy>().is_err());
    }

    #[test]
    fn test_effective_threads_ignores_zero() {
        assert_eq!(ResolveOptions::default().threads(0).effective_threads(), None);
        assert_eq!(ResolveOptions::default().threads(8).effective_threads(), Some(8));
    }
}
