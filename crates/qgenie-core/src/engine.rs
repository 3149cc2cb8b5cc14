//! Engine construction seam and model loading.
//!
//! The inference engine itself is native and out of scope here; it is
//! reached through [`EngineFactory`]. [`EngineAvailability`] records whether
//! a factory is usable on this target, and [`ModelLoader`] ties resolution
//! and construction together.

use std::path::Path;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::error::{BundleError, Result};
use crate::manifest::{ModelKind, ResolvedConfig};
use crate::resolver::{BundleResolver, ResolveOptions};

/// Builds an engine handle from a resolved config.
///
/// The config is passed by value; engines serialize it with
/// [`ResolvedConfig::to_json_string`] or read the tree directly.
pub trait EngineFactory {
    type Handle;
    type Error: std::fmt::Display;

    fn create(&self, config: ResolvedConfig) -> std::result::Result<Self::Handle, Self::Error>;
}

/// Human-readable name of the current target.
pub fn current_target() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Whether the native engine ships for the current target.
///
/// Only Windows on aarch64 is supported.
pub fn is_supported_target() -> bool {
    cfg!(all(target_os = "windows", target_arch = "aarch64"))
}

/// An engine factory, or the reason none is usable.
#[derive(Debug, Clone)]
pub enum EngineAvailability<F> {
    Available(F),
    Unavailable { reason: String },
}

impl<F> EngineAvailability<F> {
    /// Wrap `factory` if the current target is supported.
    pub fn probe(factory: F) -> Self {
        if is_supported_target() {
            EngineAvailability::Available(factory)
        } else {
            EngineAvailability::Unavailable {
                reason: format!(
                    "no native engine for {} (requires windows-aarch64)",
                    current_target()
                ),
            }
        }
    }

    /// Wrap `factory` unconditionally.
    pub fn available(factory: F) -> Self {
        EngineAvailability::Available(factory)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        EngineAvailability::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, EngineAvailability::Available(_))
    }

    pub fn factory(&self) -> Result<&F> {
        match self {
            EngineAvailability::Available(factory) => Ok(factory),
            EngineAvailability::Unavailable { reason } => Err(BundleError::EngineUnavailable {
                reason: reason.clone(),
            }),
        }
    }
}

/// Resolves bundles and hands the result to an engine factory.
#[derive(Debug, Clone)]
pub struct ModelLoader<F> {
    resolver: BundleResolver,
    engine: EngineAvailability<F>,
}

impl<F: EngineFactory> ModelLoader<F> {
    pub fn new(resolver: BundleResolver, engine: EngineAvailability<F>) -> Self {
        Self { resolver, engine }
    }

    pub fn resolver(&self) -> &BundleResolver {
        &self.resolver
    }

    pub fn engine(&self) -> &EngineAvailability<F> {
        &self.engine
    }

    /// Resolve `bundle_path` into `unpack_dir` and create an engine from it.
    ///
    /// Availability is checked first so an unsupported target never unpacks.
    pub async fn load(
        &self,
        bundle_path: impl AsRef<Path>,
        unpack_dir: impl AsRef<Path>,
        options: &ResolveOptions,
        cancel: &CancellationToken,
    ) -> Result<F::Handle> {
        let factory = self.engine.factory()?;
        let config = self
            .resolver
            .resolve(bundle_path, unpack_dir, options, cancel)
            .await?;
        cancel.check()?;

        let kind = config.kind();
        debug!("Creating {} engine", kind);
        let handle = factory
            .create(config)
            .map_err(|e| BundleError::EngineCreate {
                message: e.to_string(),
            })?;
        info!("Created {} engine", kind);
        Ok(handle)
    }

    /// Load a bundle that must contain a `dialog` section.
    pub async fn load_dialog(
        &self,
        bundle_path: impl AsRef<Path>,
        unpack_dir: impl AsRef<Path>,
        options: &ResolveOptions,
        cancel: &CancellationToken,
    ) -> Result<F::Handle> {
        let options = options.clone().expect_kind(ModelKind::Dialog);
        self.load(bundle_path, unpack_dir, &options, cancel).await
    }

    /// Load a bundle that must contain an `embedding` section.
    pub async fn load_embedding(
        &self,
        bundle_path: impl AsRef<Path>,
        unpack_dir: impl AsRef<Path>,
        options: &ResolveOptions,
        cancel: &CancellationToken,
    ) -> Result<F::Handle> {
        let options = options.clone().expect_kind(ModelKind::Embedding);
        self.load(bundle_path, unpack_dir, &options, cancel).await
    }
}
