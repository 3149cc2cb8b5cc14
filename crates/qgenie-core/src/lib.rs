//! qgenie Core - model bundle unpacking and manifest resolution.
//!
//! A model bundle is a single `QGENIE1` container holding a `config.json`
//! manifest plus the files it references (tokenizer, context binaries,
//! backend extension configs). This crate unpacks bundles, rewrites every
//! bundle-relative path in the manifest to an absolute path under the unpack
//! directory, applies platform backend patches and hands the result to an
//! inference engine through [`EngineFactory`].
//!
//! # Example
//!
//! ```rust,no_run
//! use qgenie_core::{BundleResolver, CancellationToken, ModelKind, ResolveOptions};
//!
//! #[tokio::main]
//! async fn main() -> qgenie_core::Result<()> {
//!     let resolver = BundleResolver::new();
//!     let options = ResolveOptions::default().expect_kind(ModelKind::Dialog).threads(4);
//!
//!     let config = resolver
//!         .resolve("model.bin", "/tmp/qgenie/model", &options, &CancellationToken::new())
//!         .await?;
//!     println!("{}", config.to_json_pretty());
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod container;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod pack;
pub mod resolver;

mod fsutil;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{BundleConfig, ContainerConfig};
pub use container::{
    inspect_bundle, unpack_bundle, BundleInfo, BundleReader, ContainerUnpacker, TocEntry,
    UnpackSummary,
};
pub use defaults::{default_extensions_path, install_default_extensions, DEFAULT_HTP_EXTENSIONS};
pub use engine::{EngineAvailability, EngineFactory, ModelLoader};
pub use error::{BundleError, Result, UnpackError};
pub use manifest::{Manifest, ModelKind, ModelSection, ResolvedConfig};
pub use pack::{pack_bundle, PackSummary};
pub use resolver::{
    BundleResolver, BundleResolverBuilder, BundleUnpacker, MmapPolicy, ResolveOptions,
    ResolveStage,
};
