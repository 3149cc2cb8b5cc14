//! Command-line definitions.

use clap::{Args, Parser, Subcommand};
use qgenie_core::{BundleConfig, ContainerConfig, MmapPolicy, ModelKind};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "qgenie", version)]
#[command(about = "Pack, unpack and resolve QNN Genie model bundles")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pack a config.json and the files it references into a bundle
    Pack(PackArgs),

    /// Extract a bundle into a directory
    Unpack(UnpackArgs),

    /// Verify a bundle and list its entries
    Inspect(InspectArgs),

    /// Unpack a bundle and print the resolved engine config
    Resolve(ResolveArgs),
}

#[derive(Args, Debug)]
pub struct PackArgs {
    /// Manifest to pack; referenced files are read relative to it
    pub config: PathBuf,

    /// Output bundle path
    #[arg(short, long, default_value = "model.bin")]
    pub output: PathBuf,

    /// Zstd compression level
    #[arg(
        short,
        long,
        default_value_t = ContainerConfig::DEFAULT_ZSTD_LEVEL,
        allow_negative_numbers = true
    )]
    pub level: i32,
}

#[derive(Args, Debug)]
pub struct UnpackArgs {
    pub bundle: PathBuf,
    pub dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    pub bundle: PathBuf,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub bundle: PathBuf,

    /// Unpack directory
    pub dir: PathBuf,

    /// Required model section (dialog, embedding, text-generator, ...)
    #[arg(long)]
    pub kind: Option<ModelKind>,

    /// Engine thread count (0 keeps the manifest value)
    #[arg(long)]
    pub threads: Option<u32>,

    /// Memory-mapped weight loading: enabled, disabled, manifest or auto
    #[arg(long, default_value = "auto")]
    pub mmap: MmapPolicy,

    /// Unpack even if the directory already holds a config.json
    #[arg(long)]
    pub force: bool,

    /// HTP extension config used when the bundle has none
    #[arg(long, env = BundleConfig::DEFAULT_EXTENSIONS_ENV)]
    pub default_extensions: Option<PathBuf>,

    /// Print compact JSON instead of pretty-printed
    #[arg(long)]
    pub compact: bool,
}
