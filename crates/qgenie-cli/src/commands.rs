//! Subcommand implementations.
//!
//! Results go to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use qgenie_core::{
    default_extensions_path, inspect_bundle, install_default_extensions, pack_bundle,
    unpack_bundle, BundleResolver, CancellationToken, ResolveOptions,
};
use tracing::debug;

use crate::cli::{Command, InspectArgs, PackArgs, ResolveArgs, UnpackArgs};

pub async fn run(command: Command) -> Result<()> {
    match command {
        Command::Pack(args) => pack(args).await,
        Command::Unpack(args) => unpack(args).await,
        Command::Inspect(args) => inspect(args).await,
        Command::Resolve(args) => resolve(args).await,
    }
}

async fn pack(args: PackArgs) -> Result<()> {
    let summary = tokio::task::spawn_blocking(move || {
        pack_bundle(&args.config, &args.output, args.level)
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn unpack(args: UnpackArgs) -> Result<()> {
    let summary = tokio::task::spawn_blocking(move || unpack_bundle(&args.bundle, &args.dir))
        .await??;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn inspect(args: InspectArgs) -> Result<()> {
    let info = tokio::task::spawn_blocking(move || inspect_bundle(&args.bundle)).await??;

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

pub fn resolve_options(args: &ResolveArgs) -> ResolveOptions {
    ResolveOptions {
        expected_kind: args.kind,
        thread_override: args.threads,
        mmap_policy: args.mmap,
        force_unpack: args.force,
    }
}

async fn resolve(args: ResolveArgs) -> Result<()> {
    let builder = BundleResolver::builder();
    let resolver = match &args.default_extensions {
        Some(path) => builder.default_extensions(path).build(),
        None => {
            let path = default_extensions_path();
            let install_path = path.clone();
            tokio::task::spawn_blocking(move || install_default_extensions(&install_path))
                .await?
                .with_context(|| format!("Failed to install {}", path.display()))?;
            builder.default_extensions(path).build()
        }
    };
    debug!("Using default extensions {}", resolver.default_extensions().display());

    let options = resolve_options(&args);
    let config = resolver
        .resolve(&args.bundle, &args.dir, &options, &CancellationToken::new())
        .await
        .with_context(|| format!("Failed to resolve {}", args.bundle.display()))?;

    if args.compact {
        println!("{}", config.to_json_string());
    } else {
        println!("{}", config.to_json_pretty());
    }
    Ok(())
}
