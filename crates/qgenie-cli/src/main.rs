//! qgenie - command-line front end for qgenie-core.

use anyhow::Result;
use clap::Parser;
use qgenie_cli::cli::Cli;
use qgenie_core::BundleError;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    qgenie_cli::init_logging(cli.debug);

    let result = qgenie_cli::commands::run(cli.command).await;
    if let Err(err) = &result {
        if let Some(bundle_err) = err.downcast_ref::<BundleError>() {
            error!("{} (code: {})", bundle_err, bundle_err.code());
        }
    }
    result
}
