#![warn(missing_docs)]

//! Clearfree command line entry point.

use anyhow::Result;
use clap::Parser;
use clearfree::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    tracing::debug!("clearfree starting on {}", cli.mountpoint.display());
    cli.run()
}
