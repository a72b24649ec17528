//! Entry point for the romlink build tool.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize logging from the requested level.
//! 3. Load and validate the target definition.
//! 4. Run the split-image build pipeline to completion.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use romlink::config::{Config, TargetConfig};
use romlink::target::TargetBuilder;
use romlink::toolchain::GnuToolchain;

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level)
                .with_context(|| format!("invalid log level {}", config.log_level))?,
        )
        .init();

    let target = TargetConfig::load(&config.target)?;
    tracing::info!("building target {}", target.name);

    let toolchain = GnuToolchain::new(&target.compiler_prefix, &target.cflags);
    let mut builder = TargetBuilder::new(target, toolchain, &config.out_dir)?;
    let outcome = builder.build()?;

    if let Some(loader_elf) = &outcome.loader_elf {
        println!("loader image: {}", loader_elf.display());
    }
    println!("application image: {}", outcome.app_elf.display());
    Ok(())
}
