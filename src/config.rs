//! Configuration module.
//!
//! Two layers: the command-line interface (clap) and the on-disk target
//! definition (JSON via serde). The target definition is the build
//! tool's stand-in for BSP/target resolution: it names the compiler
//! prefix, the link scripts and the package sets for each image half.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Split-image firmware build core.
///
/// Builds a target as either a single binary or a loader/application
/// split image, reconciling the symbols shared between the two halves.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Target definition file (JSON)
    pub target: PathBuf,

    /// Build output directory
    #[arg(short, long, default_value = "bin")]
    pub out_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

/// One source package: a named unit compiled into one archive.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PackageConfig {
    pub name: String,
    pub sources: Vec<PathBuf>,
}

/// Package set and feature flags for one image half.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HalfConfig {
    pub packages: Vec<PackageConfig>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// A resolved build target.
///
/// `loader` present means a split image: the application is linked
/// against a restricted view of the loader binary using
/// `part2_link_script`.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    /// Cross-toolchain prefix, e.g. "arm-none-eabi-".
    pub compiler_prefix: String,
    #[serde(default)]
    pub cflags: Vec<String>,
    pub link_script: PathBuf,
    /// Second-stage link script, required when `loader` is set.
    #[serde(default)]
    pub part2_link_script: Option<PathBuf>,
    /// Package that must be linked into both halves (board support).
    #[serde(default)]
    pub bsp_pkg: Option<String>,
    pub app: HalfConfig,
    #[serde(default)]
    pub loader: Option<HalfConfig>,
}

impl TargetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read target definition {}", path.display()))?;
        let cfg: TargetConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid target definition {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Configuration errors are fatal before any build step runs.
    pub fn validate(&self) -> Result<()> {
        if self.compiler_prefix.is_empty() {
            anyhow::bail!("target {} does not specify a compiler", self.name);
        }
        if self.app.packages.is_empty() {
            anyhow::bail!("target {} has no application packages", self.name);
        }
        if self.loader.is_some() && self.part2_link_script.is_none() {
            anyhow::bail!(
                "target {} is a split image but specifies no second-stage link script",
                self.name
            );
        }
        Ok(())
    }
}
