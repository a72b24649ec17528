//! Per-half builder.
//!
//! A `Builder` owns the package set, feature flags and build directory
//! of one image half (loader or application) and drives the toolchain
//! through compile, archive, link and symbol extraction for that half.
//! It holds no toolchain of its own; the orchestrator threads one
//! through each call.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::PackageConfig;
use crate::parser;
use crate::symbol::{SymbolMap, SymbolSource, ELF_PKG};
use crate::toolchain::Toolchain;

pub struct Builder {
    /// Half name, used for artifact paths ("loader", "app").
    half: String,
    packages: Vec<PackageConfig>,
    features: Vec<String>,
    out_dir: PathBuf,
}

impl Builder {
    pub fn new(
        half: &str,
        packages: Vec<PackageConfig>,
        features: Vec<String>,
        out_dir: &Path,
    ) -> Self {
        Self {
            half: half.to_string(),
            packages,
            features,
            out_dir: out_dir.join(half),
        }
    }

    pub fn half(&self) -> &str {
        &self.half
    }

    pub fn packages(&self) -> &[PackageConfig] {
        &self.packages
    }

    pub fn add_feature(&mut self, feature: &str) {
        self.features.push(feature.to_string());
    }

    /// Drop packages proven common with the other half; the restricted
    /// loader view supplies their symbols at link time instead.
    pub fn remove_packages(&mut self, names: &HashSet<String>) {
        self.packages.retain(|p| !names.contains(&p.name));
    }

    pub fn add_package(&mut self, pkg: PackageConfig) {
        if !self.packages.iter().any(|p| p.name == pkg.name) {
            self.packages.push(pkg);
        }
    }

    /// Combined archive for one package. Slashes in package names become
    /// underscores so every archive lands flat in the half's directory.
    pub fn archive_path(&self, pkg_name: &str) -> PathBuf {
        self.out_dir
            .join(format!("{}.a", pkg_name.replace('/', "_")))
    }

    pub fn elf_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.elf", self.half))
    }

    /// The republished, symbol-filtered copy of this half's binary.
    pub fn rom_elf_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.rom.elf", self.half))
    }

    pub fn archive_paths(&self) -> Vec<PathBuf> {
        self.packages
            .iter()
            .map(|p| self.archive_path(&p.name))
            .collect()
    }

    /// Compile every package and repackage each into its combined archive.
    pub fn build(&self, tc: &dyn Toolchain) -> Result<()> {
        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("failed to create {}", self.out_dir.display()))?;

        for pkg in &self.packages {
            tracing::info!("compiling {} ({})", pkg.name, self.half);
            let objects = tc
                .compile(pkg, &self.features, &self.out_dir)
                .with_context(|| format!("failed to compile package {}", pkg.name))?;
            tc.archive(&self.archive_path(&pkg.name), &objects)
                .with_context(|| format!("failed to archive package {}", pkg.name))?;
        }
        Ok(())
    }

    /// Link the half's archives (plus any extra inputs, e.g. the ROM
    /// ELF) into `output` against `link_script`.
    pub fn link(
        &self,
        tc: &dyn Toolchain,
        link_script: &Path,
        extra_inputs: &[PathBuf],
        output: &Path,
    ) -> Result<()> {
        let mut inputs = self.archive_paths();
        inputs.extend_from_slice(extra_inputs);
        tracing::info!("linking {} -> {}", self.half, output.display());
        tc.link(output, &inputs, link_script)
            .with_context(|| format!("failed to link {}", self.half))
    }

    /// Extract the symbols of every package archive and fold them into
    /// one map with linker precedence. Only memory-allocating sections
    /// participate; those are the rows that decide link-time identity.
    pub fn extract_symbol_info(&self, tc: &dyn Toolchain) -> Result<SymbolMap> {
        let mut all = SymbolMap::new();
        for pkg in &self.packages {
            let archive = self.archive_path(&pkg.name);
            let raw = tc
                .dump_symbols(&archive)
                .with_context(|| format!("failed to dump symbols of {}", archive.display()))?;
            let sm = parser::parse_artifact(&raw, &pkg.name, SymbolSource::Archive, true);
            all.merge(sm)
                .with_context(|| format!("while merging symbols of package {}", pkg.name))?;
        }
        Ok(all)
    }

    /// Ground-truth symbols of a linked binary: what the linker actually
    /// retained, unfiltered by section.
    pub fn parse_object_elf(&self, tc: &dyn Toolchain, elf: &Path) -> Result<SymbolMap> {
        let raw = tc
            .dump_symbols(elf)
            .with_context(|| format!("failed to dump symbols of {}", elf.display()))?;
        Ok(parser::parse_artifact(
            &raw,
            ELF_PKG,
            SymbolSource::LinkedElf,
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageConfig;

    fn pkg(name: &str) -> PackageConfig {
        PackageConfig {
            name: name.to_string(),
            sources: vec![PathBuf::from(format!("{}/src.c", name))],
        }
    }

    #[test]
    fn archive_paths_flatten_package_names() {
        let b = Builder::new("loader", vec![pkg("sys/os")], vec![], Path::new("bin"));
        assert_eq!(
            b.archive_path("sys/os"),
            PathBuf::from("bin/loader/sys_os.a")
        );
        assert_eq!(b.elf_path(), PathBuf::from("bin/loader/loader.elf"));
        assert_eq!(b.rom_elf_path(), PathBuf::from("bin/loader/loader.rom.elf"));
    }

    #[test]
    fn remove_packages_keeps_the_rest() {
        let mut b = Builder::new(
            "app",
            vec![pkg("sys/os"), pkg("apps/blinky"), pkg("hw/bsp")],
            vec![],
            Path::new("bin"),
        );
        let mut drop = HashSet::new();
        drop.insert("sys/os".to_string());
        b.remove_packages(&drop);

        let names: Vec<_> = b.packages().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["apps/blinky", "hw/bsp"]);
    }

    #[test]
    fn add_package_is_idempotent() {
        let mut b = Builder::new("app", vec![pkg("hw/bsp")], vec![], Path::new("bin"));
        b.add_package(pkg("hw/bsp"));
        assert_eq!(b.packages().len(), 1);
        b.add_package(pkg("sys/os"));
        assert_eq!(b.packages().len(), 2);
    }
}
