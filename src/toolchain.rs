//! External toolchain seam.
//!
//! The build core never touches object-code bytes itself; everything it
//! needs from the toolchain goes through the `Toolchain` trait so the
//! orchestrator can be tested without cross binutils installed.
//! `GnuToolchain` is the real implementation, spawning `<prefix>gcc`,
//! `<prefix>ar`, `<prefix>objdump` and `<prefix>objcopy`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use crate::config::PackageConfig;
use crate::symbol::SymbolMap;

pub trait Toolchain {
    /// Compile every source of `pkg` into `out_dir`, returning the
    /// object paths.
    fn compile(
        &self,
        pkg: &PackageConfig,
        features: &[String],
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>>;

    /// Repackage objects into a combined archive for link-time use.
    fn archive(&self, archive: &Path, objects: &[PathBuf]) -> Result<()>;

    /// Link `inputs` against `link_script` into `output`.
    fn link(&self, output: &Path, inputs: &[PathBuf], link_script: &Path) -> Result<()>;

    /// Raw symbol-table dump (`objdump -t`) of an archive or binary.
    fn dump_symbols(&self, artifact: &Path) -> Result<String>;

    /// Copy `src` to `dst` keeping only the symbols in `keep` globally
    /// visible; everything else is demoted.
    fn copy_with_symbol_filter(&self, src: &Path, dst: &Path, keep: &SymbolMap) -> Result<()>;

    /// Rename every symbol in `set` by appending `suffix`, in place.
    fn rename_symbols(&self, artifact: &Path, set: &SymbolMap, suffix: &str) -> Result<()>;

    fn weaken_symbol(&self, artifact: &Path, name: &str) -> Result<()>;

    fn remove_symbol(&self, artifact: &Path, name: &str) -> Result<()>;

    fn rename_section(&self, artifact: &Path, from: &str, to: &str) -> Result<()>;
}

/// GNU binutils driver for one cross-toolchain prefix.
pub struct GnuToolchain {
    prefix: String,
    cflags: Vec<String>,
}

impl GnuToolchain {
    pub fn new(prefix: &str, cflags: &[String]) -> Self {
        Self {
            prefix: prefix.to_string(),
            cflags: cflags.to_vec(),
        }
    }

    fn tool(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Run a command to completion. Any failure is fatal and carries the
    /// tool's stderr verbatim.
    fn run(&self, cmd: &mut Command) -> Result<Vec<u8>> {
        tracing::debug!("exec: {:?}", cmd);
        let out = cmd
            .output()
            .with_context(|| format!("failed to spawn {:?}", cmd.get_program()))?;
        if !out.status.success() {
            bail!(
                "{:?} failed ({}): {}",
                cmd.get_program(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim_end()
            );
        }
        Ok(out.stdout)
    }
}

impl Toolchain for GnuToolchain {
    fn compile(
        &self,
        pkg: &PackageConfig,
        features: &[String],
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut objects = Vec::new();
        for src in &pkg.sources {
            let stem = src
                .file_stem()
                .with_context(|| format!("bad source path {}", src.display()))?;
            let mut obj = out_dir.join(stem);
            obj.set_extension("o");

            let mut cmd = Command::new(self.tool("gcc"));
            cmd.arg("-c").args(&self.cflags);
            for feature in features {
                cmd.arg(format!("-D{}", feature));
            }
            cmd.arg("-o").arg(&obj).arg(src);
            self.run(&mut cmd)?;
            objects.push(obj);
        }
        Ok(objects)
    }

    fn archive(&self, archive: &Path, objects: &[PathBuf]) -> Result<()> {
        // Stale members must not survive a recompile.
        if archive.exists() {
            fs::remove_file(archive)
                .with_context(|| format!("failed to remove {}", archive.display()))?;
        }
        let mut cmd = Command::new(self.tool("ar"));
        cmd.arg("rcs").arg(archive).args(objects);
        self.run(&mut cmd)?;
        Ok(())
    }

    fn link(&self, output: &Path, inputs: &[PathBuf], link_script: &Path) -> Result<()> {
        let mut cmd = Command::new(self.tool("gcc"));
        cmd.arg("-o").arg(output);
        cmd.args(inputs);
        cmd.arg("-T").arg(link_script);
        self.run(&mut cmd)?;
        Ok(())
    }

    fn dump_symbols(&self, artifact: &Path) -> Result<String> {
        let mut cmd = Command::new(self.tool("objdump"));
        cmd.arg("-t").arg("-w").arg(artifact);
        let out = self.run(&mut cmd)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn copy_with_symbol_filter(&self, src: &Path, dst: &Path, keep: &SymbolMap) -> Result<()> {
        let mut cmd = Command::new(self.tool("objcopy"));
        for rec in keep {
            cmd.arg("-G").arg(&rec.name);
        }
        cmd.arg(src).arg(dst);
        self.run(&mut cmd)?;
        Ok(())
    }

    fn rename_symbols(&self, artifact: &Path, set: &SymbolMap, suffix: &str) -> Result<()> {
        let mut cmd = Command::new(self.tool("objcopy"));
        for rec in set {
            cmd.arg(format!("--redefine-sym={}={}{}", rec.name, rec.name, suffix));
        }
        cmd.arg(artifact);
        self.run(&mut cmd)?;
        Ok(())
    }

    fn weaken_symbol(&self, artifact: &Path, name: &str) -> Result<()> {
        let mut cmd = Command::new(self.tool("objcopy"));
        cmd.arg("-W").arg(name).arg(artifact);
        self.run(&mut cmd)?;
        Ok(())
    }

    fn remove_symbol(&self, artifact: &Path, name: &str) -> Result<()> {
        let mut cmd = Command::new(self.tool("objcopy"));
        cmd.arg("-N").arg(name).arg(artifact);
        self.run(&mut cmd)?;
        Ok(())
    }

    fn rename_section(&self, artifact: &Path, from: &str, to: &str) -> Result<()> {
        let mut cmd = Command::new(self.tool("objcopy"));
        cmd.arg(format!("--rename-section={}={}", from, to));
        cmd.arg(artifact);
        self.run(&mut cmd)?;
        Ok(())
    }
}

/// Staleness decisions for generated artifacts.
pub struct DepTracker;

impl DepTracker {
    fn mtime(path: &Path) -> Result<SystemTime> {
        let meta = fs::metadata(path)
            .with_context(|| format!("failed to stat build input {}", path.display()))?;
        meta.modified()
            .with_context(|| format!("no modification time for {}", path.display()))
    }

    /// Whether the restricted loader view must be regenerated.
    ///
    /// A missing ROM ELF means rebuild. A stat failure on a declared
    /// input (an archive or the loader binary) is an error, not a silent
    /// decision. Conservative: any input at least as new as the artifact
    /// forces a rebuild.
    pub fn rom_elf_build_required(
        rom_elf: &Path,
        loader_elf: &Path,
        archives: &[PathBuf],
    ) -> Result<bool> {
        if !rom_elf.exists() {
            return Ok(true);
        }
        let generated = Self::mtime(rom_elf)?;

        if Self::mtime(loader_elf)? >= generated {
            return Ok(true);
        }
        for archive in archives {
            if Self::mtime(archive)? >= generated {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
