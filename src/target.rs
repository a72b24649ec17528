//! Split-image build orchestration.
//!
//! `TargetBuilder` sequences the whole pipeline: build the loader, build
//! the application, reconcile the symbols the two halves compiled from
//! shared packages, republish the loader as a restricted ROM ELF, and
//! perform the final application link against it. A target without a
//! loader degrades to a plain single-binary build.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::builder::Builder;
use crate::config::TargetConfig;
use crate::symbol::{identical_union, SymbolConflict, SymbolMap, SymbolRecord};
use crate::toolchain::{DepTracker, Toolchain};

/// Symbols rooting an image's own startup. They must never be resolved
/// across the split, so they are dropped from the shared set.
const ENTRY_ROOT_SYMBOLS: &[&str] = &[
    "main",
    "_start",
    "__StackTop",
    "__StackLimit",
    "__HeapLimit",
];

/// Linker-synthesized boundary markers the application needs from the
/// loader (to zero bss and copy data before restarting it) regardless of
/// what reconciliation found. They never appear in any package archive,
/// so they are whitelisted by name.
const BOUNDARY_SYMBOLS: &[&str] = &[
    "__HeapBase",
    "__bss_start__",
    "__bss_end__",
    "__etext",
    "__data_start__",
    "__data_end__",
];

/// Rename suffix distinguishing the loader's boundary symbols from the
/// application's own copies of the same linker-synthesized names.
const LOADER_SUFFIX: &str = "_loader";

/// What a completed build exposes to image creation and the CLI.
#[derive(Debug)]
pub struct BuildOutcome {
    pub app_elf: PathBuf,
    pub loader_elf: Option<PathBuf>,
    pub rom_elf: Option<PathBuf>,
    /// Reconciled shared symbol set, for diagnostics. Absent for a
    /// single-binary build.
    pub shared: Option<SymbolMap>,
}

pub struct TargetBuilder<T: Toolchain> {
    cfg: TargetConfig,
    toolchain: T,
    app: Builder,
    loader: Option<Builder>,
}

impl<T: Toolchain> TargetBuilder<T> {
    /// Resolve the target configuration into per-half builders. The two
    /// halves share the toolchain but carry distinct package sets, and
    /// each is compiled under a feature flag marking its side of the
    /// split.
    pub fn new(cfg: TargetConfig, toolchain: T, out_dir: &Path) -> Result<Self> {
        cfg.validate()?;

        let mut app = Builder::new(
            "app",
            cfg.app.packages.clone(),
            cfg.app.features.clone(),
            out_dir,
        );

        let loader = cfg.loader.as_ref().map(|half| {
            let mut b = Builder::new("loader", half.packages.clone(), half.features.clone(), out_dir);
            b.add_feature("SPLIT_LOADER");
            b
        });
        if loader.is_some() {
            app.add_feature("SPLIT_APPLICATION");
        }

        Ok(Self {
            cfg,
            toolchain,
            app,
            loader,
        })
    }

    pub fn app(&self) -> &Builder {
        &self.app
    }

    pub fn loader(&self) -> Option<&Builder> {
        self.loader.as_ref()
    }

    /// Run the build to completion. Any toolchain or reconciliation
    /// failure aborts immediately; re-invocation is the retry mechanism.
    pub fn build(&mut self) -> Result<BuildOutcome> {
        let tc = &self.toolchain;

        let Some(loader) = &self.loader else {
            // No loader configured: single-binary build.
            self.app.build(tc)?;
            let app_elf = self.app.elf_path();
            self.app.link(tc, &self.cfg.link_script, &[], &app_elf)?;
            return Ok(BuildOutcome {
                app_elf,
                loader_elf: None,
                rom_elf: None,
                shared: None,
            });
        };

        loader.build(tc)?;
        let loader_elf = loader.elf_path();
        loader.link(tc, &self.cfg.link_script, &[], &loader_elf)?;

        self.app.build(tc)?;

        // Reconcile: which symbols did both halves compile identically
        // out of the same packages?
        let loader_lib_sym = loader.extract_symbol_info(tc)?;
        let app_lib_sym = self.app.extract_symbol_info(tc)?;
        let (shared, conflicts) = identical_union(&app_lib_sym, &loader_lib_sym, true);
        fail_on_conflicts(conflicts)?;
        tracing::info!(
            "{} symbols matched across loader and application archives",
            shared.len()
        );
        shared.dump("shared between loader and application");

        // The application can omit its own copy of every fully-shared
        // package. The BSP package links into both halves no matter what.
        let mut common_pkgs = shared.packages();
        if let Some(bsp) = &self.cfg.bsp_pkg {
            common_pkgs.remove(bsp);
        }
        tracing::info!("application drops {} common packages", common_pkgs.len());
        self.app.remove_packages(&common_pkgs);

        // Regenerate the restricted loader view only when a contributing
        // artifact moved under it.
        let rom_elf = loader.rom_elf_path();
        let rebuild = DepTracker::rom_elf_build_required(
            &rom_elf,
            &loader_elf,
            &self.app.archive_paths(),
        )?;
        if rebuild {
            tracing::info!("generating ROM ELF {}", rom_elf.display());
            generate_rom_elf(tc, loader, &shared)?;
        } else {
            tracing::info!("ROM ELF {} is up to date", rom_elf.display());
        }

        // Final link: the application resolves the loader's exported
        // symbols as externs through the ROM ELF.
        let part2 = self
            .cfg
            .part2_link_script
            .as_ref()
            .context("split image requires a second-stage link script")?;
        let app_elf = self.app.elf_path();
        self.app
            .link(tc, part2, &[rom_elf.clone()], &app_elf)?;

        // Post-link diagnostics: what both final images ended up holding
        // identically.
        let final_app = self.app.parse_object_elf(tc, &app_elf)?;
        let final_loader = loader.parse_object_elf(tc, &loader_elf)?;
        let (overlap, _) = identical_union(&final_app, &final_loader, false);
        overlap
            .global_data_only()
            .dump("global data present in both final images");
        overlap
            .global_functions_only()
            .dump("global functions present in both final images");

        Ok(BuildOutcome {
            app_elf,
            loader_elf: Some(loader_elf),
            rom_elf: Some(rom_elf),
            shared: Some(shared),
        })
    }
}

fn fail_on_conflicts(conflicts: Vec<SymbolConflict>) -> Result<()> {
    if conflicts.is_empty() {
        return Ok(());
    }
    let mut msg =
        String::from("global data symbols diverge between application and loader:\n");
    for conflict in &conflicts {
        tracing::warn!("symbol conflict: {}", conflict);
        msg.push_str(&format!("  {}\n", conflict));
    }
    bail!("{}", msg.trim_end())
}

/// Materialize the restricted loader view.
///
/// The export set is the shared set minus the entry-root symbols,
/// intersected with what the loader's own link actually retained (dead
/// code eliminated by the loader must not be advertised), plus the fixed
/// boundary whitelist. The loader binary is copied keeping only that set
/// globally visible, then the boundary symbols are renamed so the
/// application's own copies of those names cannot collide.
fn generate_rom_elf<T: Toolchain>(
    tc: &T,
    loader: &Builder,
    shared: &SymbolMap,
) -> Result<SymbolMap> {
    let mut candidates = shared.clone();
    for name in ENTRY_ROOT_SYMBOLS {
        candidates.remove(name);
    }

    let loader_elf_sym = loader.parse_object_elf(tc, &loader.elf_path())?;
    let (mut export, _) = identical_union(&candidates, &loader_elf_sym, false);

    let mut boundary = SymbolMap::new();
    for name in BOUNDARY_SYMBOLS {
        export.add(SymbolRecord::synthetic(name));
        boundary.add(SymbolRecord::synthetic(name));
    }
    export.dump("ROM ELF export set");

    let rom_elf = loader.rom_elf_path();
    tc.copy_with_symbol_filter(&loader.elf_path(), &rom_elf, &export)
        .context("failed to republish loader binary")?;

    // Demotion is not enough for the startup roots: they must not be
    // resolvable from the application at all, so strip them outright.
    for name in ENTRY_ROOT_SYMBOLS {
        if loader_elf_sym.find(name).is_some() {
            tc.remove_symbol(&rom_elf, name)
                .with_context(|| format!("failed to strip {} from ROM ELF", name))?;
        }
    }

    tc.rename_symbols(&rom_elf, &boundary, LOADER_SUFFIX)
        .context("failed to rename boundary symbols")?;

    Ok(export)
}
