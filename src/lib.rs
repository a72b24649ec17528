//! Split-image firmware build core.
//!
//! This library decides how a firmware image is built as two
//! independently linked binaries (a boot-resident loader and a
//! field-updatable application) that share library code compiled once.
//! It is organized into several modules:
//! - `config`: CLI configuration and the on-disk target definition.
//! - `symbol`: symbol records and the set algebra encoding linker rules.
//! - `parser`: symbol-table dump parsing.
//! - `toolchain`: the external compiler/binutils seam.
//! - `builder`: per-half compile/archive/link driver.
//! - `target`: the split-image build orchestrator and ROM-ELF generator.

pub mod builder;
pub mod config;
pub mod parser;
pub mod symbol;
pub mod target;
pub mod toolchain;
