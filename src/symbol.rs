//! Symbol table model and merge algebra.
//!
//! A `SymbolMap` holds the symbols extracted from one build artifact (a
//! package archive or a linked ELF), keyed by name. The algebra on maps
//! (`identical_union`, `merge`) encodes linker resolution semantics:
//! weak definitions yield to strong ones, local definitions are scoped to
//! their package, and two strong globals with the same name but different
//! identity are a hard error.

use anyhow::{bail, Result};
use std::collections::{hash_map, HashMap, HashSet};
use std::fmt;

/// Where a symbol record was read from.
///
/// Archive members are candidates the linker has not resolved yet; a
/// linked ELF holds the symbols the linker actually retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSource {
    Archive,
    LinkedElf,
}

/// Sentinel package id for symbols read out of a linked binary rather
/// than a package archive.
pub const ELF_PKG: &str = "elf";

/// Binding and type facets of one symbol, decoded once from the
/// 7-character objdump flag field (e.g. `"g     F"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindingFlags {
    pub local: bool,
    pub weak: bool,
    pub function: bool,
    pub debug: bool,
    pub file_meta: bool,
}

impl BindingFlags {
    /// Decode the positional objdump flag characters.
    ///
    /// Column 0 is scope (`l`/`g`), 1 weak (`w`), 5 debug (`d`),
    /// 6 type (`F` function, `f` file, `O` object).
    pub fn decode(code: &str) -> Self {
        let at = |i: usize| code.as_bytes().get(i).copied().unwrap_or(b' ');
        Self {
            local: at(0) == b'l',
            weak: at(1) == b'w',
            debug: at(5) == b'd',
            file_meta: at(6) == b'f',
            function: at(6) == b'F',
        }
    }

    pub fn is_global(&self) -> bool {
        !self.local
    }
}

/// One entry from an artifact's symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    /// Package that produced the symbol, or [`ELF_PKG`] for a linked binary.
    pub bpkg: String,
    pub name: String,
    /// Raw objdump flag field. Two records are binding-identical iff
    /// their codes are equal; the decoded facets live in `flags`.
    pub code: String,
    pub flags: BindingFlags,
    pub section: String,
    /// Size in bytes. Zero is a valid size (absolute markers), not "missing".
    pub size: u32,
    pub addr: u32,
    pub ext: SymbolSource,
}

impl SymbolRecord {
    pub fn new(
        bpkg: &str,
        name: &str,
        code: &str,
        section: &str,
        size: u32,
        addr: u32,
        ext: SymbolSource,
    ) -> Self {
        Self {
            bpkg: bpkg.to_string(),
            name: name.to_string(),
            code: code.to_string(),
            flags: BindingFlags::decode(code),
            section: section.to_string(),
            size,
            addr,
            ext,
        }
    }

    /// A linker-synthesized symbol known only by name (boundary markers
    /// such as `__HeapBase` that never appear in any package archive).
    pub fn synthetic(name: &str) -> Self {
        Self::new(ELF_PKG, name, "g      ", "*ABS*", 0, 0, SymbolSource::LinkedElf)
    }

    pub fn is_local(&self) -> bool {
        self.flags.local
    }

    pub fn is_weak(&self) -> bool {
        self.flags.weak
    }

    pub fn is_debug(&self) -> bool {
        self.flags.debug
    }

    pub fn is_file(&self) -> bool {
        self.flags.file_meta
    }

    pub fn is_function(&self) -> bool {
        self.flags.function
    }

    pub fn is_section(&self, prefix: &str) -> bool {
        self.section.starts_with(prefix)
    }
}

impl fmt::Display for SymbolRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) -- ({}) size {:#x} at {:#x} from {}",
            self.name, self.code, self.section, self.size, self.addr, self.bpkg
        )
    }
}

/// A name collision between two semantically different global data
/// symbols. Linked into two halves of a split image these would alias
/// incorrectly at runtime, so the build must fail.
#[derive(Debug, Clone)]
pub struct SymbolConflict {
    pub name: String,
    pub ours: SymbolRecord,
    pub theirs: SymbolRecord,
}

impl fmt::Display for SymbolConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: package {} (code {:?}, size {:#x}) vs package {} (code {:?}, size {:#x})",
            self.name,
            self.ours.bpkg,
            self.ours.code,
            self.ours.size,
            self.theirs.bpkg,
            self.theirs.code,
            self.theirs.size
        )
    }
}

/// Symbols of one build artifact, keyed by name.
///
/// Insertion is last-write-wins; the higher-level operations pre-filter
/// before inserting, so overwrite is a primitive here rather than a bug.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    syms: HashMap<String, SymbolRecord>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: SymbolRecord) {
        self.syms.insert(record.name.clone(), record);
    }

    pub fn find(&self, name: &str) -> Option<&SymbolRecord> {
        self.syms.get(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.syms.remove(name);
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    pub fn iter(&self) -> hash_map::Values<'_, String, SymbolRecord> {
        self.syms.values()
    }

    /// View of the symbols whose section name starts with `prefix`.
    pub fn filter_section(&self, prefix: &str) -> SymbolMap {
        let mut out = SymbolMap::new();
        for rec in self.iter().filter(|r| r.is_section(prefix)) {
            out.add(rec.clone());
        }
        out
    }

    /// View of the symbols owned by one package.
    pub fn filter_pkg(&self, bpkg: &str) -> SymbolMap {
        let mut out = SymbolMap::new();
        for rec in self.iter().filter(|r| r.bpkg == bpkg) {
            out.add(rec.clone());
        }
        out
    }

    /// Set of packages contributing at least one symbol.
    pub fn packages(&self) -> HashSet<String> {
        self.iter().map(|r| r.bpkg.clone()).collect()
    }

    /// Global data (non-function) symbols only.
    pub fn global_data_only(&self) -> SymbolMap {
        let mut out = SymbolMap::new();
        for rec in self.iter().filter(|r| !r.is_local() && !r.is_function()) {
            out.add(rec.clone());
        }
        out
    }

    /// Global function symbols only.
    pub fn global_functions_only(&self) -> SymbolMap {
        let mut out = SymbolMap::new();
        for rec in self.iter().filter(|r| !r.is_local() && r.is_function()) {
            out.add(rec.clone());
        }
        out
    }

    /// Trace every symbol in the map under a label.
    pub fn dump(&self, label: &str) {
        tracing::debug!("symbols: {}", label);
        for rec in self.iter() {
            tracing::debug!("  {}", rec);
        }
    }

    /// Fold `incoming` into `self` with linker precedence.
    ///
    /// A weak definition yields to a strong one. Two local definitions of
    /// one name coexist (each package keeps its own instance; the
    /// incoming copy is dropped). Two strong globals of one name is
    /// ambiguous external linkage and fails.
    pub fn merge(&mut self, incoming: SymbolMap) -> Result<()> {
        for (name, rec) in incoming.syms {
            match self.syms.get(&name) {
                None => {
                    self.syms.insert(name, rec);
                }
                Some(existing) => {
                    if existing.is_weak() && !rec.is_weak() {
                        self.syms.insert(name, rec);
                    } else if rec.is_weak() && !existing.is_weak() {
                        // Strong definition already present.
                    } else if rec.is_local() && existing.is_local() {
                        tracing::debug!(
                            "local symbol {} defined by both {} and {}",
                            name,
                            rec.bpkg,
                            existing.bpkg
                        );
                    } else {
                        bail!(
                            "global symbol conflict: {} defined by both {} and {}",
                            name,
                            rec.bpkg,
                            existing.bpkg
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a SymbolMap {
    type Item = &'a SymbolRecord;
    type IntoIter = hash_map::Values<'a, String, SymbolRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Intersect two maps by identity.
///
/// A name appears in the shared result only if present in both inputs
/// with equal binding code and size (and equal owning package when
/// `compare_pkg` is set). A mismatch between two strong global data
/// symbols is reported as a conflict; mismatches among function or local
/// symbols are silently non-shared, since locals legitimately diverge by
/// package.
pub fn identical_union(
    a: &SymbolMap,
    b: &SymbolMap,
    compare_pkg: bool,
) -> (SymbolMap, Vec<SymbolConflict>) {
    let mut shared = SymbolMap::new();
    let mut conflicts = Vec::new();

    for rec_a in a.iter() {
        let Some(rec_b) = b.find(&rec_a.name) else {
            continue;
        };
        let pkg_ok = !compare_pkg || rec_a.bpkg == rec_b.bpkg;
        if rec_a.code == rec_b.code && rec_a.size == rec_b.size && pkg_ok {
            shared.add(rec_a.clone());
        } else if is_strong_global_data(rec_a) && is_strong_global_data(rec_b) {
            conflicts.push(SymbolConflict {
                name: rec_a.name.clone(),
                ours: rec_a.clone(),
                theirs: rec_b.clone(),
            });
        }
    }

    (shared, conflicts)
}

fn is_strong_global_data(rec: &SymbolRecord) -> bool {
    !rec.is_local() && !rec.is_weak() && !rec.is_function()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(bpkg: &str, name: &str, code: &str, section: &str, size: u32) -> SymbolRecord {
        SymbolRecord::new(bpkg, name, code, section, size, 0x1000, SymbolSource::Archive)
    }

    #[test]
    fn decode_flag_facets() {
        let f = BindingFlags::decode("l     F");
        assert!(f.local && f.function && !f.weak && !f.debug);

        let f = BindingFlags::decode("gw    O");
        assert!(!f.local && f.weak && !f.function);

        let f = BindingFlags::decode("l    df");
        assert!(f.debug && f.file_meta);
    }

    #[test]
    fn add_is_last_write_wins() {
        let mut sm = SymbolMap::new();
        sm.add(rec("pkg_a", "foo", "g     F", ".text", 0x10));
        sm.add(rec("pkg_b", "foo", "g     F", ".text", 0x20));
        assert_eq!(sm.len(), 1);
        assert_eq!(sm.find("foo").unwrap().bpkg, "pkg_b");
    }

    #[test]
    fn union_requires_presence_in_both() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("p", "only_in_a", "g     F", ".text", 4));
        a.add(rec("p", "both", "g     F", ".text", 8));
        b.add(rec("p", "both", "g     F", ".text", 8));

        let (shared, conflicts) = identical_union(&a, &b, true);
        assert!(conflicts.is_empty());
        assert_eq!(shared.len(), 1);
        assert!(shared.find("both").is_some());
        assert!(shared.find("only_in_a").is_none());
    }

    #[test]
    fn union_membership_is_commutative() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("p", "foo", "g     F", ".text", 0x10));
        a.add(rec("p", "bar", "g     O", ".data", 4));
        b.add(rec("p", "foo", "g     F", ".text", 0x10));
        b.add(rec("p", "bar", "g     O", ".data", 4));
        b.add(rec("q", "baz", "g     O", ".bss", 4));

        let (ab, _) = identical_union(&a, &b, true);
        let (ba, _) = identical_union(&b, &a, true);
        let mut names_ab: Vec<_> = ab.iter().map(|r| r.name.clone()).collect();
        let mut names_ba: Vec<_> = ba.iter().map(|r| r.name.clone()).collect();
        names_ab.sort();
        names_ba.sort();
        assert_eq!(names_ab, names_ba);
    }

    #[test]
    fn union_rejects_differing_size() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("p", "foo", "g     F", ".text", 0x10));
        b.add(rec("p", "foo", "g     F", ".text", 0x20));

        let (shared, conflicts) = identical_union(&a, &b, true);
        assert!(shared.is_empty());
        // Function mismatches are not hard conflicts.
        assert!(conflicts.is_empty());
    }

    #[test]
    fn global_data_size_divergence_is_a_conflict() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("pkg_a", "g_shared_state", "g     O", ".bss", 16));
        b.add(rec("pkg_b", "g_shared_state", "g     O", ".bss", 32));

        let (shared, conflicts) = identical_union(&a, &b, true);
        assert!(shared.is_empty());
        assert_eq!(conflicts.len(), 1);
        let c = &conflicts[0];
        assert_eq!(c.name, "g_shared_state");
        let msg = c.to_string();
        assert!(msg.contains("pkg_a") && msg.contains("pkg_b"));
        assert!(msg.contains("0x10") && msg.contains("0x20"));
    }

    #[test]
    fn local_divergence_is_not_a_conflict() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("pkg_a", "state", "l     O", ".bss", 16));
        b.add(rec("pkg_b", "state", "l     O", ".bss", 32));

        let (shared, conflicts) = identical_union(&a, &b, true);
        assert!(shared.is_empty());
        assert!(conflicts.is_empty());
    }

    #[test]
    fn union_compare_pkg_controls_provenance_check() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("pkg_a", "foo", "g     F", ".text", 0x10));
        b.add(rec("pkg_b", "foo", "g     F", ".text", 0x10));

        let (shared, _) = identical_union(&a, &b, true);
        assert!(shared.is_empty());
        let (shared, _) = identical_union(&a, &b, false);
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn zero_size_symbol_survives_union() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("p", "__init_array_start", "l      ", ".init_array", 0));
        b.add(rec("p", "__init_array_start", "l      ", ".init_array", 0));

        let (shared, conflicts) = identical_union(&a, &b, true);
        assert!(conflicts.is_empty());
        assert_eq!(shared.find("__init_array_start").unwrap().size, 0);
    }

    #[test]
    fn merge_disjoint_is_union() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("pkg_a", "foo", "g     F", ".text", 4));
        b.add(rec("pkg_b", "bar", "g     F", ".text", 8));

        a.merge(b).unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.find("foo").is_some() && a.find("bar").is_some());
    }

    #[test]
    fn merge_weak_yields_to_strong() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("pkg_a", "irq_handler", "gw    F", ".text", 2));
        b.add(rec("pkg_b", "irq_handler", "g     F", ".text", 0x40));

        a.merge(b).unwrap();
        assert_eq!(a.find("irq_handler").unwrap().bpkg, "pkg_b");

        // And in the other direction the strong one stays.
        let mut c = SymbolMap::new();
        c.add(rec("pkg_c", "irq_handler", "gw    F", ".text", 2));
        a.merge(c).unwrap();
        assert_eq!(a.find("irq_handler").unwrap().bpkg, "pkg_b");
    }

    #[test]
    fn merge_two_locals_is_fine() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("pkg_a", "state", "l     O", ".bss", 4));
        b.add(rec("pkg_b", "state", "l     O", ".bss", 8));

        a.merge(b).unwrap();
        // The existing instance is kept; the incoming copy is dropped.
        assert_eq!(a.find("state").unwrap().bpkg, "pkg_a");
    }

    #[test]
    fn merge_two_strong_globals_fails() {
        let mut a = SymbolMap::new();
        let mut b = SymbolMap::new();
        a.add(rec("pkg_a", "g_state", "g     O", ".data", 4));
        b.add(rec("pkg_b", "g_state", "g     O", ".data", 4));

        let err = a.merge(b).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("g_state"));
        assert!(msg.contains("pkg_a") && msg.contains("pkg_b"));
    }

    #[test]
    fn section_and_pkg_filters() {
        let mut sm = SymbolMap::new();
        sm.add(rec("pkg_a", "foo", "g     F", ".text", 4));
        sm.add(rec("pkg_a", "bar", "g     O", ".bss.core", 4));
        sm.add(rec("pkg_b", "baz", "g     O", ".bss", 4));

        assert_eq!(sm.filter_section(".bss").len(), 2);
        assert_eq!(sm.filter_section(".text").len(), 1);
        assert_eq!(sm.filter_pkg("pkg_a").len(), 2);
        assert_eq!(sm.packages().len(), 2);
    }

    #[test]
    fn global_views_split_on_function_facet() {
        let mut sm = SymbolMap::new();
        sm.add(rec("p", "func", "g     F", ".text", 4));
        sm.add(rec("p", "data", "g     O", ".data", 4));
        sm.add(rec("p", "loc", "l     O", ".bss", 4));

        assert_eq!(sm.global_functions_only().len(), 1);
        assert!(sm.global_functions_only().find("func").is_some());
        assert_eq!(sm.global_data_only().len(), 1);
        assert!(sm.global_data_only().find("data").is_some());
    }
}
