//! Symbol table dump parser.
//!
//! Turns the raw text of an `objdump -t` dump into a `SymbolMap`. The
//! dump is line oriented:
//!
//! ```text
//! 00012970 l       .bss       00000000 _end
//! 000084b0 g     F .text      00000034 os_arch_start
//! 00011c88 g     O .data      00000008 g_os_task_list
//! ```
//!
//! Columns are hex address, the 7-character binding/type flag field
//! (which may itself contain spaces), section, hex size, name. Headers,
//! separators and malformed lines are skipped, never fatal.

use regex::Regex;

use crate::symbol::{SymbolMap, SymbolRecord, SymbolSource};

/// One regex capture per column; the flag field is matched positionally
/// so embedded spaces survive.
pub fn symbol_line_regex() -> Regex {
    Regex::new(
        "^([0-9A-Fa-f]+)[\t ]+([lgu! ][w ][C ][W ][Ii ][Dd ][FfO ])[\t ]+([^\t\n\x0c\r ]+)[\t ]+([0-9a-fA-F]+)[\t ]([^\t\n\x0c\r ]+)",
    )
    .unwrap()
}

/// Parse one dump line. Returns `None` for anything that is not a
/// well-formed symbol row.
pub fn parse_line(line: &str, re: &Regex) -> Option<SymbolRecord> {
    let caps = re.captures(line)?;

    let addr = match u32::from_str_radix(&caps[1], 16) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!("unparseable address in symbol line: {}", line.trim_end());
            return None;
        }
    };
    let size = match u32::from_str_radix(&caps[4], 16) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!("unparseable size in symbol line: {}", line.trim_end());
            return None;
        }
    };

    Some(SymbolRecord::new(
        "",
        &caps[5],
        &caps[2],
        &caps[3],
        size,
        addr,
        SymbolSource::Archive,
    ))
}

/// Parse a whole dump into a map owned by `bpkg`.
///
/// Undefined, debug and file-meta entries are always discarded. With
/// `mem_sections_only` set only symbols living in memory-allocating
/// sections (.text/.data/.bss/.rodata/*COM*) are kept; archive members
/// carry plenty of rows that do not matter for link-time identity.
pub fn parse_artifact(
    raw: &str,
    bpkg: &str,
    ext: SymbolSource,
    mem_sections_only: bool,
) -> SymbolMap {
    let re = symbol_line_regex();
    let mut sm = SymbolMap::new();

    for line in raw.lines() {
        let Some(mut rec) = parse_line(line, &re) else {
            continue;
        };
        rec.bpkg = bpkg.to_string();
        rec.ext = ext;

        if rec.is_section("*UND*") || rec.is_debug() || rec.is_file() {
            continue;
        }

        if mem_sections_only {
            let include = rec.is_section(".bss")
                || rec.is_section(".text")
                || rec.is_section(".data")
                || rec.is_section("*COM*")
                || rec.is_section(".rodata");
            if !include {
                continue;
            }
        }

        tracing::trace!("keeping symbol {} in package {}", rec.name, rec.bpkg);
        sm.add(rec);
    }

    sm
}
