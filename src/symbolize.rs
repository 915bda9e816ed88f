//! Instruction-pointer symbolisation against the live process map.
//!
//! A [`Symbolizer`] is owned by the record store's worker thread. Each
//! `refresh` re-reads `/proc/<pid>/maps`, loads debug info for every
//! file-backed module and replaces the previous report wholesale; the
//! tracing engine only flags that a refresh is due, it never touches the
//! handle itself.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use nix::unistd::Pid;
use object::{Object, ObjectKind, ObjectSymbol};
use tracing::{debug, warn};

type DwarfReader = EndianRcSlice<RunTimeEndian>;

/// One mapped object file of the tracee.
struct Module {
    path: PathBuf,
    base: u64,
    end: u64,
    /// ET_EXEC modules carry absolute addresses; ET_DYN are base-relative.
    relocatable: bool,
    ctx: Option<addr2line::Context<DwarfReader>>,
    /// `(static_address, name)` sorted by address, the fallback when DWARF
    /// has no frame for an address.
    symbols: Vec<(u64, String)>,
}

/// What an instruction pointer resolved to. Names stay optional; the
/// record store substitutes its placeholder for missing ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: i32,
    pub column: i32,
}

pub struct Symbolizer {
    pid: Pid,
    modules: Vec<Module>,
}

impl Symbolizer {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            modules: Vec::new(),
        }
    }

    /// Rebuild the module report from `/proc/<pid>/maps`. Modules that
    /// fail to load keep their address range so lookups inside them report
    /// a gap instead of attributing frames to a neighbour.
    pub fn refresh(&mut self) -> Result<()> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.pid))
            .with_context(|| format!("reading maps of pid {}", self.pid))?;

        // Group mappings by backing file: base from the offset-0 mapping,
        // end from the furthest mapping of the same file.
        let mut ranges: Vec<(String, u64, u64)> = Vec::new();
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let range = fields.next().unwrap_or("");
            let _perms = fields.next();
            let offset = fields.next().unwrap_or("");
            let _dev = fields.next();
            let _inode = fields.next();
            let path = match fields.next() {
                Some(p) if p.starts_with('/') => p,
                _ => continue,
            };
            let (start, end) = match parse_range(range) {
                Some(r) => r,
                None => continue,
            };
            match ranges.iter().position(|(p, _, _)| p == path) {
                Some(i) => {
                    let (_, base, max_end) = &mut ranges[i];
                    if offset == "00000000" {
                        *base = (*base).min(start);
                    }
                    *max_end = (*max_end).max(end);
                }
                None if offset == "00000000" => ranges.push((path.to_string(), start, end)),
                None => {}
            }
        }

        self.modules = ranges
            .into_iter()
            .map(|(path, base, end)| load_module(Path::new(&path), base, end))
            .collect();
        debug!(pid = %self.pid, modules = self.modules.len(), "symbolizer refreshed");
        Ok(())
    }

    /// Resolve one instruction pointer. `None` means no module covers the
    /// address (the caller emits a gap frame).
    pub fn resolve(&self, ip: u64) -> Option<ResolvedSymbol> {
        let module = self
            .modules
            .iter()
            .find(|m| ip >= m.base && ip < m.end)?;
        let addr = if module.relocatable { ip - module.base } else { ip };

        let mut resolved = ResolvedSymbol {
            function: None,
            file: None,
            line: -1,
            column: -1,
        };

        if let Some(ctx) = &module.ctx {
            if let Ok(Some(location)) = ctx.find_location(addr) {
                resolved.file = location.file.map(str::to_string);
                resolved.line = location.line.map(|l| l as i32).unwrap_or(-1);
                resolved.column = location.column.map(|c| c as i32).unwrap_or(-1);
            }
            if let Ok(mut frames) = ctx.find_frames(addr).skip_all_loads() {
                if let Ok(Some(frame)) = frames.next() {
                    if let Some(function) = frame.function {
                        if let Ok(raw) = function.raw_name() {
                            resolved.function =
                                Some(addr2line::demangle_auto(raw, function.language).into_owned());
                        }
                    }
                }
            }
        }

        if resolved.function.is_none() {
            resolved.function = module.symbol_for(addr);
        }

        Some(resolved)
    }

    #[cfg(test)]
    fn module_count(&self) -> usize {
        self.modules.len()
    }
}

fn parse_range(range: &str) -> Option<(u64, u64)> {
    let (start, end) = range.split_once('-')?;
    Some((
        u64::from_str_radix(start, 16).ok()?,
        u64::from_str_radix(end, 16).ok()?,
    ))
}

fn load_module(path: &Path, base: u64, end: u64) -> Module {
    let mut module = Module {
        path: path.to_path_buf(),
        base,
        end,
        relocatable: true,
        ctx: None,
        symbols: Vec::new(),
    };

    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open mapped file");
            return module;
        }
    };
    let mmap = match unsafe { memmap2::Mmap::map(&file) } {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot map file");
            return module;
        }
    };
    let obj = match object::File::parse(&*mmap) {
        Ok(o) => o,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot parse mapped file");
            return module;
        }
    };

    module.relocatable = obj.kind() != ObjectKind::Executable;

    // Prefer the full symtab, fall back to dynsym for stripped objects.
    let mut symbols: Vec<(u64, String)> = obj
        .symbols()
        .chain(obj.dynamic_symbols())
        .filter(|s| s.address() > 0)
        .filter_map(|s| {
            s.name()
                .ok()
                .filter(|n| !n.is_empty())
                .map(|n| (s.address(), n.to_string()))
        })
        .collect();
    symbols.sort_by_key(|(addr, _)| *addr);
    symbols.dedup_by_key(|(addr, _)| *addr);
    module.symbols = symbols;

    let endian = if obj.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    let load_section = |id: gimli::SectionId| -> std::result::Result<DwarfReader, gimli::Error> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|section| object::ObjectSection::uncompressed_data(&section).ok())
            .unwrap_or(Cow::Borrowed(&[]));
        let bytes: Rc<[u8]> = Rc::from(data.into_owned());
        Ok(EndianRcSlice::new(bytes, endian))
    };
    match gimli::Dwarf::load(&load_section).map(addr2line::Context::from_dwarf) {
        Ok(Ok(ctx)) => module.ctx = Some(ctx),
        Ok(Err(e)) => debug!(path = %module.path.display(), error = %e, "no usable DWARF"),
        Err(e) => debug!(path = %module.path.display(), error = %e, "no usable DWARF"),
    }

    module
}

impl Module {
    /// Nearest symbol at or below `addr`, demangled.
    fn symbol_for(&self, addr: u64) -> Option<String> {
        let idx = match self.symbols.binary_search_by_key(&addr, |(a, _)| *a) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let (_, name) = &self.symbols[idx];
        Some(addr2line::demangle_auto(Cow::Borrowed(name.as_str()), None).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_pid() -> Pid {
        Pid::from_raw(std::process::id() as i32)
    }

    #[test]
    fn test_refresh_finds_own_modules() {
        let mut symbolizer = Symbolizer::new(own_pid());
        symbolizer.refresh().unwrap();
        assert!(symbolizer.module_count() > 0);
    }

    #[test]
    fn test_resolve_own_function() {
        let mut symbolizer = Symbolizer::new(own_pid());
        symbolizer.refresh().unwrap();

        let ip = test_resolve_own_function as usize as u64;
        let resolved = symbolizer.resolve(ip);
        // The test binary is always mapped, so the module must be found;
        // a name is expected from either DWARF or the symbol table.
        let resolved = resolved.expect("module covering own code");
        assert!(resolved.function.is_some());
    }

    #[test]
    fn test_resolve_unmapped_address_is_gap() {
        let mut symbolizer = Symbolizer::new(own_pid());
        symbolizer.refresh().unwrap();
        assert_eq!(symbolizer.resolve(1), None);
    }

    #[test]
    fn test_refresh_of_dead_pid_fails() {
        // Pid 1 maps is unreadable for an unprivileged test run; a pid in
        // the far future does not exist at all.
        let mut symbolizer = Symbolizer::new(Pid::from_raw(i32::MAX - 1));
        assert!(symbolizer.refresh().is_err());
    }

    #[test]
    fn test_resolve_before_refresh_is_gap() {
        let symbolizer = Symbolizer::new(own_pid());
        assert_eq!(symbolizer.resolve(0x1000), None);
    }
}
