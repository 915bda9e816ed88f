//! Read-only introspection of the target process and its mapped objects.
//!
//! Everything here is a pure read of `/proc/<pid>/*` or of a mapped ELF
//! file; nothing touches tracee state. Symbol and relocation walks use the
//! `object` crate over a `memmap2` mapping that is dropped as soon as the
//! enumeration returns.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use nix::unistd::Pid;
use object::elf::Rela64;
use object::read::elf::ElfFile64;
use object::{Endianness, Object, ObjectSection, ObjectSymbol, SymbolKind};

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("bad ELF in {path}: {reason}")]
    BadElf { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TargetError>;

fn bad_elf(path: &Path, reason: impl ToString) -> TargetError {
    TargetError::BadElf {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Path of the executable behind `pid`, from the `/proc/<pid>/exe` symlink.
pub fn target_path(pid: Pid) -> Result<PathBuf> {
    Ok(fs::read_link(format!("/proc/{}/exe", pid))?)
}

/// Path behind file descriptor `fd` of `pid`, from `/proc/<pid>/fd/<fd>`.
pub fn file_path(pid: Pid, fd: u64) -> Result<PathBuf> {
    Ok(fs::read_link(format!("/proc/{}/fd/{}", pid, fd))?)
}

/// Walk `/proc/<pid>/maps` and report the base address of every first
/// file mapping (file offset `00000000`) whose path is not excluded.
/// The callback returning `true` stops the scan early.
pub fn scan_maps<F>(pid: Pid, exclude: &std::collections::HashSet<String>, mut cb: F) -> Result<()>
where
    F: FnMut(&str, u64) -> bool,
{
    let maps = fs::read_to_string(format!("/proc/{}/maps", pid))?;
    for line in maps.lines() {
        // 7f6764831000-7f6764833000 r--p 00000000 08:10 6230  /usr/lib/.../ld-linux-x86-64.so.2
        let mut fields = line.split_whitespace();
        let range = fields.next().unwrap_or("");
        let _perms = fields.next();
        let offset = fields.next().unwrap_or("");
        let _dev = fields.next();
        let _inode = fields.next();
        let path = match fields.next() {
            Some(p) => p,
            None => continue,
        };
        if offset != "00000000" || exclude.contains(path) {
            continue;
        }
        let base = match range.split('-').next().and_then(|s| u64::from_str_radix(s, 16).ok()) {
            Some(b) => b,
            None => continue,
        };
        if cb(path, base) {
            break;
        }
    }
    Ok(())
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    // Safety: the mapping is read-only and outlives no borrows of itself.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

/// Enumerate `STT_FUNC` entries of the file's `.dynsym`, reporting
/// `(symbol_name, st_value)`. The callback returning `true` stops early.
pub fn enumerate_dynsym<F>(path: &Path, mut cb: F) -> Result<()>
where
    F: FnMut(&str, u64) -> bool,
{
    let mmap = map_file(path)?;
    let obj = object::File::parse(&*mmap).map_err(|e| bad_elf(path, e))?;
    for symbol in obj.dynamic_symbols() {
        if symbol.kind() != SymbolKind::Text {
            continue;
        }
        let name = match symbol.name() {
            Ok(name) if !name.is_empty() => name,
            _ => continue,
        };
        if cb(name, symbol.address()) {
            break;
        }
    }
    Ok(())
}

/// Enumerate `.rela.plt`, reporting `(symbol_name, r_offset)` for every
/// relocation that names a dynamic symbol.
pub fn enumerate_plt_relocs<F>(path: &Path, mut cb: F) -> Result<()>
where
    F: FnMut(&str, u64) -> bool,
{
    let mmap = map_file(path)?;
    let obj = ElfFile64::<Endianness>::parse(&*mmap).map_err(|e| bad_elf(path, e))?;
    let endian = if obj.is_little_endian() {
        Endianness::Little
    } else {
        Endianness::Big
    };

    let section = match obj.section_by_name(".rela.plt") {
        Some(section) => section,
        None => return Ok(()),
    };
    let data = section.data().map_err(|e| bad_elf(path, e))?;
    let relas: &[Rela64<Endianness>] = object::pod::slice_from_all_bytes(data)
        .map_err(|()| bad_elf(path, "misaligned .rela.plt"))?;

    // Dynamic symbol names by table index, resolved once up front.
    let mut names = std::collections::HashMap::new();
    for symbol in obj.dynamic_symbols() {
        if let Ok(name) = symbol.name() {
            names.insert(symbol.index().0 as u32, name);
        }
    }

    for rela in relas {
        let sym = rela.r_sym(endian, false);
        if sym == 0 {
            continue;
        }
        if let Some(name) = names.get(&sym) {
            if cb(name, rela.r_offset.get(endian)) {
                break;
            }
        }
    }
    Ok(())
}

/// Quick ELF magic probe, used to skip non-ELF file mappings cheaply.
pub fn has_elf_magic(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    match File::open(path).and_then(|mut f| std::io::Read::read_exact(&mut f, &mut magic)) {
        Ok(()) => magic == [0x7f, b'E', b'L', b'F'],
        Err(_) => false,
    }
}
