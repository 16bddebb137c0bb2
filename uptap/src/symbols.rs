// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Resolving a descriptor's target library to a file on disk and its symbol
//! to the file offset `perf_event_open(2)` wants for a uprobe.
use std::fs;
use std::io::{self, BufRead, Cursor, Read};
use std::mem;
use std::path::{Path, PathBuf};
use std::str;

use byteorder::{NativeEndian, ReadBytesExt};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::{Elf, Sym};
use libc::pid_t;

use crate::error::{Error, Result};

lazy_static! {
    static ref LD_SO_CACHE: ::std::result::Result<LdSoCache, CacheError> =
        LdSoCache::load("/etc/ld.so.cache");
}

const CACHE_HEADER: &str = "glibc-ld.so.cache1.1";

/// Resolves a descriptor target to the library file to probe.
///
/// An existing path is taken as-is (canonicalized, since the kernel opens it
/// independently of our working directory). A bare name is looked up in the
/// target process's maps when a pid is given, then in the loader cache.
pub fn resolve_library(target: &Path, pid: Option<pid_t>) -> Result<PathBuf> {
    if target.is_file() {
        return fs::canonicalize(target)
            .map_err(|_| Error::LibraryNotFound(target.display().to_string()));
    }
    let name = target.to_string_lossy();
    if let Some(pid) = pid {
        if let Some(path) = resolve_proc_maps_lib(pid, &name) {
            return Ok(PathBuf::from(path));
        }
    }
    if let Ok(cache) = LD_SO_CACHE.as_ref() {
        if let Some(path) = cache.resolve(&name) {
            return Ok(PathBuf::from(path));
        }
    }
    Err(Error::LibraryNotFound(name.into_owned()))
}

/// Finds `symbol` in `library` and returns its file offset.
///
/// Dynamic symbols are tried first, then the regular symbol table. The
/// symbol's virtual address is translated through the PT_LOAD segment that
/// maps it; uprobes take offsets into the file, not addresses.
pub fn resolve_symbol_offset(library: &Path, symbol: &str) -> Result<u64> {
    let data = fs::read(library)?;
    let elf = Elf::parse(&data)?;
    let sym = resolve_sym(&elf, symbol).ok_or_else(|| {
        Error::SymbolNotFound(format!("{} in {}", symbol, library.display()))
    })?;
    let phdr = elf
        .program_headers
        .iter()
        .find(|hdr| {
            hdr.p_type == PT_LOAD
                && sym.st_value >= hdr.p_vaddr
                && sym.st_value < hdr.p_vaddr + hdr.p_memsz
        })
        .ok_or_else(|| {
            Error::Elf(format!(
                "symbol `{}` is not mapped by any loadable segment",
                symbol
            ))
        })?;
    Ok(sym.st_value - phdr.p_vaddr + phdr.p_offset)
}

fn resolve_sym(elf: &Elf, symbol: &str) -> Option<Sym> {
    let dynamic = elf.dynsyms.iter().find(|sym| {
        elf.dynstrtab
            .get_at(sym.st_name)
            .map(|name| name == symbol)
            .unwrap_or(false)
    });
    dynamic
        .or_else(|| {
            elf.syms.iter().find(|sym| {
                elf.strtab
                    .get_at(sym.st_name)
                    .map(|name| name == symbol)
                    .unwrap_or(false)
            })
        })
        .filter(|sym| !sym.is_import() && sym.st_value != 0)
}

#[derive(Debug)]
enum CacheError {
    IOError(io::Error),
    InvalidHeader,
    Truncated,
}

impl From<io::Error> for CacheError {
    fn from(error: io::Error) -> CacheError {
        CacheError::IOError(error)
    }
}

#[derive(Debug)]
struct CacheEntry {
    key: String,
    value: String,
}

/// The glibc 1.1-format `/etc/ld.so.cache`: a header, an entry table of
/// string-table offsets, and the string table itself.
#[derive(Debug)]
struct LdSoCache {
    entries: Vec<CacheEntry>,
}

impl LdSoCache {
    fn load(path: &str) -> ::std::result::Result<Self, CacheError> {
        let data = fs::read(path).map_err(CacheError::IOError)?;
        Self::parse(&data)
    }

    fn parse(data: &[u8]) -> ::std::result::Result<Self, CacheError> {
        let mut cursor = Cursor::new(data);

        let mut buf = [0u8; CACHE_HEADER.len()];
        cursor.read_exact(&mut buf)?;
        let header = str::from_utf8(&buf).or(Err(CacheError::InvalidHeader))?;
        if header != CACHE_HEADER {
            return Err(CacheError::InvalidHeader);
        }

        let num_entries = cursor.read_u32::<NativeEndian>()?;
        let _str_tab_len = cursor.read_u32::<NativeEndian>()?;
        cursor.consume(5 * mem::size_of::<u32>());

        let mut entries = Vec::with_capacity(num_entries as usize);
        for _ in 0..num_entries {
            let _flags = cursor.read_i32::<NativeEndian>()?;
            let k_pos = cursor.read_u32::<NativeEndian>()? as usize;
            let v_pos = cursor.read_u32::<NativeEndian>()? as usize;
            cursor.consume(12);
            // Offsets index the whole file, not the string table.
            let key = read_cstr(data, k_pos)?;
            let value = read_cstr(data, v_pos)?;
            entries.push(CacheEntry { key, value });
        }

        Ok(LdSoCache { entries })
    }

    fn resolve(&self, lib: &str) -> Option<&str> {
        let lib = if !lib.contains(".so") {
            lib.to_string() + ".so"
        } else {
            lib.to_string()
        };
        self.entries
            .iter()
            .find(|entry| entry.key.starts_with(&lib))
            .map(|entry| entry.value.as_str())
    }
}

fn read_cstr(data: &[u8], pos: usize) -> ::std::result::Result<String, CacheError> {
    let tail = data.get(pos..).ok_or(CacheError::Truncated)?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(CacheError::Truncated)?;
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}

fn proc_maps_libs(pid: pid_t) -> io::Result<Vec<(String, String)>> {
    let maps_file = format!("/proc/{}/maps", pid);
    let mut contents = String::new();
    fs::File::open(maps_file)?.read_to_string(&mut contents)?;
    Ok(parse_maps(&contents))
}

fn parse_maps(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter_map(|line| {
            let path = line.split_whitespace().last()?;
            if !path.starts_with('/') {
                return None;
            }
            let path = PathBuf::from(path);
            let key = path.file_name()?.to_string_lossy().into_owned();
            Some((key, path.to_string_lossy().into_owned()))
        })
        .collect()
}

fn resolve_proc_maps_lib(pid: pid_t, lib: &str) -> Option<String> {
    let libs = proc_maps_libs(pid).ok()?;

    let found = if lib.contains(".so") {
        libs.iter().find(|(k, _)| k.starts_with(lib))
    } else {
        let versioned = format!("{}-", lib);
        let suffixed = format!("{}.so", lib);
        libs.iter()
            .find(|(k, _)| k.starts_with(&suffixed) || k.starts_with(&versioned))
    };

    found.map(|(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    fn cache_image(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut image = Vec::new();
        image.write_all(CACHE_HEADER.as_bytes()).unwrap();
        image.write_u32::<NativeEndian>(entries.len() as u32).unwrap();

        let header_len = CACHE_HEADER.len() + 7 * mem::size_of::<u32>();
        let table_len = entries.len() * 24;
        let mut strings = Vec::new();
        let mut offsets = Vec::new();
        for (key, value) in entries {
            let base = header_len + table_len;
            offsets.push((base + strings.len(), key));
            strings.extend_from_slice(key.as_bytes());
            strings.push(0);
            offsets.push((base + strings.len(), value));
            strings.extend_from_slice(value.as_bytes());
            strings.push(0);
        }

        image.write_u32::<NativeEndian>(strings.len() as u32).unwrap();
        image.write_all(&[0u8; 20]).unwrap();
        for pair in offsets.chunks(2) {
            image.write_i32::<NativeEndian>(0).unwrap();
            image.write_u32::<NativeEndian>(pair[0].0 as u32).unwrap();
            image.write_u32::<NativeEndian>(pair[1].0 as u32).unwrap();
            image.write_all(&[0u8; 12]).unwrap();
        }
        image.write_all(&strings).unwrap();
        image
    }

    #[test]
    fn parses_and_resolves_cache_entries() {
        let image = cache_image(&[
            ("libc.so.6", "/lib/x86_64-linux-gnu/libc.so.6"),
            ("libjpaxos-pmem.so", "/opt/jpaxos/libjpaxos-pmem.so"),
        ]);
        let cache = LdSoCache::parse(&image).unwrap();
        assert_eq!(
            cache.resolve("libc"),
            Some("/lib/x86_64-linux-gnu/libc.so.6")
        );
        assert_eq!(
            cache.resolve("libjpaxos-pmem.so"),
            Some("/opt/jpaxos/libjpaxos-pmem.so")
        );
        assert_eq!(cache.resolve("libnothere"), None);
    }

    #[test]
    fn rejects_foreign_cache_images() {
        assert!(matches!(
            LdSoCache::parse(b"ld.so-1.7.0"),
            Err(CacheError::InvalidHeader) | Err(CacheError::IOError(_))
        ));
        let mut image = cache_image(&[("libm.so.6", "/lib/libm.so.6")]);
        image.truncate(image.len() - 4);
        assert!(matches!(
            LdSoCache::parse(&image),
            Err(CacheError::Truncated)
        ));
    }

    #[test]
    fn maps_lines_keep_only_file_backed_regions() {
        let contents = "\
7f1000000000-7f1000001000 r-xp 00000000 08:01 131 /usr/lib/libjpaxos-pmem.so\n\
7f2000000000-7f2000001000 rw-p 00000000 00:00 0 [heap]\n\
7f3000000000-7f3000021000 r-xp 00000000 08:01 7 /lib/x86_64-linux-gnu/libpthread-2.31.so\n\
7f4000000000-7f4000001000 rw-p 00000000 00:00 0\n";
        let libs = parse_maps(contents);
        assert_eq!(
            libs,
            vec![
                (
                    "libjpaxos-pmem.so".to_string(),
                    "/usr/lib/libjpaxos-pmem.so".to_string()
                ),
                (
                    "libpthread-2.31.so".to_string(),
                    "/lib/x86_64-linux-gnu/libpthread-2.31.so".to_string()
                ),
            ]
        );
    }

    #[test]
    fn explicit_paths_resolve_to_themselves() {
        let path = std::env::temp_dir().join("uptap-symbols-test.so");
        fs::write(&path, b"not really an elf").unwrap();
        let resolved = resolve_library(&path, None).unwrap();
        assert_eq!(resolved, fs::canonicalize(&path).unwrap());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_libraries_name_the_target() {
        let err = resolve_library(Path::new("libdefinitely-not-here"), None);
        match err {
            Err(Error::LibraryNotFound(name)) => {
                assert_eq!(name, "libdefinitely-not-here")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
