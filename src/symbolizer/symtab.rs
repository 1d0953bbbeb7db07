extern crate goblin;
extern crate memmap2;

use self::goblin::elf::header::{EM_ARM, ET_EXEC};
use self::goblin::elf::section_header::SHN_UNDEF;
use self::goblin::elf::sym::{STT_FUNC, STT_NOTYPE};
use self::goblin::elf::Elf;
use self::memmap2::Mmap;
use std::env;
use std::fs::File;
use std::path::Path;

/// Name of the closest symbol at or below `address` in the static symbol table of the module
/// loaded at `base` from `path`.
pub fn nearest_symbol(path: &str, base: usize, address: usize) -> Option<String> {
    let file = open_module(path)?;
    let mapped = unsafe { Mmap::map(&file) }.ok()?;
    let elf = match Elf::parse(&mapped) {
        Ok(elf) => elf,
        Err(e) => {
            debug!("can't parse {} as ELF: {}", path, e);
            return None;
        }
    };

    // Executables that are not position independent carry absolute addresses.
    let target = if elf.header.e_type == ET_EXEC {
        address as u64
    } else {
        address.wrapping_sub(base) as u64
    };
    let value_mask = if elf.header.e_machine == EM_ARM { !1 } else { !0 };

    let mut best: Option<(u64, usize)> = None;
    for sym in elf.syms.iter() {
        let kind = sym.st_type();
        if kind != STT_FUNC && kind != STT_NOTYPE {
            continue;
        }
        if sym.st_shndx == SHN_UNDEF as usize || sym.st_value == 0 {
            continue;
        }
        let value = sym.st_value & value_mask;
        if value > target {
            continue;
        }
        if best.map_or(true, |(best_value, _)| value > best_value) {
            let name = elf.strtab.get_at(sym.st_name).unwrap_or("");
            // ARM and AArch64 mapping symbols ($a, $t, $x, $d) mark code kinds, not functions.
            if name.is_empty() || name.starts_with('$') {
                continue;
            }
            best = Some((value, sym.st_name));
        }
    }

    best.and_then(|(_, name)| elf.strtab.get_at(name)).map(|name| name.to_string())
}

// The loader reports the main program under the name it was started with, which may not be
// openable from the current directory.
fn open_module(path: &str) -> Option<File> {
    if let Ok(file) = File::open(path) {
        return Some(file);
    }
    let exe = env::current_exe().ok()?;
    if exe.file_name() == Path::new(path).file_name() {
        return File::open("/proc/self/exe").ok();
    }
    debug!("can't open module {}", path);
    None
}

#[cfg(test)]
mod tests {
    extern crate libc;

    use super::*;
    use std::mem;
    use std::os::raw::c_void;

    #[inline(never)]
    fn symbolized() -> usize {
        symbolized as usize
    }

    fn module_of(address: usize) -> (String, usize) {
        let mut info: libc::Dl_info = unsafe { mem::zeroed() };
        let r = unsafe { libc::dladdr(address as *const c_void, &mut info) };
        assert!(r != 0);
        let path = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) };
        (path.to_string_lossy().into_owned(), info.dli_fbase as usize)
    }

    #[test]
    fn finds_static_function() {
        let addr = symbolized();
        let (path, base) = module_of(addr);
        let name = nearest_symbol(&path, base, addr + 2).expect("symbol");
        assert!(name.contains("symbolized"), "got {}", name);
    }

    #[test]
    fn missing_module() {
        assert_eq!(nearest_symbol("/nonexistent/libnothing.so", 0, 0x1000), None);
    }
}
