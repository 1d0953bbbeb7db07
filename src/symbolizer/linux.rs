extern crate libc;

use std::ffi::CStr;
use std::mem;
use std::os::raw::{c_char, c_void};

use super::{demangle, ResolvedFrame};

fn owned_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let s = unsafe { CStr::from_ptr(ptr) };
    Some(s.to_string_lossy().into_owned())
}

/// Looks up the module and nearest symbol for `address` through the dynamic loader.
///
/// The loader only knows exported symbols. When it finds the module but no symbol, the module's
/// own symbol table is consulted instead.
pub fn resolve(address: usize) -> ResolvedFrame {
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    let r = unsafe { libc::dladdr(address as *const c_void, &mut info) };
    if r == 0 {
        // No matching shared object.
        trace!("no module owns 0x{:x}", address);
        return ResolvedFrame::unresolved(address);
    }

    let module_base = info.dli_fbase as usize;
    let module_path = owned_str(info.dli_fname);
    let mut symbol_name = owned_str(info.dli_sname);

    #[cfg(feature = "symtab")]
    {
        if symbol_name.is_none() {
            if let Some(ref path) = module_path {
                symbol_name = super::symtab::nearest_symbol(path, module_base, address);
            }
        }
    }

    let demangled_name = symbol_name.as_ref().and_then(|name| demangle(name));

    ResolvedFrame {
        address,
        module_base,
        relative_address: address.wrapping_sub(module_base),
        module_path,
        symbol_name,
        demangled_name,
    }
}

#[cfg(feature = "demangle")]
type CxaDemangle = unsafe extern "C" fn(
    mangled_name: *const c_char,
    output_buffer: *mut c_char,
    length: *mut libc::size_t,
    status: *mut libc::c_int,
) -> *mut c_char;

/// Demangles an Itanium C++ name with the `__cxa_demangle` of whatever C++ runtime is loaded.
///
/// Without a C++ runtime in the process there are no C++ frames to name, so nothing is lost.
#[cfg(feature = "demangle")]
pub fn cxa_demangle(name: &str) -> Option<String> {
    use std::ffi::CString;
    use std::ptr;

    if !name.starts_with("_Z") {
        return None;
    }
    let symbol = CStr::from_bytes_with_nul(b"__cxa_demangle\0").ok()?;
    let f = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
    if f.is_null() {
        trace!("no __cxa_demangle in the process for {}", name);
        return None;
    }
    let f: CxaDemangle = unsafe { mem::transmute(f) };

    let mangled = CString::new(name).ok()?;
    let mut status: libc::c_int = 0;
    let demangled = unsafe { f(mangled.as_ptr(), ptr::null_mut(), ptr::null_mut(), &mut status) };
    if demangled.is_null() {
        return None;
    }
    let result = if status == 0 { owned_str(demangled) } else { None };
    unsafe { libc::free(demangled as *mut c_void) };
    result
}
