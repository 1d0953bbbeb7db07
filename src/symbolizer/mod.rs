//! Turns collected addresses into module relative offsets and symbol names.
//!
//! Nothing is cached: each address is looked up on its own, which is fine for something that
//! runs once per crash.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(all(feature = "symtab", any(target_os = "linux", target_os = "android")))]
mod symtab;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::linux::resolve;

/// Everything known about one address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedFrame {
    pub address: usize,
    /// Load address of the owning module, zero if no module owns the address.
    pub module_base: usize,
    /// `address - module_base`. This matches what `nm` and `objdump` show for position
    /// independent code.
    pub relative_address: usize,
    pub module_path: Option<String>,
    pub symbol_name: Option<String>,
    pub demangled_name: Option<String>,
}

impl ResolvedFrame {
    /// A frame for an address outside every loaded module.
    pub fn unresolved(address: usize) -> Self {
        ResolvedFrame {
            address,
            relative_address: address,
            ..Default::default()
        }
    }

    /// The demangled name, else the raw symbol name, else the empty string.
    pub fn display_name(&self) -> &str {
        self.demangled_name
            .as_ref()
            .or(self.symbol_name.as_ref())
            .map(|name| name.as_str())
            .unwrap_or("")
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn resolve(address: usize) -> ResolvedFrame {
    ResolvedFrame::unresolved(address)
}

/// Demangles a symbol name. Returns None for names that are not mangled or that fail to parse.
///
/// Rust names lose their trailing hash. Itanium C++ names go through the `__cxa_demangle` of the
/// C++ runtime already loaded in the process, if there is one.
#[cfg(feature = "demangle")]
pub fn demangle(name: &str) -> Option<String> {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return Some(format!("{:#}", demangled));
    }
    demangle_cxx(name)
}

#[cfg(all(feature = "demangle", any(target_os = "linux", target_os = "android")))]
fn demangle_cxx(name: &str) -> Option<String> {
    linux::cxa_demangle(name)
}

#[cfg(all(feature = "demangle", not(any(target_os = "linux", target_os = "android"))))]
fn demangle_cxx(_name: &str) -> Option<String> {
    None
}

#[cfg(not(feature = "demangle"))]
pub fn demangle(_name: &str) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_are_kept() {
        assert_eq!(demangle("main"), None);
        let frame = ResolvedFrame {
            symbol_name: Some("main".to_string()),
            demangled_name: demangle("main"),
            ..ResolvedFrame::unresolved(0x1000)
        };
        assert_eq!(frame.display_name(), "main");
    }

    #[cfg(feature = "demangle")]
    #[test]
    fn rust_names_are_demangled() {
        assert_eq!(
            demangle("_ZN10crash_demo5func117h05af221e174051e9E").as_ref().map(|s| s.as_str()),
            Some("crash_demo::func1")
        );
        // Truncated mangling is left alone.
        assert_eq!(demangle("_ZN10crash_demo5fu"), None);
    }

    #[cfg(all(feature = "demangle", target_os = "linux", target_env = "gnu"))]
    #[test]
    fn cxx_names_are_demangled_with_a_cxx_runtime() {
        use std::ffi::CString;

        let lib = CString::new("libstdc++.so.6").unwrap();
        let handle = unsafe { libc::dlopen(lib.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            // No C++ runtime installed, so there can't be C++ frames either.
            assert_eq!(demangle("_ZN3foo3barEi"), None);
            return;
        }
        assert_eq!(demangle("_ZN3foo3barEi").as_ref().map(|s| s.as_str()), Some("foo::bar(int)"));
        assert_eq!(demangle("_Z3bazv").as_ref().map(|s| s.as_str()), Some("baz()"));
        assert_eq!(demangle("_Zz"), None);
        assert_eq!(demangle("main"), None);
    }

    #[test]
    fn display_name_falls_back() {
        let mut frame = ResolvedFrame::unresolved(0x42);
        assert_eq!(frame.display_name(), "");
        assert_eq!(frame.relative_address, 0x42);
        assert_eq!(frame.module_base, 0);

        frame.symbol_name = Some("_ZN3foo3bar17h05af221e174051e9E".to_string());
        assert_eq!(frame.display_name(), "_ZN3foo3bar17h05af221e174051e9E");
        frame.demangled_name = Some("foo::bar".to_string());
        assert_eq!(frame.display_name(), "foo::bar");
    }
}
