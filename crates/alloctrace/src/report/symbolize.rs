//! In-process symbol resolution.
//!
//! `dladdr` covers everything the dynamic linker knows about; static
//! functions without export entries come back empty and are printed as
//! unknown code. Rust symbol names are demangled before display.

use core::ffi::{c_void, CStr};

pub struct Symbol {
    pub name: String,
    /// Offset of the address from the symbol start.
    pub offset: usize,
    pub library: String,
}

pub trait Symbolizer {
    /// Resolve one instruction address. `None` means the address belongs
    /// to no object the dynamic linker knows about.
    fn symbolize(&self, addr: usize) -> Option<Symbol>;
}

pub struct DladdrSymbolizer;

impl Symbolizer for DladdrSymbolizer {
    fn symbolize(&self, addr: usize) -> Option<Symbol> {
        let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
        if unsafe { libc::dladdr(addr as *const c_void, &mut info) } == 0 {
            return None;
        }

        let library = if info.dli_fname.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(info.dli_fname) }
                .to_string_lossy()
                .into_owned()
        };

        let (name, offset) = if info.dli_sname.is_null() {
            (String::new(), addr.wrapping_sub(info.dli_fbase as usize))
        } else {
            let raw = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
            (
                rustc_demangle::demangle(&raw).to_string(),
                addr.wrapping_sub(info.dli_saddr as usize),
            )
        };

        Some(Symbol {
            name,
            offset,
            library,
        })
    }
}

/// Render one frame the way the report prints it and the filter sees it:
/// `symbol + 0xoffset  library`, or `<unknown code>`.
pub fn format_frame(symbolizer: &dyn Symbolizer, addr: usize) -> String {
    match symbolizer.symbolize(addr) {
        Some(sym) if !sym.name.is_empty() => {
            format!("{} + {:#x}  {}", sym.name, sym.offset, sym.library)
        }
        Some(sym) if !sym.library.is_empty() => {
            format!("<unknown code>  {}", sym.library)
        }
        _ => "<unknown code>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_libc_function() {
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"strlen".as_ptr()) } as usize;
        assert_ne!(addr, 0);
        let sym = DladdrSymbolizer
            .symbolize(addr)
            .expect("strlen should resolve");
        assert!(sym.name.contains("strlen"), "name {}", sym.name);
        assert!(sym.library.contains("libc"), "library {}", sym.library);
    }

    #[test]
    fn junk_addresses_fall_back_to_unknown() {
        let line = format_frame(&DladdrSymbolizer, 0x10);
        assert!(line.contains("<unknown code>"), "got {line}");
    }

    struct Canned;
    impl Symbolizer for Canned {
        fn symbolize(&self, addr: usize) -> Option<Symbol> {
            (addr == 0x1000).then(|| Symbol {
                name: "site_a".into(),
                offset: 0x20,
                library: "/lib/libdemo.so".into(),
            })
        }
    }

    #[test]
    fn frame_format_is_stable() {
        assert_eq!(
            format_frame(&Canned, 0x1000),
            "site_a + 0x20  /lib/libdemo.so"
        );
        assert_eq!(format_frame(&Canned, 0x2000), "<unknown code>");
    }
}
