//! Dynamic library loading for emitted code.
//!
//! Wraps `libloading` behind the C-linkage entries the emitter lowers
//! against. A per-thread last-error cell mirrors `dlerror`: it is
//! cleared at the start of every operation and readable through
//! `rt_dlerror_last` until the next one.

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};

thread_local! {
    static DL_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_error(message: String) {
    let stored = CString::new(message).unwrap_or_else(|_| CString::new("dl error").unwrap());
    DL_ERROR.with(|cell| *cell.borrow_mut() = Some(stored));
}

fn clear_error() {
    DL_ERROR.with(|cell| *cell.borrow_mut() = None);
}

unsafe fn cstr_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Load a shared library. Returns an opaque handle, or null with the
/// loader's message stored in the error cell. Handles are never
/// released; loaded libraries live for the process lifetime.
///
/// # Safety
/// `path` must be null or point to a NUL-terminated string. Loading a
/// library runs its initializers.
#[no_mangle]
pub unsafe extern "C" fn rt_dlopen(path: *const c_char) -> *mut c_void {
    clear_error();
    let Some(path) = cstr_arg(path) else {
        set_error("rt_dlopen: null or invalid path".to_string());
        return std::ptr::null_mut();
    };
    match libloading::Library::new(path) {
        Ok(lib) => Box::into_raw(Box::new(lib)) as *mut c_void,
        Err(e) => {
            set_error(format!("{}: {}", path, e));
            std::ptr::null_mut()
        }
    }
}

/// Resolve a symbol in a handle returned by `rt_dlopen`. Returns null
/// with the error cell set when the symbol is missing.
///
/// # Safety
/// `handle` must be a live `rt_dlopen` result; `symbol_name` must be
/// null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rt_dlsym(handle: *mut c_void, symbol_name: *const c_char) -> *mut c_void {
    clear_error();
    if handle.is_null() {
        set_error("rt_dlsym: null library handle".to_string());
        return std::ptr::null_mut();
    }
    let Some(name) = cstr_arg(symbol_name) else {
        set_error("rt_dlsym: null or invalid symbol name".to_string());
        return std::ptr::null_mut();
    };
    let lib = &*(handle as *const libloading::Library);
    match lib.get::<*mut c_void>(name.as_bytes()) {
        Ok(sym) => *sym,
        Err(e) => {
            set_error(format!("{}: {}", name, e));
            std::ptr::null_mut()
        }
    }
}

/// Last loader error, or null if the previous operation succeeded. The
/// pointer stays valid until the next loader call on this thread.
#[no_mangle]
pub extern "C" fn rt_dlerror_last() -> *const c_char {
    DL_ERROR.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(std::ptr::null())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(path: &str) -> *mut c_void {
        let c = CString::new(path).unwrap();
        unsafe { rt_dlopen(c.as_ptr()) }
    }

    #[test]
    fn test_missing_library_sets_error() {
        let h = open("/nonexistent/library.so");
        assert!(h.is_null());
        assert!(!rt_dlerror_last().is_null());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_open_libm_and_resolve_cos() {
        let h = open("libm.so.6");
        if h.is_null() {
            return; // no libm on this host; nothing to assert
        }
        assert!(rt_dlerror_last().is_null());
        let name = CString::new("cos").unwrap();
        let sym = unsafe { rt_dlsym(h, name.as_ptr()) };
        assert!(!sym.is_null());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_missing_symbol_sets_error() {
        let h = open("libm.so.6");
        if h.is_null() {
            return;
        }
        let name = CString::new("definitely_not_a_symbol_9f3a").unwrap();
        let sym = unsafe { rt_dlsym(h, name.as_ptr()) };
        assert!(sym.is_null());
        assert!(!rt_dlerror_last().is_null());
    }

    #[test]
    fn test_null_handle_rejected() {
        let name = CString::new("cos").unwrap();
        let sym = unsafe { rt_dlsym(std::ptr::null_mut(), name.as_ptr()) };
        assert!(sym.is_null());
        assert!(!rt_dlerror_last().is_null());
    }
}
