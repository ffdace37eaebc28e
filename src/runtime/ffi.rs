//! FFI trampoline for emitted code.
//!
//! `rt_ffi_sig_create` builds (and caches) a libffi call interface from
//! the primitive kind encoding; `rt_ffi_call` invokes a raw function
//! pointer through it. The argument buffer holds one 8-byte slot per
//! argument in declaration order: doubles as doubles, floats in the
//! low half of their slot, pointers and integers as 64-bit integers.
//! The return buffer is 8 bytes, read back in the declared return type.

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CString};

use libffi::middle::{Arg, Cif, CodePtr, Type};

const MAX_ARGS: usize = 32;
const CACHE_MAX: usize = 64;
const SLOT_SIZE: usize = 8;

/// FFI type kind encoding shared with the emitter.
const KIND_VOID: i32 = 0;
const KIND_PTR: i32 = 5;

struct SigEntry {
    cif: Cif,
    return_kind: i32,
    arg_kinds: Vec<i32>,
}

thread_local! {
    static SIG_CACHE: RefCell<Vec<Box<SigEntry>>> = const { RefCell::new(Vec::new()) };
    static FFI_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_error(message: &str) {
    let stored =
        CString::new(message).unwrap_or_else(|_| CString::new("ffi error").unwrap());
    FFI_ERROR.with(|cell| *cell.borrow_mut() = Some(stored));
}

fn clear_error() {
    FFI_ERROR.with(|cell| *cell.borrow_mut() = None);
}

fn kind_valid(kind: i32) -> bool {
    (KIND_VOID..=KIND_PTR).contains(&kind)
}

fn kind_to_type(kind: i32) -> Type {
    match kind {
        1 => Type::i32(),
        2 => Type::i64(),
        3 => Type::f32(),
        4 => Type::f64(),
        5 => Type::pointer(),
        _ => Type::void(),
    }
}

/// Build or fetch a cached FFI signature. Returns null with the error
/// cell set on an invalid kind, too many arguments, or a full cache.
///
/// # Safety
/// `arg_kinds` must point to `nargs` readable `i32`s (or be null when
/// `nargs` is zero).
#[no_mangle]
pub unsafe extern "C" fn rt_ffi_sig_create(
    return_kind: i32,
    nargs: i32,
    arg_kinds: *const i32,
) -> *mut c_void {
    clear_error();

    if !kind_valid(return_kind) {
        set_error("rt_ffi_sig_create: unsupported return type");
        return std::ptr::null_mut();
    }
    if nargs < 0 || nargs as usize > MAX_ARGS {
        set_error("rt_ffi_sig_create: too many arguments");
        return std::ptr::null_mut();
    }
    if arg_kinds.is_null() && nargs > 0 {
        set_error("rt_ffi_sig_create: null arg_kinds");
        return std::ptr::null_mut();
    }
    let kinds: Vec<i32> = if nargs == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(arg_kinds, nargs as usize).to_vec()
    };
    if kinds.iter().any(|k| !kind_valid(*k)) {
        set_error("rt_ffi_sig_create: unsupported argument type");
        return std::ptr::null_mut();
    }

    SIG_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        for entry in cache.iter() {
            if entry.return_kind == return_kind && entry.arg_kinds == kinds {
                return entry.as_ref() as *const SigEntry as *mut c_void;
            }
        }
        if cache.len() >= CACHE_MAX {
            set_error("rt_ffi_sig_create: signature cache full");
            return std::ptr::null_mut();
        }
        let cif = Cif::new(
            kinds.iter().map(|k| kind_to_type(*k)),
            kind_to_type(return_kind),
        );
        cache.push(Box::new(SigEntry {
            cif,
            return_kind,
            arg_kinds: kinds,
        }));
        cache.last().unwrap().as_ref() as *const SigEntry as *mut c_void
    })
}

/// Invoke `fnptr` through a signature from `rt_ffi_sig_create`,
/// dispatching on the declared return kind to a typed `Cif::call`.
/// Returns 0 on success, nonzero with the error cell set otherwise.
///
/// # Safety
/// `sig` must come from `rt_ffi_sig_create`; `fnptr` must be callable
/// with that signature; `args_buf` must hold one 8-byte slot per
/// argument; `ret_buf` must be 8 writable bytes for non-void returns.
#[no_mangle]
pub unsafe extern "C" fn rt_ffi_call(
    sig: *mut c_void,
    fnptr: *mut c_void,
    args_buf: *const c_void,
    ret_buf: *mut c_void,
) -> i32 {
    clear_error();

    if sig.is_null() {
        set_error("rt_ffi_call: null signature");
        return -1;
    }
    if fnptr.is_null() {
        set_error("rt_ffi_call: null function pointer");
        return -1;
    }
    let entry = &*(sig as *const SigEntry);
    let nargs = entry.arg_kinds.len();
    if nargs > 0 && args_buf.is_null() {
        set_error("rt_ffi_call: null args_buf");
        return -1;
    }
    if entry.return_kind != KIND_VOID && ret_buf.is_null() {
        set_error("rt_ffi_call: null ret_buf for non-void return");
        return -1;
    }

    // One Arg per slot, viewed in the declared kind. Every argument
    // lives in the low bytes of its slot, so the slot address is the
    // argument address for every kind.
    let base = args_buf as *const u8;
    let mut args: Vec<Arg> = Vec::with_capacity(nargs);
    for (i, kind) in entry.arg_kinds.iter().enumerate() {
        let slot = base.add(i * SLOT_SIZE);
        args.push(match *kind {
            1 => Arg::new(&*(slot as *const i32)),
            3 => Arg::new(&*(slot as *const f32)),
            4 => Arg::new(&*(slot as *const f64)),
            5 => Arg::new(&*(slot as *const *const c_void)),
            _ => Arg::new(&*(slot as *const i64)),
        });
    }

    let code_ptr = CodePtr(fnptr);
    match entry.return_kind {
        1 => {
            let r: i32 = entry.cif.call(code_ptr, &args);
            *(ret_buf as *mut i32) = r;
        }
        2 => {
            let r: i64 = entry.cif.call(code_ptr, &args);
            *(ret_buf as *mut i64) = r;
        }
        3 => {
            let r: f32 = entry.cif.call(code_ptr, &args);
            *(ret_buf as *mut f32) = r;
        }
        4 => {
            let r: f64 = entry.cif.call(code_ptr, &args);
            *(ret_buf as *mut f64) = r;
        }
        5 => {
            let r: *const c_void = entry.cif.call(code_ptr, &args);
            *(ret_buf as *mut *const c_void) = r;
        }
        _ => {
            entry.cif.call::<()>(code_ptr, &args);
        }
    }
    0
}

/// Last FFI error, or null if the previous operation succeeded.
#[no_mangle]
pub extern "C" fn rt_ffi_error_last() -> *const c_char {
    FFI_ERROR.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(std::ptr::null())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_return_kind_rejected() {
        let sig = unsafe { rt_ffi_sig_create(99, 0, std::ptr::null()) };
        assert!(sig.is_null());
        assert!(!rt_ffi_error_last().is_null());
    }

    #[test]
    fn test_null_arg_kinds_rejected() {
        let sig = unsafe { rt_ffi_sig_create(2, 2, std::ptr::null()) };
        assert!(sig.is_null());
    }

    #[test]
    fn test_signatures_are_cached() {
        let kinds = [2i32, 4];
        let a = unsafe { rt_ffi_sig_create(2, 2, kinds.as_ptr()) };
        let b = unsafe { rt_ffi_sig_create(2, 2, kinds.as_ptr()) };
        assert!(!a.is_null());
        assert_eq!(a, b);
        // A different signature gets a different entry.
        let c = unsafe { rt_ffi_sig_create(4, 2, kinds.as_ptr()) };
        assert!(!c.is_null());
        assert_ne!(a, c);
    }

    #[test]
    fn test_call_null_fnptr_rejected() {
        let sig = unsafe { rt_ffi_sig_create(0, 0, std::ptr::null()) };
        let rc = unsafe {
            rt_ffi_call(
                sig,
                std::ptr::null_mut(),
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        assert_ne!(rc, 0);
        assert!(!rt_ffi_error_last().is_null());
    }

    #[test]
    fn test_call_abs_through_trampoline() {
        extern "C" {
            fn abs(n: std::ffi::c_int) -> std::ffi::c_int;
        }
        let kinds = [1i32];
        let sig = unsafe { rt_ffi_sig_create(1, 1, kinds.as_ptr()) };
        assert!(!sig.is_null());

        let args: [i64; 1] = [-42];
        let mut ret: i64 = 0;
        let rc = unsafe {
            rt_ffi_call(
                sig,
                abs as *mut c_void,
                args.as_ptr() as *const c_void,
                &mut ret as *mut i64 as *mut c_void,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(ret as i32, 42);
    }

    #[test]
    fn test_call_double_function() {
        extern "C" fn double_it(x: f64) -> f64 {
            x * 2.0
        }
        let kinds = [4i32];
        let sig = unsafe { rt_ffi_sig_create(4, 1, kinds.as_ptr()) };
        assert!(!sig.is_null());

        let mut args = [0u8; 8];
        args.copy_from_slice(&3.5f64.to_le_bytes());
        let mut ret = [0u8; 8];
        let rc = unsafe {
            rt_ffi_call(
                sig,
                double_it as *mut c_void,
                args.as_ptr() as *const c_void,
                ret.as_mut_ptr() as *mut c_void,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(f64::from_le_bytes(ret), 7.0);
    }
}
