//! Host allocator entry for escaping allocations.
//!
//! Record and array allocations must be heap-backed because they can
//! outlive the function that made them (stored into a field that is
//! read after return). Nothing is ever freed; the process is
//! short-lived and v1 has no deallocation operation.

use std::alloc::{alloc_zeroed, Layout};
use std::ffi::c_void;

/// Allocate `size` zeroed bytes, 8-aligned. Returns null on a
/// non-positive size or allocator failure.
#[no_mangle]
pub extern "C" fn rt_alloc(size: i64) -> *mut c_void {
    if size <= 0 {
        return std::ptr::null_mut();
    }
    let layout = match Layout::from_size_align(size as usize, 8) {
        Ok(l) => l,
        Err(_) => return std::ptr::null_mut(),
    };
    unsafe { alloc_zeroed(layout) as *mut c_void }
}
