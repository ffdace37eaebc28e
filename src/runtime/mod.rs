//! The runtime ABI consumed by emitted code.
//!
//! Every entry here is a `#[no_mangle] pub extern "C"` function with C
//! linkage; the JIT compiler registers each symbol on the `JITBuilder`
//! so emitted calls resolve to these addresses. State is confined to
//! per-thread cells (the loader and FFI last-error buffers, the
//! `to_str` scratch buffer) and exposed only through read interfaces.
//!
//! Heap memory handed out by `rt_alloc` and library handles opened by
//! `rt_dlopen` live for the rest of the process; v1 has no
//! deallocation.

pub mod alloc;
pub mod dl;
pub mod ffi;
pub mod io;

pub use alloc::rt_alloc;
pub use dl::{rt_dlerror_last, rt_dlopen, rt_dlsym};
pub use ffi::{rt_ffi_call, rt_ffi_error_last, rt_ffi_sig_create};
pub use io::{
    rt_close, rt_eof_file, rt_from_str_f64, rt_from_str_i64, rt_line_count_file, rt_open,
    rt_panic, rt_print_cstring, rt_print_f64, rt_print_i64, rt_read_line, rt_read_line_file,
    rt_to_str_f64, rt_to_str_i64, rt_write_file_f64, rt_write_file_i64, rt_write_file_ptr,
};
