//! Printing, console input, number formatting, and file handles.
//!
//! Strings cross the boundary as NUL-terminated pointers. Lines read
//! from stdin or files are leaked; the process is short-lived and v1
//! never reclaims runtime allocations. `rt_to_str_*` reuse one
//! per-thread scratch buffer, valid until the next conversion.

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};

fn stream_is_stderr(stream: i64) -> bool {
    stream == 1
}

unsafe fn cstr_or<'a>(ptr: *const c_char, fallback: &'a str) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        return std::borrow::Cow::Borrowed(fallback);
    }
    CStr::from_ptr(ptr).to_string_lossy()
}

/// Leak a string as a NUL-terminated C string.
fn leak_cstring(s: String) -> *mut c_char {
    let c = CString::new(s).unwrap_or_else(|_| CString::new("").unwrap());
    c.into_raw()
}

// ----------------------------------------------------------------------
// Printing
// ----------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn rt_print_i64(value: i64, stream: i64) {
    if stream_is_stderr(stream) {
        eprintln!("{}", value);
    } else {
        println!("{}", value);
    }
}

#[no_mangle]
pub extern "C" fn rt_print_f64(value: f64, stream: i64) {
    if stream_is_stderr(stream) {
        eprintln!("{}", value);
    } else {
        println!("{}", value);
    }
}

/// # Safety
/// `s` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rt_print_cstring(s: *const c_char, stream: i64) {
    let text = cstr_or(s, "(null)");
    if stream_is_stderr(stream) {
        eprintln!("{}", text);
    } else {
        println!("{}", text);
    }
}

// ----------------------------------------------------------------------
// Console input
// ----------------------------------------------------------------------

/// Read one line from stdin with the trailing newline trimmed. Returns
/// an empty string on end of input.
#[no_mangle]
pub extern "C" fn rt_read_line() -> *mut c_char {
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    trim_newline(&mut line);
    leak_cstring(line)
}

fn trim_newline(line: &mut String) {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
}

// ----------------------------------------------------------------------
// Number <-> string
// ----------------------------------------------------------------------

thread_local! {
    static TO_STR_BUF: RefCell<CString> = RefCell::new(CString::new("").unwrap());
}

fn to_str(text: String) -> *const c_char {
    TO_STR_BUF.with(|buf| {
        let stored = CString::new(text).unwrap_or_else(|_| CString::new("").unwrap());
        *buf.borrow_mut() = stored;
        buf.borrow().as_ptr()
    })
}

#[no_mangle]
pub extern "C" fn rt_to_str_i64(value: i64) -> *const c_char {
    to_str(value.to_string())
}

#[no_mangle]
pub extern "C" fn rt_to_str_f64(value: f64) -> *const c_char {
    to_str(value.to_string())
}

/// Base-10 parse; 0 on invalid input.
///
/// # Safety
/// `s` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rt_from_str_i64(s: *const c_char) -> i64 {
    cstr_or(s, "").trim().parse().unwrap_or(0)
}

/// # Safety
/// `s` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rt_from_str_f64(s: *const c_char) -> f64 {
    cstr_or(s, "").trim().parse().unwrap_or(0.0)
}

// ----------------------------------------------------------------------
// File handles
// ----------------------------------------------------------------------

/// A file opened by emitted code. The reader is buffered so
/// `rt_read_line_file` can pull individual lines; `rt_line_count_file`
/// re-reads the path so it does not disturb the cursor.
struct FileHandle {
    path: String,
    reader: Option<BufReader<File>>,
    writer: Option<File>,
    eof: bool,
}

/// `fopen(path, mode)` with modes `r`, `w`, and `a`. Returns null on
/// failure or an unknown mode.
///
/// # Safety
/// Both arguments must be null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn rt_open(path: *const c_char, mode: *const c_char) -> *mut c_void {
    let path = cstr_or(path, "").into_owned();
    let mode = cstr_or(mode, "").into_owned();
    if path.is_empty() {
        return std::ptr::null_mut();
    }

    let handle = match mode.as_str() {
        "r" => match File::open(&path) {
            Ok(f) => FileHandle {
                path,
                reader: Some(BufReader::new(f)),
                writer: None,
                eof: false,
            },
            Err(_) => return std::ptr::null_mut(),
        },
        "w" => match File::create(&path) {
            Ok(f) => FileHandle {
                path,
                reader: None,
                writer: Some(f),
                eof: false,
            },
            Err(_) => return std::ptr::null_mut(),
        },
        "a" => match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => FileHandle {
                path,
                reader: None,
                writer: Some(f),
                eof: false,
            },
            Err(_) => return std::ptr::null_mut(),
        },
        _ => return std::ptr::null_mut(),
    };
    Box::into_raw(Box::new(handle)) as *mut c_void
}

/// # Safety
/// `handle` must be null or a live `rt_open` result; it is consumed.
#[no_mangle]
pub unsafe extern "C" fn rt_close(handle: *mut c_void) {
    if !handle.is_null() {
        drop(Box::from_raw(handle as *mut FileHandle));
    }
}

/// Read one line with the newline trimmed; empty string at EOF.
///
/// # Safety
/// `handle` must be null or a live `rt_open` result.
#[no_mangle]
pub unsafe extern "C" fn rt_read_line_file(handle: *mut c_void) -> *mut c_char {
    if handle.is_null() {
        return leak_cstring(String::new());
    }
    let fh = &mut *(handle as *mut FileHandle);
    let Some(reader) = fh.reader.as_mut() else {
        return leak_cstring(String::new());
    };
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) | Err(_) => {
            fh.eof = true;
            leak_cstring(String::new())
        }
        Ok(_) => {
            trim_newline(&mut line);
            leak_cstring(line)
        }
    }
}

/// # Safety
/// `handle` must be null or a live `rt_open` result.
#[no_mangle]
pub unsafe extern "C" fn rt_eof_file(handle: *mut c_void) -> i64 {
    if handle.is_null() {
        return 1;
    }
    let fh = &mut *(handle as *mut FileHandle);
    if fh.eof {
        return 1;
    }
    // A readable handle is at EOF when its buffer refill comes back empty.
    if let Some(reader) = fh.reader.as_mut() {
        match reader.fill_buf() {
            Ok(buf) if buf.is_empty() => {
                fh.eof = true;
                1
            }
            Ok(_) => 0,
            Err(_) => 1,
        }
    } else {
        0
    }
}

unsafe fn write_line(handle: *mut c_void, text: &str) {
    if handle.is_null() {
        return;
    }
    let fh = &mut *(handle as *mut FileHandle);
    if let Some(writer) = fh.writer.as_mut() {
        let _ = writeln!(writer, "{}", text);
    }
}

/// # Safety
/// `handle` must be null or a live `rt_open` result.
#[no_mangle]
pub unsafe extern "C" fn rt_write_file_i64(handle: *mut c_void, value: i64) {
    write_line(handle, &value.to_string());
}

/// # Safety
/// `handle` must be null or a live `rt_open` result.
#[no_mangle]
pub unsafe extern "C" fn rt_write_file_f64(handle: *mut c_void, value: f64) {
    write_line(handle, &value.to_string());
}

/// # Safety
/// `handle` must be null or a live `rt_open` result; `value` must be
/// null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rt_write_file_ptr(handle: *mut c_void, value: *const c_char) {
    let text = cstr_or(value, "").into_owned();
    write_line(handle, &text);
}

/// Total line count of the handle's file, counted from a fresh read so
/// the handle's own cursor is untouched.
///
/// # Safety
/// `handle` must be null or a live `rt_open` result.
#[no_mangle]
pub unsafe extern "C" fn rt_line_count_file(handle: *mut c_void) -> i64 {
    if handle.is_null() {
        return 0;
    }
    let fh = &*(handle as *const FileHandle);
    match File::open(&fh.path) {
        Ok(f) => BufReader::new(f).lines().count() as i64,
        Err(_) => 0,
    }
}

// ----------------------------------------------------------------------
// Panic
// ----------------------------------------------------------------------

/// Print a panic message to stderr and abort the process. Called from
/// emitted code for bounds failures, null function pointers, and FFI
/// setup errors.
///
/// # Safety
/// `msg` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rt_panic(msg: *const c_char) -> ! {
    if msg.is_null() {
        eprintln!("fusion panic");
    } else {
        eprintln!("fusion panic: {}", cstr_or(msg, ""));
    }
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("fusion-io-{}-{}", std::process::id(), name))
            .to_string_lossy()
            .into_owned()
    }

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn test_to_str_i64_round_trip() {
        let p = rt_to_str_i64(-12345);
        let text = unsafe { CStr::from_ptr(p) }.to_str().unwrap();
        assert_eq!(text, "-12345");
        assert_eq!(unsafe { rt_from_str_i64(p) }, -12345);
    }

    #[test]
    fn test_to_str_f64_formats_whole_numbers_bare() {
        let p = rt_to_str_f64(7.0);
        let text = unsafe { CStr::from_ptr(p) }.to_str().unwrap();
        assert_eq!(text, "7");
    }

    #[test]
    fn test_from_str_invalid_is_zero() {
        let s = c("not a number");
        assert_eq!(unsafe { rt_from_str_i64(s.as_ptr()) }, 0);
        assert_eq!(unsafe { rt_from_str_f64(s.as_ptr()) }, 0.0);
        assert_eq!(unsafe { rt_from_str_i64(std::ptr::null()) }, 0);
    }

    #[test]
    fn test_from_str_f64_parses() {
        let s = c("2.5");
        assert_eq!(unsafe { rt_from_str_f64(s.as_ptr()) }, 2.5);
    }

    #[test]
    fn test_file_write_then_read_lines() {
        let path = scratch_path("lines.txt");
        let cpath = c(&path);

        unsafe {
            let h = rt_open(cpath.as_ptr(), c("w").as_ptr());
            assert!(!h.is_null());
            rt_write_file_i64(h, 10);
            rt_write_file_f64(h, 2.5);
            rt_write_file_ptr(h, c("hello").as_ptr());
            rt_close(h);

            let h = rt_open(cpath.as_ptr(), c("r").as_ptr());
            assert!(!h.is_null());
            assert_eq!(rt_line_count_file(h), 3);
            assert_eq!(rt_eof_file(h), 0);

            let l1 = CStr::from_ptr(rt_read_line_file(h)).to_str().unwrap();
            let l2 = CStr::from_ptr(rt_read_line_file(h)).to_str().unwrap();
            let l3 = CStr::from_ptr(rt_read_line_file(h)).to_str().unwrap();
            assert_eq!((l1, l2, l3), ("10", "2.5", "hello"));
            assert_eq!(rt_eof_file(h), 1);
            rt_close(h);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_missing_file_is_null() {
        let h = unsafe { rt_open(c("/nonexistent/nope.txt").as_ptr(), c("r").as_ptr()) };
        assert!(h.is_null());
    }

    #[test]
    fn test_open_unknown_mode_is_null() {
        let path = scratch_path("mode.txt");
        let h = unsafe { rt_open(c(&path).as_ptr(), c("x").as_ptr()) };
        assert!(h.is_null());
    }
}
