//! IR emission and JIT execution.
//!
//! ## Architecture
//!
//! ```text
//! Program -> JitCompiler -> Cranelift IR -> native code -> JitCode
//! ```
//!
//! `JitCompiler` owns the Cranelift `JITModule`, binds every runtime
//! symbol at construction, and emits one backend function per user
//! function plus the exported entry `fusion_main`, which loads the
//! declared libraries and runs the top-level items in order.
//! `FunctionTranslator` lowers one function body at a time against the
//! `FunctionBuilder` API. `JitCode` owns the finalized module and the
//! entry pointer.
//!
//! A per-thread last-error cell records the message of the most recent
//! emission failure; `codegen_last_error` is its read interface.

mod code;
mod compiler;
mod translate;

pub use code::JitCode;
pub use compiler::JitCompiler;

use std::cell::RefCell;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub(crate) fn set_last_error(message: &str) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(message.to_string()));
}

/// Message of the most recent emission failure on this thread, if any.
pub fn codegen_last_error() -> Option<String> {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}
