//! # Fusion: an ahead-of-JIT compiler for a small systems language
//!
//! Fusion is a statically-typed source language whose signature feature
//! is a first-class C FFI: programs declare shared libraries and their
//! entry points, describe C-compatible records, manage memory through
//! typed allocations, and pass function pointers as values.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//!
//! fusion::run_file(Path::new("examples.fusion")).unwrap();
//! ```
//!
//! ## Architecture
//!
//! The pipeline is strictly one-way:
//!
//! 1. **Lexer**: byte stream to tokens with source positions
//! 2. **Parser**: tokens to the untyped program tree
//! 3. **Imports**: transitive library loading and merging
//! 4. **Layout**: C-ABI record layout
//! 5. **Sema**: type checking and indirect-call signature recovery
//! 6. **JIT**: Cranelift IR emission and native execution against the
//!    Rust runtime (printing, string conversion, file I/O, dynamic
//!    loading, and the libffi trampoline)

pub mod ast;
pub mod error;
pub mod imports;
pub mod jit;
pub mod layout;
pub mod lexer;
pub mod parser;
pub mod pipeline;
pub mod runtime;
pub mod sema;

pub use error::FusionError;
pub use imports::resolve_imports;
pub use jit::{codegen_last_error, JitCode, JitCompiler};
pub use lexer::lex;
pub use parser::parse;
pub use pipeline::{compile_jit, compile_source, run_file};
pub use sema::analyze;
