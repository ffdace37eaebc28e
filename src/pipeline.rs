//! End-to-end compilation pipeline.
//!
//! Each stage consumes the previous stage's output and the first error
//! short-circuits:
//!
//! ```text
//! source -> lex -> parse -> resolve imports -> analyze -> emit -> run
//! ```

use std::path::Path;

use crate::ast::Program;
use crate::error::FusionError;
use crate::imports::resolve_imports;
use crate::jit::{JitCode, JitCompiler};
use crate::lexer::lex;
use crate::parser::parse;
use crate::sema::analyze;

/// Front half of the pipeline: source text to an analyzed program.
/// `path` anchors import resolution at the source file's directory.
pub fn compile_source(source: &str, path: &Path) -> Result<Program, FusionError> {
    let tokens = lex(source);
    let mut program = parse(&tokens)?;
    resolve_imports(path, &mut program)?;
    analyze(&mut program)?;
    Ok(program)
}

/// Back half: emit an analyzed program and finalize to executable code.
pub fn compile_jit(program: &Program) -> Result<JitCode, FusionError> {
    JitCompiler::new()?.compile(program)
}

/// Compile and execute one file. Returns after the program's entry
/// function runs to completion; runtime panics abort the process
/// before this returns.
pub fn run_file(path: &Path) -> Result<(), FusionError> {
    let source = std::fs::read_to_string(path)
        .map_err(|_| FusionError::import(format!("cannot open '{}'", path.display())))?;
    let program = compile_source(&source, path)?;
    let code = compile_jit(&program)?;
    unsafe { code.run() };
    Ok(())
}
