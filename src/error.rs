//! Typed errors for the compilation pipeline.
//!
//! Every stage returns `Result<T, FusionError>`; the first failure
//! short-circuits the pipeline and becomes the process diagnostic.

use std::error::Error as StdError;
use std::fmt;

/// One error kind per pipeline stage.
///
/// Lexing has no error kind of its own: malformed input produces token
/// streams the parser rejects with a positioned `Parse` error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FusionError {
    /// Parser rejection, with the 1-based position of the offending token.
    Parse {
        message: String,
        line: usize,
        column: usize,
    },
    /// Import resolution or merge failure.
    Import { message: String },
    /// Semantic analysis failure.
    Semantic { message: String },
    /// IR emission failure.
    Codegen { message: String },
    /// Module verification, JIT construction, or entry lookup failure.
    Jit { message: String },
}

impl FusionError {
    pub fn parse(message: impl Into<String>, line: usize, column: usize) -> Self {
        FusionError::Parse {
            message: message.into(),
            line,
            column,
        }
    }

    pub fn import(message: impl Into<String>) -> Self {
        FusionError::Import {
            message: message.into(),
        }
    }

    pub fn semantic(message: impl Into<String>) -> Self {
        FusionError::Semantic {
            message: message.into(),
        }
    }

    pub fn codegen(message: impl Into<String>) -> Self {
        FusionError::Codegen {
            message: message.into(),
        }
    }

    pub fn jit(message: impl Into<String>) -> Self {
        FusionError::Jit {
            message: message.into(),
        }
    }

    /// Human-readable description, as printed on the diagnostic line.
    pub fn description(&self) -> String {
        match self {
            FusionError::Parse {
                message,
                line,
                column,
            } => format!("parse error at {}:{} {}", line, column, message),
            FusionError::Import { message } => message.clone(),
            FusionError::Semantic { message } => message.clone(),
            FusionError::Codegen { message } => format!("codegen failed: {}", message),
            FusionError::Jit { message } => message.clone(),
        }
    }
}

impl fmt::Display for FusionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl StdError for FusionError {}

impl From<String> for FusionError {
    fn from(msg: String) -> Self {
        FusionError::Semantic { message: msg }
    }
}

impl From<&str> for FusionError {
    fn from(msg: &str) -> Self {
        FusionError::Semantic {
            message: msg.to_string(),
        }
    }
}
