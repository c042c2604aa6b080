//! A bytecode compiler and stack virtual machine for a small Lisp.
//!
//! The toolchain is a two-stage pipe. The compiler lowers S-expressions
//! into a line-oriented bytecode text (one mnemonic per line); the VM
//! decodes that text and executes it over a tagged-cell runtime: a
//! fixed operand stack, a two-space heap with a copying collector, and
//! environments built from `(name . value)` pairs threaded through
//! heap cells. An optional Cranelift JIT (feature `jit`) translates
//! the same programs to native code over the same live runtime state.
//!
//! ```
//! use cellvm::{compile_source, Vm, VmConfig};
//!
//! let program = compile_source("(print (+ 8 (- 10 3)))", false).unwrap();
//! let mut vm = Vm::new(&VmConfig::default());
//! vm.capture_output();
//! vm.run(&program).unwrap();
//! assert_eq!(vm.take_output(), b"15");
//! ```

pub mod cell;
pub mod compiler;
#[cfg(feature = "jit")]
pub mod jit;
pub mod linker;
pub mod optimizer;
pub mod program;
pub mod sexpr;
pub mod vm;

pub use cell::{Cell, HeapIx, Sym, Tag};
pub use compiler::{CompileError, CompiledForms, Compiler};
pub use linker::{link, LinkError};
pub use optimizer::{optimize, OptimizerStats};
pub use program::{DecodeError, Op, Program, ProgramError};
pub use sexpr::{parse_forms, ParseError, SExpr};
pub use vm::{Vm, VmConfig, VmError, VmResult, VmStats};

use std::fmt;

/// Any failure on the source-to-bytecode path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    Parse(ParseError),
    Compile(CompileError),
    Link(LinkError),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "{e}"),
            Self::Compile(e) => write!(f, "{e}"),
            Self::Link(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<ParseError> for SourceError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<CompileError> for SourceError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

impl From<LinkError> for SourceError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

/// Compile source text all the way to an executable program:
/// parse, lower, optionally run the peephole passes, then link.
pub fn compile_source(source: &str, optimize_blobs: bool) -> Result<Program, SourceError> {
    let forms = parse_forms(source)?;
    let mut compiled = Compiler::new().compile(&forms)?;
    if optimize_blobs {
        optimize(&mut compiled);
    }
    Ok(link(compiled)?)
}
