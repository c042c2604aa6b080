//! Linker: concatenate function blobs after the main body and resolve
//! `PUSHL` operands from table indices to absolute addresses.
//!
//! The main body always ends with `FIN`, so every blob start is at
//! least 1. That keeps address 0 free for the sentinel closure that the
//! type-check idiom pushes with `PUSHL -1`.

use tracing::debug;

use crate::compiler::CompiledForms;
use crate::program::{Op, Program};

/// Link-time failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// A `PUSHL` operand that names no function table entry.
    DanglingFunction(i64),
    /// A blob would start at the address reserved for the sentinel
    /// closure.
    ReservedAddress,
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DanglingFunction(k) => write!(f, "PUSHL references unknown function {k}"),
            Self::ReservedAddress => write!(f, "function blob would start at address 0"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Produce the final executable program. Each `PUSHL` operand is
/// resolved exactly once, so a start address that happens to collide
/// with a later table index can never be relocated twice.
pub fn link(compiled: CompiledForms) -> Result<Program, LinkError> {
    let CompiledForms { main, functions } = compiled;
    let mut ops = main;
    let mut starts = Vec::with_capacity(functions.len());
    for func in functions {
        starts.push(ops.len());
        ops.extend(func);
    }
    if starts.first() == Some(&0) {
        return Err(LinkError::ReservedAddress);
    }
    for op in &mut ops {
        if let Op::PushL(k) = *op {
            if k == -1 {
                continue;
            }
            let start = usize::try_from(k)
                .ok()
                .and_then(|k| starts.get(k))
                .ok_or(LinkError::DanglingFunction(k))?;
            *op = Op::PushL(*start as i64);
        }
    }
    debug!(target: "cellvm::linker", len = ops.len(), functions = starts.len(), "linked");
    Ok(Program::new(ops))
}
