//! Peephole optimizer for compiled function blobs.
//!
//! Two rewrites, applied per function before linking:
//!
//! | Pattern | Replacement | Rationale |
//! |---------|-------------|-----------|
//! | `PUSHCI n; RJZ k; POP` with `n > 0` | (remove) | a constant true predicate never branches |
//! | argument prologue + env lookups | `PUSHFP` reads | arguments are already on the stack |
//!
//! Branch offsets are relative and measured in instructions, so every
//! deletion re-scans the function for branches whose source-to-target
//! interval crosses the edited region and adjusts them; branches
//! entirely before or after the edit are untouched.

use smallvec::SmallVec;
use tracing::debug;

use crate::cell::Sym;
use crate::compiler::{CompiledForms, LOOKUP_LEN};
use crate::program::Op;

/// Instructions removed by each pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizerStats {
    pub cond_removed: usize,
    pub funarg_removed: usize,
}

/// Run both passes over every function blob. The main body is left
/// alone: its only branches belong to `cond` forms whose predicates the
/// fold pass would also see in functions, and the reference pipeline
/// only ever rewrote functions.
pub fn optimize(compiled: &mut CompiledForms) -> OptimizerStats {
    let mut stats = OptimizerStats::default();
    for func in &mut compiled.functions {
        stats.cond_removed += fold_constant_conditions(func);
        stats.funarg_removed += elide_argument_bindings(func);
    }
    debug!(
        target: "cellvm::optimizer",
        cond_removed = stats.cond_removed,
        funarg_removed = stats.funarg_removed,
        "peephole passes done"
    );
    stats
}

/// Delete `count` instructions starting at `start`, retargeting every
/// branch whose interval spans the deleted region.
fn remove_ops(func: &mut Vec<Op>, start: usize, count: usize) {
    let end = start + count;
    let mut fixups: SmallVec<[(usize, i32); 8]> = SmallVec::new();
    for (i, op) in func.iter().enumerate() {
        let Some(d) = op.branch_offset() else {
            continue;
        };
        if i >= start && i < end {
            continue;
        }
        let target = i as i64 + d as i64;
        if i < start && target > start as i64 {
            // forward branch over the deletion shrinks
            fixups.push((i, d - count as i32));
        } else if i >= end && target < start as i64 {
            // backward branch over the deletion shrinks too
            fixups.push((i, d + count as i32));
        }
    }
    for (i, d) in fixups {
        func[i] = func[i].with_branch_offset(d);
    }
    func.drain(start..end);
}

/// Remove `PUSHCI n; RJZ k; POP` triples with `n > 0`: the branch can
/// never be taken and the flag is popped unread.
fn fold_constant_conditions(func: &mut Vec<Op>) -> usize {
    let mut removed = 0;
    let mut i = 2;
    while i < func.len() {
        if matches!(func[i], Op::Pop)
            && matches!(func[i - 1], Op::Rjz(_))
            && matches!(func[i - 2], Op::PushCi(n) if n > 0)
        {
            remove_ops(func, i - 2, 3);
            removed += 3;
            i = 2;
            continue;
        }
        i += 1;
    }
    removed
}

/// One formal-binding group emitted by the lambda prologue.
fn binding_group(window: &[Op]) -> Option<Sym> {
    match window {
        [Op::LoadEnv, Op::PushFs(_), Op::PushS(name), Op::Cons, Op::Cons, Op::StoreEnv] => {
            Some(*name)
        }
        _ => None,
    }
}

/// The full inline symbol-lookup sequence, returning the symbol.
fn lookup_sequence(window: &[Op]) -> Option<Sym> {
    match window {
        [Op::LoadEnv, Op::PushCar, Op::PushCar, Op::Eqsi(name), Op::Rjnz(6), Op::Pop, Op::Pop, Op::Pop, Op::Cdr, Op::Rjmp(-8), Op::Pop, Op::Pop, Op::Cdr, Op::Swap(0), Op::Pop] => {
            Some(*name)
        }
        _ => None,
    }
}

const GROUP_LEN: usize = 6;

/// Rewrite argument access to frame-relative reads.
///
/// When the function never builds a real closure, the prologue groups
/// that bind formals into the environment are deleted outright; a
/// nested closure might capture a formal through the chain, so in that
/// case the bindings stay. Either way, every inline lookup of a formal
/// becomes a single `PUSHFP` read: the binding groups are net-zero on
/// the stack, so frame offsets hold throughout the body.
fn elide_argument_bindings(func: &mut Vec<Op>) -> usize {
    let mut bound: SmallVec<[Sym; 8]> = SmallVec::new();
    for i in 0..func.len().saturating_sub(GROUP_LEN - 1) {
        if let Some(name) = binding_group(&func[i..i + GROUP_LEN]) {
            bound.push(name);
        }
    }
    if bound.is_empty() {
        return 0;
    }
    let mut removed = 0;

    let produces_lambda = func
        .iter()
        .any(|op| matches!(op, Op::PushL(k) if *k != -1));
    if !produces_lambda {
        let mut i = 0;
        while i + GROUP_LEN <= func.len() {
            if binding_group(&func[i..i + GROUP_LEN]).is_some() {
                remove_ops(func, i, GROUP_LEN);
                removed += GROUP_LEN;
                i = 0;
                continue;
            }
            i += 1;
        }
    }

    let mut i = 0;
    while i + LOOKUP_LEN <= func.len() {
        if let Some(name) = lookup_sequence(&func[i..i + LOOKUP_LEN]) {
            if let Some(index) = bound.iter().position(|s| *s == name) {
                // drop all but one instruction, then overwrite the
                // survivor with the frame read
                remove_ops(func, i, LOOKUP_LEN - 1);
                func[i] = Op::PushFp(-((bound.len() - index - 1) as i32));
                removed += LOOKUP_LEN - 1;
                i = 0;
                continue;
            }
        }
        i += 1;
    }
    removed
}
