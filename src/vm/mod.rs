//! The stack virtual machine.
//!
//! A `Vm` owns the operand stack and the two-space heap, executes a
//! decoded [`Program`], and collects run statistics. Any precondition
//! violation stops the dispatch loop with a [`VmError`]; there is no
//! recovery inside a program.
//!
//! # Call frames
//!
//! `CALL` finds the closure on top of the stack and leaves its slot in
//! place, pushing the saved return address and the caller's
//! environment above it, so a frame for an `n`-argument call is
//! `args… lambda ip env`. The callee's prologue reads argument `i`
//! with `PUSHFS (3 + n - i)`; `RET n` pops the two saved cells and
//! then reclaims the `n` leftover argument slots together with the
//! spent lambda slot. The caller's frame pointer travels in the high
//! payload bits of the saved return-address cell.

pub mod heap;

use std::fmt;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::cell::{Cell, HeapIx, Tag};
use crate::program::{Op, Program};
use heap::Heap;

pub type VmResult<T> = Result<T, VmError>;

/// Conditions that stop the dispatch loop.
///
/// The rendering is the tail of the `PANIC:` diagnostic line, so each
/// variant formats as `<OP>, <condition>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    StackUnderflow { op: &'static str },
    StackOverflow { op: &'static str },
    TypeMismatch { op: &'static str, detail: &'static str },
    DivisionByZero { op: &'static str },
    HeapExhausted { op: &'static str },
    BadJump { op: &'static str, target: i64 },
    BadOperand { op: &'static str, value: i64 },
    UnknownOpcode(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow { op } => {
                write!(f, "{op}, not enough elements on the stack")
            }
            Self::StackOverflow { op } => write!(f, "{op}, stack overflow"),
            Self::TypeMismatch { op, detail } => write!(f, "{op}, {detail}"),
            Self::DivisionByZero { op } => write!(f, "{op}, division by zero"),
            Self::HeapExhausted { op } => write!(f, "{op}, heap exhausted"),
            Self::BadJump { op, target } => write!(f, "{op}, jump target {target} out of range"),
            Self::BadOperand { op, value } => write!(f, "{op}, bad operand {value}"),
            Self::UnknownOpcode(m) => write!(f, "{m}, unknown opcode"),
        }
    }
}

impl std::error::Error for VmError {}

/// Runtime dimensions and policies.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Operand stack capacity in cells.
    pub stack_size: usize,
    /// Total heap size in cells; each semispace gets half.
    pub heap_size: usize,
    /// Panic on unknown mnemonics instead of skipping them.
    pub strict: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_size: 500,
            heap_size: 50_000,
            strict: false,
        }
    }
}

/// The frame pointer rides in a 28-bit field of the saved
/// return-address cell, which bounds the stack.
const MAX_STACK: usize = (1 << 28) - 1;
/// Pair cells hold 30-bit indices, which bounds the heap.
const MAX_HEAP: usize = 1 << 30;

enum Output {
    Stdout,
    Buffer(Vec<u8>),
}

impl Output {
    fn write_all(&mut self, bytes: &[u8]) {
        match self {
            // Print failures are not program errors; stdout going away
            // mid-run just loses output, as it always has.
            Self::Stdout => {
                let _ = io::stdout().write_all(bytes);
            }
            Self::Buffer(buf) => buf.extend_from_slice(bytes),
        }
    }
}

enum Flow {
    Next,
    Jumped,
    Halt,
}

/// Statistics gathered by a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmStats {
    pub ticks: u64,
    pub stack_peak: u32,
    pub exec_time: Duration,
    pub jit_time: Duration,
}

pub struct Vm {
    stack: Box<[Cell]>,
    heap: Heap,
    stack_ptr: u32,
    env_ptr: HeapIx,
    frame_ptr: u32,
    pc: usize,
    strict: bool,
    output: Output,
    stats: VmStats,
    /// Panic raised from native code, picked up after it returns.
    #[cfg(feature = "jit")]
    pending_panic: Option<VmError>,
    /// Memory-mapped flag the native code polls after callbacks.
    #[cfg(feature = "jit")]
    panic_flag: u32,
    /// Panic table installed by the native code generator; callbacks
    /// refer to entries by index.
    #[cfg(feature = "jit")]
    jit_panics: Vec<VmError>,
    /// Scratch slot for the native dispatcher's computed-jump selector.
    #[cfg(feature = "jit")]
    jit_selector: u32,
}

/// Raw pointers into the live VM state for the native code generator.
/// All of them stay valid for as long as the `Vm` is neither moved nor
/// dropped; the boxed stack and heap never reallocate.
#[cfg(feature = "jit")]
pub(crate) struct RawParts {
    pub vm: *mut Vm,
    pub stack: *mut u64,
    pub stack_len: u64,
    pub heap_half: u64,
    pub heap: *mut u64,
    pub sp: *mut u32,
    pub hp: *mut u32,
    pub gc_count: *mut u32,
    pub ep: *mut u32,
    pub fp: *mut u32,
    pub panic_flag: *mut u32,
    pub selector: *mut u32,
}

impl Vm {
    pub fn new(config: &VmConfig) -> Self {
        let stack_size = config.stack_size.min(MAX_STACK);
        let heap_size = config.heap_size.min(MAX_HEAP);
        if stack_size != config.stack_size || heap_size != config.heap_size {
            warn!(target: "cellvm::vm", "requested dimensions exceed cell index widths, clamped");
        }
        Vm {
            stack: vec![Cell::NIL; stack_size.max(8)].into_boxed_slice(),
            heap: Heap::new(heap_size.max(16)),
            stack_ptr: 0,
            env_ptr: HeapIx::GLOBAL_ENV,
            frame_ptr: 0,
            pc: 0,
            strict: config.strict,
            output: Output::Stdout,
            stats: VmStats::default(),
            #[cfg(feature = "jit")]
            pending_panic: None,
            #[cfg(feature = "jit")]
            panic_flag: 0,
            #[cfg(feature = "jit")]
            jit_panics: Vec::new(),
            #[cfg(feature = "jit")]
            jit_selector: 0,
        }
    }

    /// Collect `PRN`/`PRNL` output in memory instead of stdout.
    pub fn capture_output(&mut self) {
        self.output = Output::Buffer(Vec::new());
    }

    /// Take the captured output, leaving an empty buffer.
    pub fn take_output(&mut self) -> Vec<u8> {
        match &mut self.output {
            Output::Buffer(buf) => std::mem::take(buf),
            Output::Stdout => Vec::new(),
        }
    }

    #[inline]
    pub fn stack_depth(&self) -> usize {
        self.stack_ptr as usize
    }

    /// The live portion of the stack, bottom first.
    #[inline]
    pub fn stack(&self) -> &[Cell] {
        &self.stack[..self.stack_ptr as usize]
    }

    #[inline]
    pub fn stack_top(&self) -> Option<Cell> {
        self.stack().last().copied()
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn env_ptr(&self) -> HeapIx {
        self.env_ptr
    }

    #[inline]
    pub fn pc(&self) -> usize {
        self.pc
    }

    #[inline]
    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    /// Whether unknown mnemonics panic instead of skipping.
    #[inline]
    pub fn strict_mode(&self) -> bool {
        self.strict
    }

    #[cfg(feature = "jit")]
    pub(crate) fn record_jit_time(&mut self, d: Duration) {
        self.stats.jit_time = d;
    }

    #[cfg(feature = "jit")]
    pub(crate) fn record_exec_time(&mut self, d: Duration) {
        self.stats.exec_time = d;
    }

    #[cfg(feature = "jit")]
    pub(crate) fn install_jit_panics(&mut self, table: Vec<VmError>) {
        self.jit_panics = table;
        self.pending_panic = None;
        self.panic_flag = 0;
    }

    /// Raise a panic from native code; the first one wins.
    #[cfg(feature = "jit")]
    pub(crate) fn raise_jit_panic_index(&mut self, index: usize) {
        if self.pending_panic.is_none() {
            self.pending_panic = self
                .jit_panics
                .get(index)
                .cloned()
                .or(Some(VmError::BadOperand {
                    op: "JIT",
                    value: index as i64,
                }));
        }
        self.panic_flag = 1;
    }

    #[cfg(feature = "jit")]
    pub(crate) fn take_jit_panic(&mut self) -> Option<VmError> {
        self.panic_flag = 0;
        self.pending_panic.take()
    }

    #[cfg(feature = "jit")]
    pub(crate) fn raw_parts(&mut self) -> RawParts {
        let (heap, hp, gc_count) = self.heap.jit_parts();
        let stack_len = self.stack.len() as u64;
        let heap_half = (self.heap.size() / 2) as u64;
        RawParts {
            stack: self.stack.as_mut_ptr() as *mut u64,
            stack_len,
            heap_half,
            heap,
            sp: &mut self.stack_ptr,
            ep: &mut self.env_ptr as *mut HeapIx as *mut u32,
            fp: &mut self.frame_ptr,
            panic_flag: &mut self.panic_flag,
            selector: &mut self.jit_selector,
            gc_count,
            hp,
            vm: self,
        }
    }

    fn push(&mut self, op: &'static str, cell: Cell) -> VmResult<()> {
        if self.stack_ptr as usize >= self.stack.len() {
            return Err(VmError::StackOverflow { op });
        }
        self.stack[self.stack_ptr as usize] = cell;
        self.stack_ptr += 1;
        Ok(())
    }

    fn pop(&mut self, op: &'static str) -> VmResult<Cell> {
        if self.stack_ptr == 0 {
            return Err(VmError::StackUnderflow { op });
        }
        self.stack_ptr -= 1;
        Ok(self.stack[self.stack_ptr as usize])
    }

    fn top(&self, op: &'static str) -> VmResult<Cell> {
        if self.stack_ptr == 0 {
            return Err(VmError::StackUnderflow { op });
        }
        Ok(self.stack[self.stack_ptr as usize - 1])
    }

    fn need(&self, op: &'static str, n: u32) -> VmResult<()> {
        if self.stack_ptr < n {
            return Err(VmError::StackUnderflow { op });
        }
        Ok(())
    }

    pub(crate) fn print_cell(&mut self, cell: Cell) {
        match cell.tag() {
            Tag::Int => {
                let text = cell.as_int().to_string();
                self.output.write_all(text.as_bytes());
            }
            Tag::String => {
                let sym = cell.as_sym();
                self.output.write_all(sym.bytes());
            }
            Tag::Nil => self.output.write_all(b"Nil\n"),
            _ => {}
        }
    }

    /// Run a collection with the current roots.
    pub(crate) fn collect(&mut self) {
        let sp = self.stack_ptr as usize;
        self.heap.collect(&mut self.stack[..sp], &mut self.env_ptr);
    }

    fn alloc(&mut self, op: &'static str, cell: Cell) -> VmResult<HeapIx> {
        self.heap
            .alloc(cell)
            .map_err(|_| VmError::HeapExhausted { op })
    }

    fn jump(&mut self, op: &'static str, delta: i32) -> VmResult<Flow> {
        let target = self.pc as i64 + delta as i64;
        if target < 0 {
            return Err(VmError::BadJump { op, target });
        }
        // A target one past the end terminates the loop, as FIN does.
        self.pc = target as usize;
        Ok(Flow::Jumped)
    }

    /// Execute a whole program from pc 0.
    pub fn run(&mut self, program: &Program) -> VmResult<()> {
        self.pc = 0;
        let start = Instant::now();
        let result = self.run_loop(program);
        self.stats.exec_time = start.elapsed();
        result
    }

    fn run_loop(&mut self, program: &Program) -> VmResult<()> {
        while let Some(op) = program.get(self.pc) {
            if op.allocates() {
                let sp = self.stack_ptr as usize;
                self.heap
                    .guard(&mut self.stack[..sp], &mut self.env_ptr)
                    .map_err(|_| VmError::HeapExhausted {
                        op: match op {
                            Op::Def => "DEF",
                            Op::StoreEnv => "STOREENV",
                            _ => "CONS",
                        },
                    })?;
            }
            trace!(target: "cellvm::vm", pc = self.pc, sp = self.stack_ptr, %op, "step");
            let flow = self.step(op)?;
            self.stats.ticks += 1;
            self.stats.stack_peak = self.stats.stack_peak.max(self.stack_ptr);
            match flow {
                Flow::Next => self.pc += 1,
                Flow::Jumped => {}
                Flow::Halt => break,
            }
        }
        Ok(())
    }

    fn step(&mut self, op: &Op) -> VmResult<Flow> {
        match op {
            Op::Nop => {}
            Op::Fin => return Ok(Flow::Halt),
            Op::Gc => self.collect(),
            Op::Pop => {
                self.pop("POP")?;
            }
            Op::PushCi(n) => self.push("PUSHCI", Cell::int(*n))?,
            Op::PushS(s) => self.push("PUSHS", Cell::sym(*s))?,
            Op::PushNil => self.push("PUSHNIL", Cell::NIL)?,
            Op::PushL(k) => {
                let cell = if *k == -1 {
                    // inert sentinel closure for the type-check idiom
                    Cell::lambda(0, HeapIx::NIL)
                } else {
                    let addr = u32::try_from(*k)
                        .map_err(|_| VmError::BadOperand { op: "PUSHL", value: *k })?;
                    Cell::lambda(addr, self.env_ptr)
                };
                self.push("PUSHL", cell)?;
            }
            Op::PushFs(k) => {
                self.need("PUSHFS", k + 1)?;
                let cell = self.stack[(self.stack_ptr - k - 1) as usize];
                self.push("PUSHFS", cell)?;
            }
            Op::PushFp(k) => {
                let ix = self.frame_ptr as i64 + *k as i64;
                if ix < 0 || ix >= self.stack_ptr as i64 {
                    return Err(VmError::StackUnderflow { op: "PUSHFP" });
                }
                let cell = self.stack[ix as usize];
                self.push("PUSHFP", cell)?;
            }
            Op::Prn => {
                let cell = self.pop("PRN")?;
                self.print_cell(cell);
            }
            Op::Prnl => self.output.write_all(b"\n"),
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                let name = op_name_arith(op);
                let x = self.pop(name)?;
                let y = self.pop(name)?;
                if x.tag() != Tag::Int || y.tag() != Tag::Int {
                    return Err(VmError::TypeMismatch {
                        op: name,
                        detail: "type mismatch",
                    });
                }
                let (a, b) = (y.as_int(), x.as_int());
                let r = match op {
                    Op::Add => a.wrapping_add(b),
                    Op::Sub => a.wrapping_sub(b),
                    Op::Mul => a.wrapping_mul(b),
                    Op::Div | Op::Mod => {
                        if b == 0 {
                            return Err(VmError::DivisionByZero { op: name });
                        }
                        if matches!(op, Op::Div) {
                            a.wrapping_div(b)
                        } else {
                            a.wrapping_rem(b)
                        }
                    }
                    _ => unreachable!(),
                };
                self.push(name, Cell::int(r))?;
            }
            Op::Lt => {
                let x = self.pop("LT")?;
                let y = self.pop("LT")?;
                if x.tag() != Tag::Int || y.tag() != Tag::Int {
                    return Err(VmError::TypeMismatch {
                        op: "LT",
                        detail: "type mismatch",
                    });
                }
                self.push("LT", Cell::int((y.as_int() < x.as_int()) as i64))?;
            }
            Op::Eq => {
                let x = self.pop("EQ")?;
                let y = self.pop("EQ")?;
                if x.tag() != y.tag() {
                    return Err(VmError::TypeMismatch {
                        op: "EQ",
                        detail: "type mismatch",
                    });
                }
                let equal = match x.tag() {
                    Tag::Int => x.as_int() == y.as_int(),
                    Tag::String => x.as_sym() == y.as_sym(),
                    Tag::Nil => true,
                    Tag::Lambda => x.lambda_addr() == y.lambda_addr(),
                    _ => {
                        return Err(VmError::TypeMismatch {
                            op: "EQ",
                            detail: "comparing pairs is not supported",
                        })
                    }
                };
                self.push("EQ", Cell::int(equal as i64))?;
            }
            Op::Eqt => {
                self.need("EQT", 2)?;
                let x = self.stack[(self.stack_ptr - 1) as usize];
                let y = self.stack[(self.stack_ptr - 2) as usize];
                self.push("EQT", Cell::int((x.tag() == y.tag()) as i64))?;
            }
            Op::Eqsi(s) => {
                let x = self.top("EQSI")?;
                if x.tag() != Tag::String {
                    return Err(VmError::TypeMismatch {
                        op: "EQSI",
                        detail: "type mismatch",
                    });
                }
                self.push("EQSI", Cell::int((x.as_sym() == *s) as i64))?;
            }
            Op::Cons => {
                let x = self.pop("CONS")?;
                let y = self.pop("CONS")?;
                let l = self.alloc("CONS", x)?;
                let r = self.alloc("CONS", y)?;
                self.push("CONS", Cell::pair(l, r))?;
            }
            Op::Car | Op::Cdr => {
                let name = if matches!(op, Op::Car) { "CAR" } else { "CDR" };
                let cell = self.top(name)?;
                if cell.tag() != Tag::Pair {
                    return Err(VmError::TypeMismatch {
                        op: name,
                        detail: "type mismatch",
                    });
                }
                let child = if matches!(op, Op::Car) {
                    cell.pair_left()
                } else {
                    cell.pair_right()
                };
                self.stack[(self.stack_ptr - 1) as usize] = self.heap.get(child);
            }
            Op::PushCar | Op::PushCdr => {
                let name = if matches!(op, Op::PushCar) {
                    "PUSHCAR"
                } else {
                    "PUSHCDR"
                };
                let cell = self.top(name)?;
                if cell.tag() != Tag::Pair {
                    return Err(VmError::TypeMismatch {
                        op: name,
                        detail: "type mismatch",
                    });
                }
                let child = if matches!(op, Op::PushCar) {
                    cell.pair_left()
                } else {
                    cell.pair_right()
                };
                let value = self.heap.get(child);
                self.push(name, value)?;
            }
            Op::Def => {
                let xy = self.top("DEF")?;
                if xy.tag() != Tag::Pair {
                    return Err(VmError::TypeMismatch {
                        op: "DEF",
                        detail: "type mismatch",
                    });
                }
                let binding = self.alloc("DEF", xy)?;
                let outer = self.alloc("DEF", self.heap.get(self.env_ptr))?;
                self.heap.set(self.env_ptr, Cell::pair(binding, outer));
                // the defined name stays as the form's value
                self.stack[(self.stack_ptr - 1) as usize] = self.heap.get(xy.pair_left());
            }
            Op::LoadEnv => {
                let env = self.heap.get(self.env_ptr);
                self.push("LOADENV", env)?;
            }
            Op::StoreEnv => {
                let cell = self.pop("STOREENV")?;
                self.env_ptr = self.alloc("STOREENV", cell)?;
            }
            Op::Rjmp(d) => return self.jump("RJMP", *d),
            Op::Rjz(d) | Op::Rjnz(d) => {
                let name = if matches!(op, Op::Rjz(_)) { "RJZ" } else { "RJNZ" };
                let cell = self.top(name)?;
                if cell.tag() != Tag::Int {
                    return Err(VmError::TypeMismatch {
                        op: name,
                        detail: "type mismatch",
                    });
                }
                let zero = cell.as_int() == 0;
                if zero == matches!(op, Op::Rjz(_)) {
                    return self.jump(name, *d);
                }
            }
            Op::Call => {
                let lambda = self.top("CALL")?;
                if lambda.tag() != Tag::Lambda {
                    return Err(VmError::TypeMismatch {
                        op: "CALL",
                        detail: "type mismatch",
                    });
                }
                if lambda.lambda_env() == HeapIx::NIL {
                    return Err(VmError::TypeMismatch {
                        op: "CALL",
                        detail: "lambda has no bound env",
                    });
                }
                // The lambda's slot stays in the frame; RET reclaims it.
                let ip = Cell::instruction_pointer(self.pc as u32 + 1, self.frame_ptr);
                self.push("CALL", ip)?;
                self.push("CALL", Cell::environment(self.env_ptr))?;
                self.env_ptr = lambda.lambda_env();
                self.frame_ptr = self.stack_ptr.saturating_sub(4);
                self.pc = lambda.lambda_addr() as usize;
                return Ok(Flow::Jumped);
            }
            Op::Ret(n) => {
                let env = self.pop("RET")?;
                if env.tag() != Tag::Environment {
                    return Err(VmError::TypeMismatch {
                        op: "RET",
                        detail: "type mismatch",
                    });
                }
                let ip = self.pop("RET")?;
                if ip.tag() != Tag::InstructionPointer {
                    return Err(VmError::TypeMismatch {
                        op: "RET",
                        detail: "type mismatch",
                    });
                }
                // n leftover arguments plus the spent lambda slot
                self.need("RET", n + 1)?;
                self.stack_ptr -= n + 1;
                self.env_ptr = env.env_index();
                self.frame_ptr = ip.saved_fp();
                self.pc = ip.return_pc() as usize;
                return Ok(Flow::Jumped);
            }
            Op::Swap(k) => {
                self.need("SWAP", k + 2)?;
                let top = (self.stack_ptr - 1) as usize;
                let other = (self.stack_ptr - 2 - k) as usize;
                self.stack.swap(top, other);
            }
            Op::Unknown(m) => {
                if self.strict {
                    return Err(VmError::UnknownOpcode(m.to_string()));
                }
                warn!(target: "cellvm::vm", mnemonic = %m, "skipping unknown opcode");
            }
        }
        Ok(Flow::Next)
    }

    /// Write the end-of-run diagnostics.
    pub fn report(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "PC: {}", self.pc)?;
        if !self.stats.jit_time.is_zero() {
            writeln!(w, "JIT time: {} us", self.stats.jit_time.as_micros())?;
        }
        writeln!(w, "Execution time: {} us", self.stats.exec_time.as_micros())?;
        writeln!(w, "Ticks: {}", self.stats.ticks)?;
        writeln!(w, "GC ran: {} time(s)", self.heap.gc_count())?;
        writeln!(w, "  Collected: {} cells", self.heap.gc_collected())?;
        writeln!(w, "Environment pointer: {}", self.env_ptr.raw())?;
        writeln!(
            w,
            "Stack size: {} (peak {})",
            self.stack_ptr, self.stats.stack_peak
        )?;
        writeln!(w, "Memory size: {}", self.heap.used())?;
        writeln!(w, "Stack:")?;
        for cell in self.stack().iter().rev() {
            writeln!(w, "    {cell}")?;
        }
        Ok(())
    }
}

fn op_name_arith(op: &Op) -> &'static str {
    match op {
        Op::Add => "ADD",
        Op::Sub => "SUB",
        Op::Mul => "MUL",
        Op::Div => "DIV",
        _ => "MOD",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Sym;

    fn run_ops(ops: Vec<Op>) -> Vm {
        let mut vm = Vm::new(&VmConfig::default());
        vm.capture_output();
        vm.run(&Program::new(ops)).expect("program should run");
        vm
    }

    fn run_err(ops: Vec<Op>) -> VmError {
        let mut vm = Vm::new(&VmConfig::default());
        vm.capture_output();
        vm.run(&Program::new(ops)).expect_err("program should panic")
    }

    fn sym(s: &str) -> Sym {
        Sym::new(s).unwrap()
    }

    #[test]
    fn arithmetic_operates_on_the_two_topmost_cells() {
        let vm = run_ops(vec![
            Op::PushCi(10),
            Op::PushCi(3),
            Op::Sub,
            Op::Fin,
        ]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 7);
    }

    #[test]
    fn division_truncates_and_checks_for_zero() {
        let vm = run_ops(vec![Op::PushCi(7), Op::PushCi(2), Op::Div, Op::Fin]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 3);
        let err = run_err(vec![Op::PushCi(7), Op::PushCi(0), Op::Div, Op::Fin]);
        assert_eq!(err, VmError::DivisionByZero { op: "DIV" });
    }

    #[test]
    fn lt_is_signed() {
        let vm = run_ops(vec![
            Op::PushCi(0),
            Op::PushCi(1),
            Op::Sub, // -1
            Op::PushCi(5),
            Op::Lt,
            Op::Fin,
        ]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 1);
    }

    #[test]
    fn arith_type_mismatch_panics() {
        let err = run_err(vec![Op::PushNil, Op::PushCi(1), Op::Add, Op::Fin]);
        assert_eq!(
            err,
            VmError::TypeMismatch {
                op: "ADD",
                detail: "type mismatch"
            }
        );
    }

    #[test]
    fn eq_semantics_per_tag() {
        let vm = run_ops(vec![Op::PushCi(4), Op::PushCi(4), Op::Eq, Op::Fin]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 1);
        let vm = run_ops(vec![
            Op::PushS(sym("ab")),
            Op::PushS(sym("ab")),
            Op::Eq,
            Op::Fin,
        ]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 1);
        let vm = run_ops(vec![Op::PushNil, Op::PushNil, Op::Eq, Op::Fin]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 1);
        let err = run_err(vec![Op::PushCi(1), Op::PushNil, Op::Eq, Op::Fin]);
        assert!(matches!(err, VmError::TypeMismatch { op: "EQ", .. }));
    }

    #[test]
    fn comparing_pairs_is_unsupported() {
        let err = run_err(vec![
            Op::PushCi(1),
            Op::PushCi(2),
            Op::Cons,
            Op::PushCi(1),
            Op::PushCi(2),
            Op::Cons,
            Op::Eq,
            Op::Fin,
        ]);
        assert_eq!(
            err,
            VmError::TypeMismatch {
                op: "EQ",
                detail: "comparing pairs is not supported"
            }
        );
    }

    #[test]
    fn eqt_keeps_operands() {
        let vm = run_ops(vec![Op::PushCi(1), Op::PushNil, Op::Eqt, Op::Fin]);
        assert_eq!(vm.stack_depth(), 3);
        assert_eq!(vm.stack_top().unwrap().as_int(), 0);
    }

    #[test]
    fn eqsi_keeps_the_operand_and_pushes_the_flag() {
        let vm = run_ops(vec![Op::PushS(sym("k")), Op::Eqsi(sym("k")), Op::Fin]);
        assert_eq!(vm.stack_depth(), 2);
        assert_eq!(vm.stack_top().unwrap().as_int(), 1);
        assert_eq!(vm.stack()[0].as_sym(), sym("k"));
    }

    #[test]
    fn cons_car_cdr_roundtrip() {
        let vm = run_ops(vec![
            Op::PushCi(2), // right
            Op::PushCi(1), // left
            Op::Cons,
            Op::Car,
            Op::Fin,
        ]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 1);
        let vm = run_ops(vec![Op::PushCi(2), Op::PushCi(1), Op::Cons, Op::Cdr, Op::Fin]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 2);
    }

    #[test]
    fn pushcar_keeps_the_pair() {
        let vm = run_ops(vec![
            Op::PushCi(2),
            Op::PushCi(1),
            Op::Cons,
            Op::PushCar,
            Op::Fin,
        ]);
        assert_eq!(vm.stack_depth(), 2);
        assert_eq!(vm.stack()[0].tag(), Tag::Pair);
        assert_eq!(vm.stack_top().unwrap().as_int(), 1);
        let vm = run_ops(vec![
            Op::PushCi(2),
            Op::PushCi(1),
            Op::Cons,
            Op::PushCdr,
            Op::Fin,
        ]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 2);
    }

    #[test]
    fn def_prepends_a_binding_and_leaves_the_name() {
        let vm = run_ops(vec![
            Op::PushCi(10),
            Op::PushS(sym("k")),
            Op::Cons,
            Op::Def,
            Op::Fin,
        ]);
        assert_eq!(vm.stack_top().unwrap().as_sym(), sym("k"));
        // the binding is reachable from the global env
        let env = vm.heap().get(vm.env_ptr());
        let binding = vm.heap().get(env.pair_left());
        assert_eq!(vm.heap().get(binding.pair_left()).as_sym(), sym("k"));
        assert_eq!(vm.heap().get(binding.pair_right()).as_int(), 10);
    }

    #[test]
    fn tag_preserved_by_stack_shuffles() {
        let vm = run_ops(vec![
            Op::PushS(sym("s")),
            Op::PushCi(1),
            Op::PushNil,
            Op::Swap(1),
            Op::PushFs(2),
            Op::Fin,
        ]);
        // SWAP 1 exchanges the Nil on top with the symbol two below;
        // PUSHFS 2 then copies that Nil back to the top
        assert_eq!(vm.stack()[0].tag(), Tag::Nil);
        assert_eq!(vm.stack()[1].tag(), Tag::Int);
        assert_eq!(vm.stack()[2].tag(), Tag::String);
        assert_eq!(vm.stack_top().unwrap().tag(), Tag::Nil);
    }

    #[test]
    fn call_builds_the_frame_and_ret_unwinds_it() {
        // main: PUSHCI 41, PUSHL 4, CALL, FIN
        // callee at 4, entered with [41, lambda, ip, env]:
        //   PUSHFS 3 copies the argument, ADD makes 42, the epilogue
        //   swaps it under the frame and RET 0 reclaims the lambda slot
        let vm = run_ops(vec![
            Op::PushCi(41),
            Op::PushL(4),
            Op::Call,
            Op::Fin,
            Op::PushFs(3),
            Op::PushCi(1),
            Op::Add,
            Op::Swap(3),
            Op::Pop,
            Op::Ret(0),
        ]);
        assert_eq!(vm.stack_depth(), 1);
        assert_eq!(vm.stack_top().unwrap().as_int(), 42);
    }

    #[test]
    fn call_requires_a_callable_closure() {
        let err = run_err(vec![Op::PushCi(1), Op::Call, Op::Fin]);
        assert!(matches!(err, VmError::TypeMismatch { op: "CALL", .. }));
        // the sentinel closure has no bound env
        let err = run_err(vec![Op::PushL(-1), Op::Call, Op::Fin]);
        assert_eq!(
            err,
            VmError::TypeMismatch {
                op: "CALL",
                detail: "lambda has no bound env"
            }
        );
    }

    #[test]
    fn underflow_is_detected() {
        assert_eq!(run_err(vec![Op::Pop]), VmError::StackUnderflow { op: "POP" });
        assert_eq!(run_err(vec![Op::Add]), VmError::StackUnderflow { op: "ADD" });
        assert_eq!(
            run_err(vec![Op::PushCi(1), Op::Swap(3), Op::Fin]),
            VmError::StackUnderflow { op: "SWAP" }
        );
    }

    #[test]
    fn stack_overflow_is_detected() {
        let mut vm = Vm::new(&VmConfig {
            stack_size: 8,
            ..VmConfig::default()
        });
        let ops: Vec<Op> = std::iter::repeat(Op::PushCi(1)).take(16).collect();
        let err = vm.run(&Program::new(ops)).unwrap_err();
        assert_eq!(err, VmError::StackOverflow { op: "PUSHCI" });
    }

    #[test]
    fn branches_test_without_popping() {
        let vm = run_ops(vec![
            Op::PushCi(1),
            Op::Rjnz(2),
            Op::Fin, // skipped
            Op::Fin,
        ]);
        assert_eq!(vm.stack_depth(), 1);
        let vm = run_ops(vec![
            Op::PushCi(0),
            Op::Rjz(2),
            Op::Fin, // skipped
            Op::Fin,
        ]);
        assert_eq!(vm.pc(), 3);
    }

    #[test]
    fn negative_jump_target_panics() {
        let err = run_err(vec![Op::Rjmp(-5)]);
        assert_eq!(
            err,
            VmError::BadJump {
                op: "RJMP",
                target: -5
            }
        );
    }

    #[test]
    fn jump_past_the_end_terminates() {
        let vm = run_ops(vec![Op::PushCi(1), Op::Rjnz(10)]);
        assert_eq!(vm.stack_depth(), 1);
    }

    #[test]
    fn unknown_opcodes_are_nops_unless_strict() {
        let vm = run_ops(vec![
            Op::Unknown("FROB".into()),
            Op::PushCi(1),
            Op::Fin,
        ]);
        assert_eq!(vm.stack_top().unwrap().as_int(), 1);

        let mut vm = Vm::new(&VmConfig {
            strict: true,
            ..VmConfig::default()
        });
        let err = vm
            .run(&Program::new(vec![Op::Unknown("FROB".into()), Op::Fin]))
            .unwrap_err();
        assert_eq!(err, VmError::UnknownOpcode("FROB".into()));
    }

    #[test]
    fn prn_prints_ints_symbols_and_nil() {
        let mut vm = run_ops(vec![
            Op::PushCi(-42),
            Op::Prn,
            Op::PushS(sym("ok")),
            Op::Prn,
            Op::PushNil,
            Op::Prn,
            Op::Prnl,
            Op::Fin,
        ]);
        assert_eq!(vm.take_output(), b"-42okNil\n\n");
    }

    #[test]
    fn forced_gc_keeps_live_data() {
        let vm = run_ops(vec![
            Op::PushCi(2),
            Op::PushCi(1),
            Op::Cons,
            Op::Gc,
            Op::Car,
            Op::Fin,
        ]);
        assert_eq!(vm.heap().gc_count(), 1);
        assert_eq!(vm.stack_top().unwrap().as_int(), 1);
    }

    #[test]
    fn allocation_guard_triggers_collection() {
        let mut vm = Vm::new(&VmConfig {
            heap_size: 64,
            ..VmConfig::default()
        });
        // churn garbage pairs: each CONS allocates two cells that the
        // following POP makes unreachable
        let mut ops = Vec::new();
        for _ in 0..40 {
            ops.push(Op::PushCi(1));
            ops.push(Op::PushCi(2));
            ops.push(Op::Cons);
            ops.push(Op::Pop);
        }
        ops.push(Op::Fin);
        vm.run(&Program::new(ops)).unwrap();
        assert!(vm.heap().gc_count() >= 1);
    }

    #[test]
    fn heap_exhaustion_panics() {
        let mut vm = Vm::new(&VmConfig {
            heap_size: 32,
            ..VmConfig::default()
        });
        // keep every pair live on the stack so nothing is collectible
        let mut ops = Vec::new();
        for _ in 0..20 {
            ops.push(Op::PushCi(1));
            ops.push(Op::PushCi(2));
            ops.push(Op::Cons);
        }
        ops.push(Op::Fin);
        let err = vm.run(&Program::new(ops)).unwrap_err();
        assert_eq!(err, VmError::HeapExhausted { op: "CONS" });
    }

    #[test]
    fn report_is_writable() {
        let vm = run_ops(vec![Op::PushCi(1), Op::Fin]);
        let mut buf = Vec::new();
        vm.report(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("GC ran: 0 time(s)"));
        assert!(text.contains("Int : 1"));
    }
}
