//! Cranelift translation of bytecode programs to native code.
//!
//! The generated function operates directly on the live VM state: the
//! stack base, heap base, and register addresses are baked in as
//! constants, so the interpreter's collector can run unchanged as a
//! host callback and every cell means exactly what it means under
//! interpretation. Dispatch is the only thing that changes.
//!
//! A first pass computes the jump-label table: every branch target
//! plus the instruction after each `CALL`/`RET`/`FIN`. Function blobs
//! always follow a `FIN` or a `RET`, so their entry points are covered
//! without special cases. Each label becomes a basic block; `CALL` and
//! `RET` jump through a shared dispatch block that switches over label
//! indices, and closure cells store label indices in their address
//! field (the text-format addresses never reach native code).
//!
//! Allocating opcodes inline the same fill-level guard as the
//! interpreter and call back into the collector; `PRN`/`PRNL` and
//! panics are callbacks too. Every opcode carries the interpreter's
//! stack and type preconditions as native guards, so ill-typed
//! bytecode panics the same way under either engine.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use cranelift::prelude::*;
use cranelift_frontend::Switch;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use tracing::debug;

use crate::cell::{Cell, HeapIx, Tag, PAYLOAD_MASK};
use crate::program::{Op, Program};
use crate::vm::{Vm, VmError};

/// Failures of the native translation itself; runtime panics come back
/// as [`JitError::Vm`].
#[derive(Debug)]
pub enum JitError {
    Compilation(String),
    /// The program needs something the translator does not emit.
    Unsupported(String),
    /// The translated program panicked at run time.
    Vm(VmError),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compilation(m) => write!(f, "native translation failed: {m}"),
            Self::Unsupported(m) => write!(f, "not translatable: {m}"),
            Self::Vm(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for JitError {}

type JitResult<T> = Result<T, JitError>;

extern "C" fn cellvm_jit_gc(vm: *mut Vm) {
    // SAFETY: native code passes back the pointer baked in by
    // `compile`, which outlives the call.
    let vm = unsafe { &mut *vm };
    vm.collect();
}

extern "C" fn cellvm_jit_print(vm: *mut Vm, cell: u64) {
    let vm = unsafe { &mut *vm };
    vm.print_cell(Cell::from_raw(cell));
}

extern "C" fn cellvm_jit_panic(vm: *mut Vm, index: u64) {
    let vm = unsafe { &mut *vm };
    vm.raise_jit_panic_index(index as usize);
}

/// Execute a program natively over the given VM. Translation happens
/// up front; runtime panics surface after the generated code returns.
pub fn run_jit(vm: &mut Vm, program: &Program) -> JitResult<()> {
    let translate_start = Instant::now();
    let mut compiled = JitCompiler::new()?.compile(vm, program)?;
    vm.install_jit_panics(std::mem::take(&mut compiled.panics));
    vm.record_jit_time(translate_start.elapsed());

    let start = Instant::now();
    // SAFETY: the entry pointer stays valid until `compiled` drops,
    // after this call; it only touches the VM whose pointers were
    // baked in, and that VM is alive and unmoved.
    unsafe { compiled.call() };
    vm.record_exec_time(start.elapsed());

    match vm.take_jit_panic() {
        Some(error) => Err(JitError::Vm(error)),
        None => Ok(()),
    }
}

/// A finished native translation. Frees its executable memory on drop.
pub struct CompiledProgram {
    module: Option<JITModule>,
    entry: *const u8,
    panics: Vec<VmError>,
}

impl CompiledProgram {
    unsafe fn call(&self) {
        let entry: extern "C" fn() = std::mem::transmute(self.entry);
        entry();
    }
}

impl Drop for CompiledProgram {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: `entry` is never called again once we get here.
            unsafe { module.free_memory() };
        }
    }
}

/// Panic reasons referenced from generated code by table index.
struct PanicTable {
    entries: Vec<VmError>,
}

impl PanicTable {
    fn new() -> Self {
        PanicTable {
            entries: Vec::new(),
        }
    }

    fn index_of(&mut self, error: VmError) -> i64 {
        if let Some(ix) = self.entries.iter().position(|e| *e == error) {
            return ix as i64;
        }
        self.entries.push(error);
        self.entries.len() as i64 - 1
    }
}

pub struct JitCompiler {
    module: JITModule,
    gc_func: cranelift_module::FuncId,
    print_func: cranelift_module::FuncId,
    panic_func: cranelift_module::FuncId,
}

impl JitCompiler {
    pub fn new() -> JitResult<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| JitError::Compilation(format!("failed to set opt_level: {e}")))?;
        let isa_builder = cranelift_native::builder()
            .map_err(|e| JitError::Compilation(format!("failed to create ISA builder: {e}")))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Compilation(format!("failed to create ISA: {e}")))?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        builder.symbol("cellvm_jit_gc", cellvm_jit_gc as *const u8);
        builder.symbol("cellvm_jit_print", cellvm_jit_print as *const u8);
        builder.symbol("cellvm_jit_panic", cellvm_jit_panic as *const u8);
        let mut module = JITModule::new(builder);

        let mut gc_sig = module.make_signature();
        gc_sig.params.push(AbiParam::new(types::I64));
        let gc_func = module
            .declare_function("cellvm_jit_gc", Linkage::Import, &gc_sig)
            .map_err(|e| JitError::Compilation(e.to_string()))?;

        let mut print_sig = module.make_signature();
        print_sig.params.push(AbiParam::new(types::I64));
        print_sig.params.push(AbiParam::new(types::I64));
        let print_func = module
            .declare_function("cellvm_jit_print", Linkage::Import, &print_sig)
            .map_err(|e| JitError::Compilation(e.to_string()))?;

        let mut panic_sig = module.make_signature();
        panic_sig.params.push(AbiParam::new(types::I64));
        panic_sig.params.push(AbiParam::new(types::I64));
        let panic_func = module
            .declare_function("cellvm_jit_panic", Linkage::Import, &panic_sig)
            .map_err(|e| JitError::Compilation(e.to_string()))?;

        Ok(JitCompiler {
            module,
            gc_func,
            print_func,
            panic_func,
        })
    }

    /// Translate a whole program against the given VM's memory.
    pub fn compile(mut self, vm: &mut Vm, program: &Program) -> JitResult<CompiledProgram> {
        let labels = build_label_map(program);
        debug!(target: "cellvm::jit", labels = labels.order.len(), ops = program.len(), "translating");

        let sig = self.module.make_signature();
        let func_id = self
            .module
            .declare_function("cellvm_program", Linkage::Local, &sig)
            .map_err(|e| JitError::Compilation(e.to_string()))?;
        let mut ctx = self.module.make_context();
        ctx.func.signature = sig.clone();

        let mut panics = PanicTable::new();
        {
            let mut fctx = FunctionBuilderContext::new();
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fctx);
            let mut translator = Translator::new(
                &mut builder,
                &mut self.module,
                vm,
                program,
                &labels,
                &mut panics,
                self.gc_func,
                self.print_func,
                self.panic_func,
            );
            translator.translate()?;
            builder.seal_all_blocks();
            builder.finalize();
        }

        self.module
            .define_function(func_id, &mut ctx)
            .map_err(|e| JitError::Compilation(e.to_string()))?;
        self.module
            .finalize_definitions()
            .map_err(|e| JitError::Compilation(e.to_string()))?;
        let entry = self.module.get_finalized_function(func_id);
        Ok(CompiledProgram {
            module: Some(self.module),
            entry,
            panics: panics.entries,
        })
    }
}

/// Jump-label table: pc -> dense label index, plus the pcs in index
/// order.
struct LabelMap {
    by_pc: HashMap<usize, usize>,
    order: Vec<usize>,
}

impl LabelMap {
    fn get(&self, pc: usize) -> Option<usize> {
        self.by_pc.get(&pc).copied()
    }
}

fn build_label_map(program: &Program) -> LabelMap {
    let mut by_pc = HashMap::new();
    let mut order = Vec::new();
    let len = program.len();
    let mut add = |pc: i64, order: &mut Vec<usize>, by_pc: &mut HashMap<usize, usize>| {
        if pc >= 0 && (pc as usize) < len {
            let pc = pc as usize;
            if !by_pc.contains_key(&pc) {
                by_pc.insert(pc, order.len());
                order.push(pc);
            }
        }
    };
    for (pc, op) in program.ops().iter().enumerate() {
        match op {
            Op::Call | Op::Ret(_) | Op::Fin => add(pc as i64 + 1, &mut order, &mut by_pc),
            Op::Rjmp(d) | Op::Rjz(d) | Op::Rjnz(d) => {
                add(pc as i64 + *d as i64, &mut order, &mut by_pc)
            }
            _ => {}
        }
    }
    LabelMap { by_pc, order }
}

const TAG_SHIFT: i64 = 60;
const INT_TAG: i64 = (Tag::Int as i64) << TAG_SHIFT;
const PAIR_TAG: i64 = (Tag::Pair as i64) << TAG_SHIFT;
const IP_TAG: i64 = (Tag::InstructionPointer as i64) << TAG_SHIFT;
const ENV_TAG: i64 = (Tag::Environment as i64) << TAG_SHIFT;
const LEFT_MASK: i64 = (1 << 30) - 1;
const ENV_FIELD_MASK: i64 = (1 << 28) - 1;

struct Translator<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    module: &'a mut JITModule,
    program: &'a Program,
    labels: &'a LabelMap,
    panics: &'a mut PanicTable,
    gc_func: cranelift_module::FuncId,
    print_func: cranelift_module::FuncId,
    panic_func: cranelift_module::FuncId,
    // baked addresses
    vm_ptr: i64,
    stack_base: i64,
    stack_len: i64,
    heap_base: i64,
    heap_half: i64,
    sp_ptr: i64,
    hp_ptr: i64,
    gc_count_ptr: i64,
    ep_ptr: i64,
    fp_ptr: i64,
    panic_flag_ptr: i64,
    selector_ptr: i64,
    strict: bool,
    // blocks
    label_blocks: Vec<Block>,
    dispatch: Block,
    bad_dispatch: Block,
    terminated: bool,
}

#[allow(clippy::too_many_arguments)]
impl<'a, 'b> Translator<'a, 'b> {
    fn new(
        builder: &'a mut FunctionBuilder<'b>,
        module: &'a mut JITModule,
        vm: &mut Vm,
        program: &'a Program,
        labels: &'a LabelMap,
        panics: &'a mut PanicTable,
        gc_func: cranelift_module::FuncId,
        print_func: cranelift_module::FuncId,
        panic_func: cranelift_module::FuncId,
    ) -> Self {
        let raw = vm.raw_parts();
        let strict = vm.strict_mode();
        let label_blocks: Vec<Block> =
            labels.order.iter().map(|_| builder.create_block()).collect();
        let dispatch = builder.create_block();
        let bad_dispatch = builder.create_block();
        Translator {
            builder,
            module,
            program,
            labels,
            panics,
            gc_func,
            print_func,
            panic_func,
            vm_ptr: raw.vm as i64,
            stack_base: raw.stack as i64,
            stack_len: raw.stack_len as i64,
            heap_base: raw.heap as i64,
            heap_half: raw.heap_half as i64,
            sp_ptr: raw.sp as i64,
            hp_ptr: raw.hp as i64,
            gc_count_ptr: raw.gc_count as i64,
            ep_ptr: raw.ep as i64,
            fp_ptr: raw.fp as i64,
            panic_flag_ptr: raw.panic_flag as i64,
            selector_ptr: raw.selector as i64,
            strict,
            label_blocks,
            dispatch,
            bad_dispatch,
            terminated: false,
        }
    }

    // --- small IR helpers -------------------------------------------------

    fn iconst(&mut self, v: i64) -> Value {
        self.builder.ins().iconst(types::I64, v)
    }

    fn load_reg(&mut self, ptr: i64) -> Value {
        let addr = self.iconst(ptr);
        let v32 = self
            .builder
            .ins()
            .load(types::I32, MemFlags::trusted(), addr, 0);
        self.builder.ins().uextend(types::I64, v32)
    }

    fn store_reg(&mut self, ptr: i64, value: Value) {
        let addr = self.iconst(ptr);
        let v32 = self.builder.ins().ireduce(types::I32, value);
        self.builder.ins().store(MemFlags::trusted(), v32, addr, 0);
    }

    fn cell_addr(&mut self, base: i64, index: Value) -> Value {
        let offset = self.builder.ins().ishl_imm(index, 3);
        self.builder.ins().iadd_imm(offset, base)
    }

    fn stack_load(&mut self, index: Value) -> Value {
        let addr = self.cell_addr(self.stack_base, index);
        self.builder
            .ins()
            .load(types::I64, MemFlags::trusted(), addr, 0)
    }

    fn stack_store(&mut self, index: Value, value: Value) {
        let addr = self.cell_addr(self.stack_base, index);
        self.builder.ins().store(MemFlags::trusted(), value, addr, 0);
    }

    fn heap_load(&mut self, index: Value) -> Value {
        let addr = self.cell_addr(self.heap_base, index);
        self.builder
            .ins()
            .load(types::I64, MemFlags::trusted(), addr, 0)
    }

    fn heap_store(&mut self, index: Value, value: Value) {
        let addr = self.cell_addr(self.heap_base, index);
        self.builder.ins().store(MemFlags::trusted(), value, addr, 0);
    }

    fn call_func(&mut self, func: cranelift_module::FuncId, args: &[Value]) {
        let callee = self.module.declare_func_in_func(func, self.builder.func);
        self.builder.ins().call(callee, args);
    }

    /// Branch to a fresh failure block that records the panic and
    /// returns, unless `ok` holds.
    fn guard(&mut self, ok: Value, error: VmError) {
        let index = self.panics.index_of(error);
        let fail = self.builder.create_block();
        let cont = self.builder.create_block();
        self.builder.ins().brif(ok, cont, &[], fail, &[]);
        self.builder.switch_to_block(fail);
        let vm = self.iconst(self.vm_ptr);
        let ix = self.iconst(index);
        self.call_func(self.panic_func, &[vm, ix]);
        self.builder.ins().return_(&[]);
        self.builder.switch_to_block(cont);
    }

    /// Emit an unconditional panic and mark the block terminated.
    fn emit_panic(&mut self, error: VmError) {
        let index = self.panics.index_of(error);
        let vm = self.iconst(self.vm_ptr);
        let ix = self.iconst(index);
        self.call_func(self.panic_func, &[vm, ix]);
        self.builder.ins().return_(&[]);
        self.terminated = true;
    }

    /// sp >= n, reported as an underflow of `op`.
    fn need(&mut self, n: i64, op: &'static str) {
        let sp = self.load_reg(self.sp_ptr);
        let ok = self
            .builder
            .ins()
            .icmp_imm(IntCC::UnsignedGreaterThanOrEqual, sp, n);
        self.guard(ok, VmError::StackUnderflow { op });
    }

    /// sp + n <= stack capacity.
    fn room(&mut self, n: i64, op: &'static str) {
        let sp = self.load_reg(self.sp_ptr);
        let ok = self
            .builder
            .ins()
            .icmp_imm(IntCC::UnsignedLessThanOrEqual, sp, self.stack_len - n);
        self.guard(ok, VmError::StackOverflow { op });
    }

    fn check_tag(&mut self, cell: Value, tag: Tag, op: &'static str, detail: &'static str) {
        let bits = self.builder.ins().ushr_imm(cell, TAG_SHIFT);
        let ok = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, bits, tag as i64);
        self.guard(ok, VmError::TypeMismatch { op, detail });
    }

    /// Sign-extended 60-bit payload.
    fn payload_signed(&mut self, cell: Value) -> Value {
        let shifted = self.builder.ins().ishl_imm(cell, 4);
        self.builder.ins().sshr_imm(shifted, 4)
    }

    /// Wrap an integer back into an Int cell.
    fn int_cell(&mut self, value: Value) -> Value {
        let masked = self.builder.ins().band_imm(value, PAYLOAD_MASK as i64);
        self.builder.ins().bor_imm(masked, INT_TAG)
    }

    /// Turn a boolean flag into an Int cell of 0 or 1.
    fn flag_cell(&mut self, flag: Value) -> Value {
        let wide = self.builder.ins().uextend(types::I64, flag);
        self.builder.ins().bor_imm(wide, INT_TAG)
    }

    /// The fill-level guard before an allocating opcode: collect when
    /// the active semispace is nearly full, then bail out if the
    /// collection could not make room.
    fn gc_guard(&mut self, op: &'static str) {
        let gcc = self.load_reg(self.gc_count_ptr);
        let odd = self.builder.ins().band_imm(gcc, 1);
        let offset = self.builder.ins().imul_imm(odd, self.heap_half);
        let hp = self.load_reg(self.hp_ptr);
        let fill = self.builder.ins().isub(hp, offset);
        let needs = self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedGreaterThan, fill, self.heap_half - 3);
        let run = self.builder.create_block();
        let cont = self.builder.create_block();
        self.builder.ins().brif(needs, run, &[], cont, &[]);

        self.builder.switch_to_block(run);
        let vm = self.iconst(self.vm_ptr);
        self.call_func(self.gc_func, &[vm]);
        // a collection that frees nothing leaves the space full
        let gcc2 = self.load_reg(self.gc_count_ptr);
        let odd2 = self.builder.ins().band_imm(gcc2, 1);
        let offset2 = self.builder.ins().imul_imm(odd2, self.heap_half);
        let hp2 = self.load_reg(self.hp_ptr);
        let fill2 = self.builder.ins().isub(hp2, offset2);
        let full = self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedGreaterThan, fill2, self.heap_half - 3);
        let exhausted = self.builder.create_block();
        self.builder.ins().brif(full, exhausted, &[], cont, &[]);
        self.builder.switch_to_block(exhausted);
        let index = self.panics.index_of(VmError::HeapExhausted { op });
        let vm = self.iconst(self.vm_ptr);
        let ix = self.iconst(index);
        self.call_func(self.panic_func, &[vm, ix]);
        self.builder.ins().return_(&[]);

        self.builder.switch_to_block(cont);
    }

    /// Jump to the block for an absolute pc, or return when the target
    /// is one past the end (the interpreter's loop exit).
    fn jump_to_pc(&mut self, target: i64, op: &'static str) {
        if target < 0 {
            self.emit_panic(VmError::BadJump { op, target });
            return;
        }
        if target as usize >= self.program.len() {
            self.builder.ins().return_(&[]);
            self.terminated = true;
            return;
        }
        match self.labels.get(target as usize) {
            Some(ix) => {
                let block = self.label_blocks[ix];
                self.builder.ins().jump(block, &[]);
                self.terminated = true;
            }
            // every branch target is in the label map by construction
            None => self.emit_panic(VmError::BadJump { op, target }),
        }
    }

    // --- the translation drive -------------------------------------------

    fn translate(&mut self) -> JitResult<()> {
        let entry = self.builder.create_block();
        self.builder
            .append_block_params_for_function_params(entry);
        self.builder.switch_to_block(entry);

        let ops: Vec<Op> = self.program.ops().to_vec();
        for (pc, op) in ops.iter().enumerate() {
            if let Some(ix) = self.labels.get(pc) {
                let block = self.label_blocks[ix];
                if !self.terminated {
                    self.builder.ins().jump(block, &[]);
                }
                self.builder.switch_to_block(block);
                self.terminated = false;
            }
            if self.terminated {
                // unreachable tail of a block, e.g. ops after RJMP
                continue;
            }
            self.translate_op(pc, op)?;
        }
        if !self.terminated {
            self.builder.ins().return_(&[]);
        }

        // the computed-jump dispatcher; the selector travels through a
        // VM scratch slot so the dispatch block needs no parameters
        self.builder.switch_to_block(self.dispatch);
        let selector = self.load_reg(self.selector_ptr);
        let mut switch = Switch::new();
        for (ix, block) in self.label_blocks.clone().into_iter().enumerate() {
            switch.set_entry(ix as u128, block);
        }
        switch.emit(self.builder, selector, self.bad_dispatch);

        self.builder.switch_to_block(self.bad_dispatch);
        let index = self.panics.index_of(VmError::BadJump {
            op: "RET",
            target: -1,
        });
        let vm = self.iconst(self.vm_ptr);
        let ix = self.iconst(index);
        self.call_func(self.panic_func, &[vm, ix]);
        self.builder.ins().return_(&[]);
        Ok(())
    }

    fn translate_op(&mut self, pc: usize, op: &Op) -> JitResult<()> {
        match op {
            Op::Cons => self.gc_guard("CONS"),
            Op::Def => self.gc_guard("DEF"),
            Op::StoreEnv => self.gc_guard("STOREENV"),
            _ => {}
        }
        match op {
            Op::Nop => {}
            Op::Unknown(m) => {
                if self.strict {
                    self.emit_panic(VmError::UnknownOpcode(m.to_string()));
                }
            }
            Op::Fin => {
                self.builder.ins().return_(&[]);
                self.terminated = true;
            }
            Op::Gc => {
                let vm = self.iconst(self.vm_ptr);
                self.call_func(self.gc_func, &[vm]);
            }
            Op::Pop => {
                self.need(1, "POP");
                let sp = self.load_reg(self.sp_ptr);
                let sp1 = self.builder.ins().iadd_imm(sp, -1);
                self.store_reg(self.sp_ptr, sp1);
            }
            Op::PushCi(n) => self.push_const(Cell::int(*n).raw(), "PUSHCI"),
            Op::PushS(s) => self.push_const(Cell::sym(*s).raw(), "PUSHS"),
            Op::PushNil => self.push_const(Cell::NIL.raw(), "PUSHNIL"),
            Op::PushL(k) => self.translate_pushl(*k)?,
            Op::PushFs(k) => {
                let k = *k as i64;
                self.need(k + 1, "PUSHFS");
                self.room(1, "PUSHFS");
                let sp = self.load_reg(self.sp_ptr);
                let src = self.builder.ins().iadd_imm(sp, -(k + 1));
                let value = self.stack_load(src);
                self.stack_store(sp, value);
                let sp1 = self.builder.ins().iadd_imm(sp, 1);
                self.store_reg(self.sp_ptr, sp1);
            }
            Op::PushFp(k) => {
                let k = *k as i64;
                self.room(1, "PUSHFP");
                let fp = self.load_reg(self.fp_ptr);
                let src = self.builder.ins().iadd_imm(fp, k);
                let sp = self.load_reg(self.sp_ptr);
                let in_range = self.builder.ins().icmp(IntCC::UnsignedLessThan, src, sp);
                self.guard(in_range, VmError::StackUnderflow { op: "PUSHFP" });
                let value = self.stack_load(src);
                self.stack_store(sp, value);
                let sp1 = self.builder.ins().iadd_imm(sp, 1);
                self.store_reg(self.sp_ptr, sp1);
            }
            Op::Prn => {
                self.need(1, "PRN");
                let sp = self.load_reg(self.sp_ptr);
                let sp1 = self.builder.ins().iadd_imm(sp, -1);
                self.store_reg(self.sp_ptr, sp1);
                let value = self.stack_load(sp1);
                let vm = self.iconst(self.vm_ptr);
                self.call_func(self.print_func, &[vm, value]);
            }
            Op::Prnl => {
                let newline = Cell::from_raw(((Tag::String as u64) << 60) | b'\n' as u64);
                let vm = self.iconst(self.vm_ptr);
                let cell = self.iconst(newline.raw() as i64);
                self.call_func(self.print_func, &[vm, cell]);
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => self.translate_arith(op),
            Op::Lt => {
                self.need(2, "LT");
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let under = self.builder.ins().iadd_imm(sp, -2);
                let x = self.stack_load(top);
                let y = self.stack_load(under);
                self.check_tag(x, Tag::Int, "LT", "type mismatch");
                self.check_tag(y, Tag::Int, "LT", "type mismatch");
                let sx = self.payload_signed(x);
                let sy = self.payload_signed(y);
                let flag = self.builder.ins().icmp(IntCC::SignedLessThan, sy, sx);
                let cell = self.flag_cell(flag);
                self.stack_store(under, cell);
                self.store_reg(self.sp_ptr, top);
            }
            Op::Eq => {
                self.need(2, "EQ");
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let under = self.builder.ins().iadd_imm(sp, -2);
                let x = self.stack_load(top);
                let y = self.stack_load(under);
                let tx = self.builder.ins().ushr_imm(x, TAG_SHIFT);
                let ty = self.builder.ins().ushr_imm(y, TAG_SHIFT);
                let same = self.builder.ins().icmp(IntCC::Equal, tx, ty);
                self.guard(
                    same,
                    VmError::TypeMismatch {
                        op: "EQ",
                        detail: "type mismatch",
                    },
                );
                let not_pair = self
                    .builder
                    .ins()
                    .icmp_imm(IntCC::NotEqual, tx, Tag::Pair as i64);
                self.guard(
                    not_pair,
                    VmError::TypeMismatch {
                        op: "EQ",
                        detail: "comparing pairs is not supported",
                    },
                );
                let comparable = self.builder.ins().icmp_imm(
                    IntCC::UnsignedLessThanOrEqual,
                    tx,
                    Tag::Lambda as i64,
                );
                self.guard(
                    comparable,
                    VmError::TypeMismatch {
                        op: "EQ",
                        detail: "comparing pairs is not supported",
                    },
                );
                // lambdas compare by code address only; every other
                // comparable tag by full payload
                let is_lambda = self
                    .builder
                    .ins()
                    .icmp_imm(IntCC::Equal, tx, Tag::Lambda as i64);
                let addr_mask = self.iconst(0xFFFF_FFFF);
                let payload_mask = self.iconst(PAYLOAD_MASK as i64);
                let mask = self.builder.ins().select(is_lambda, addr_mask, payload_mask);
                let px = self.builder.ins().band(x, mask);
                let py = self.builder.ins().band(y, mask);
                let flag = self.builder.ins().icmp(IntCC::Equal, px, py);
                let cell = self.flag_cell(flag);
                self.stack_store(under, cell);
                self.store_reg(self.sp_ptr, top);
            }
            Op::Eqt => {
                self.need(2, "EQT");
                self.room(1, "EQT");
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let under = self.builder.ins().iadd_imm(sp, -2);
                let x = self.stack_load(top);
                let y = self.stack_load(under);
                let tx = self.builder.ins().ushr_imm(x, TAG_SHIFT);
                let ty = self.builder.ins().ushr_imm(y, TAG_SHIFT);
                let flag = self.builder.ins().icmp(IntCC::Equal, tx, ty);
                let cell = self.flag_cell(flag);
                self.stack_store(sp, cell);
                let sp1 = self.builder.ins().iadd_imm(sp, 1);
                self.store_reg(self.sp_ptr, sp1);
            }
            Op::Eqsi(s) => {
                self.need(1, "EQSI");
                self.room(1, "EQSI");
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let x = self.stack_load(top);
                self.check_tag(x, Tag::String, "EQSI", "type mismatch");
                let flag =
                    self.builder
                        .ins()
                        .icmp_imm(IntCC::Equal, x, Cell::sym(*s).raw() as i64);
                let cell = self.flag_cell(flag);
                self.stack_store(sp, cell);
                let sp1 = self.builder.ins().iadd_imm(sp, 1);
                self.store_reg(self.sp_ptr, sp1);
            }
            Op::Cons => {
                self.need(2, "CONS");
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let under = self.builder.ins().iadd_imm(sp, -2);
                let x = self.stack_load(top);
                let y = self.stack_load(under);
                let hp = self.load_reg(self.hp_ptr);
                let hp1 = self.builder.ins().iadd_imm(hp, 1);
                self.heap_store(hp, x);
                self.heap_store(hp1, y);
                let hp2 = self.builder.ins().iadd_imm(hp, 2);
                self.store_reg(self.hp_ptr, hp2);
                let right = self.builder.ins().ishl_imm(hp1, 30);
                let pair = self.builder.ins().bor(hp, right);
                let pair = self.builder.ins().bor_imm(pair, PAIR_TAG);
                self.stack_store(under, pair);
                self.store_reg(self.sp_ptr, top);
            }
            Op::Car | Op::Cdr | Op::PushCar | Op::PushCdr => {
                let (name, keep, car): (&'static str, bool, bool) = match op {
                    Op::Car => ("CAR", false, true),
                    Op::Cdr => ("CDR", false, false),
                    Op::PushCar => ("PUSHCAR", true, true),
                    _ => ("PUSHCDR", true, false),
                };
                self.need(1, name);
                if keep {
                    self.room(1, name);
                }
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let pair = self.stack_load(top);
                self.check_tag(pair, Tag::Pair, name, "type mismatch");
                let index = if car {
                    self.builder.ins().band_imm(pair, LEFT_MASK)
                } else {
                    let payload = self.builder.ins().band_imm(pair, PAYLOAD_MASK as i64);
                    self.builder.ins().ushr_imm(payload, 30)
                };
                let child = self.heap_load(index);
                if keep {
                    self.stack_store(sp, child);
                    let sp1 = self.builder.ins().iadd_imm(sp, 1);
                    self.store_reg(self.sp_ptr, sp1);
                } else {
                    self.stack_store(top, child);
                }
            }
            Op::Def => {
                self.need(1, "DEF");
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let defpair = self.stack_load(top);
                self.check_tag(defpair, Tag::Pair, "DEF", "type mismatch");
                let ep = self.load_reg(self.ep_ptr);
                let env = self.heap_load(ep);
                let hp = self.load_reg(self.hp_ptr);
                let hp1 = self.builder.ins().iadd_imm(hp, 1);
                self.heap_store(hp, defpair);
                self.heap_store(hp1, env);
                let hp2 = self.builder.ins().iadd_imm(hp, 2);
                self.store_reg(self.hp_ptr, hp2);
                let right = self.builder.ins().ishl_imm(hp1, 30);
                let new_env = self.builder.ins().bor(hp, right);
                let new_env = self.builder.ins().bor_imm(new_env, PAIR_TAG);
                self.heap_store(ep, new_env);
                // the defined name replaces the pair as the form value
                let left = self.builder.ins().band_imm(defpair, LEFT_MASK);
                let name_cell = self.heap_load(left);
                self.stack_store(top, name_cell);
            }
            Op::LoadEnv => {
                self.room(1, "LOADENV");
                let sp = self.load_reg(self.sp_ptr);
                let ep = self.load_reg(self.ep_ptr);
                let env = self.heap_load(ep);
                self.stack_store(sp, env);
                let sp1 = self.builder.ins().iadd_imm(sp, 1);
                self.store_reg(self.sp_ptr, sp1);
            }
            Op::StoreEnv => {
                self.need(1, "STOREENV");
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let value = self.stack_load(top);
                let hp = self.load_reg(self.hp_ptr);
                self.heap_store(hp, value);
                self.store_reg(self.ep_ptr, hp);
                let hp1 = self.builder.ins().iadd_imm(hp, 1);
                self.store_reg(self.hp_ptr, hp1);
                self.store_reg(self.sp_ptr, top);
            }
            Op::Rjmp(d) => self.jump_to_pc(pc as i64 + *d as i64, "RJMP"),
            Op::Rjz(d) | Op::Rjnz(d) => {
                let name = if matches!(op, Op::Rjz(_)) { "RJZ" } else { "RJNZ" };
                self.need(1, name);
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let value = self.stack_load(top);
                self.check_tag(value, Tag::Int, name, "type mismatch");
                let payload = self.builder.ins().band_imm(value, PAYLOAD_MASK as i64);
                let taken_block = self.builder.create_block();
                let cont = self.builder.create_block();
                if matches!(op, Op::Rjz(_)) {
                    self.builder
                        .ins()
                        .brif(payload, cont, &[], taken_block, &[]);
                } else {
                    self.builder
                        .ins()
                        .brif(payload, taken_block, &[], cont, &[]);
                }
                self.builder.switch_to_block(taken_block);
                self.terminated = false;
                self.jump_to_pc(pc as i64 + *d as i64, name);
                self.builder.switch_to_block(cont);
                self.terminated = false;
            }
            Op::Call => self.translate_call(pc),
            Op::Ret(n) => self.translate_ret(*n),
            Op::Swap(k) => {
                let k = *k as i64;
                self.need(k + 2, "SWAP");
                let sp = self.load_reg(self.sp_ptr);
                let top = self.builder.ins().iadd_imm(sp, -1);
                let other = self.builder.ins().iadd_imm(sp, -(k + 2));
                let a = self.stack_load(top);
                let b = self.stack_load(other);
                self.stack_store(top, b);
                self.stack_store(other, a);
            }
        }
        Ok(())
    }

    fn push_const(&mut self, raw: u64, op: &'static str) {
        self.room(1, op);
        let sp = self.load_reg(self.sp_ptr);
        let value = self.iconst(raw as i64);
        self.stack_store(sp, value);
        let sp1 = self.builder.ins().iadd_imm(sp, 1);
        self.store_reg(self.sp_ptr, sp1);
    }

    fn translate_pushl(&mut self, k: i64) -> JitResult<()> {
        if k == -1 {
            self.push_const(Cell::lambda(0, HeapIx::NIL).raw(), "PUSHL");
            return Ok(());
        }
        if k < 0 || k as usize >= self.program.len() {
            self.emit_panic(VmError::BadOperand { op: "PUSHL", value: k });
            return Ok(());
        }
        let Some(label) = self.labels.get(k as usize) else {
            return Err(JitError::Compilation(format!(
                "lambda at pc {k} has no entry in the jump table"
            )));
        };
        self.room(1, "PUSHL");
        // closure cell: label index in the address field, the current
        // env in the high field
        let base = Cell::lambda(label as u32, HeapIx::NIL).raw();
        let base = self.iconst(base as i64);
        let ep = self.load_reg(self.ep_ptr);
        let shifted = self.builder.ins().ishl_imm(ep, 32);
        let cell = self.builder.ins().bor(base, shifted);
        let sp = self.load_reg(self.sp_ptr);
        self.stack_store(sp, cell);
        let sp1 = self.builder.ins().iadd_imm(sp, 1);
        self.store_reg(self.sp_ptr, sp1);
        Ok(())
    }

    fn translate_arith(&mut self, op: &Op) {
        let name: &'static str = match op {
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            _ => "MOD",
        };
        self.need(2, name);
        let sp = self.load_reg(self.sp_ptr);
        let top = self.builder.ins().iadd_imm(sp, -1);
        let under = self.builder.ins().iadd_imm(sp, -2);
        let x = self.stack_load(top);
        let y = self.stack_load(under);
        self.check_tag(x, Tag::Int, name, "type mismatch");
        self.check_tag(y, Tag::Int, name, "type mismatch");
        let sx = self.payload_signed(x);
        let sy = self.payload_signed(y);
        let result = match op {
            Op::Add => self.builder.ins().iadd(sy, sx),
            Op::Sub => self.builder.ins().isub(sy, sx),
            Op::Mul => self.builder.ins().imul(sy, sx),
            Op::Div | Op::Mod => {
                let nonzero = self.builder.ins().icmp_imm(IntCC::NotEqual, sx, 0);
                self.guard(nonzero, VmError::DivisionByZero { op: name });
                if matches!(op, Op::Div) {
                    self.builder.ins().sdiv(sy, sx)
                } else {
                    self.builder.ins().srem(sy, sx)
                }
            }
            _ => unreachable!(),
        };
        let cell = self.int_cell(result);
        self.stack_store(under, cell);
        self.store_reg(self.sp_ptr, top);
    }

    fn translate_call(&mut self, pc: usize) {
        self.need(1, "CALL");
        self.room(2, "CALL");
        let sp = self.load_reg(self.sp_ptr);
        let top = self.builder.ins().iadd_imm(sp, -1);
        let lambda = self.stack_load(top);
        self.check_tag(lambda, Tag::Lambda, "CALL", "type mismatch");
        let high = self.builder.ins().ushr_imm(lambda, 32);
        let lam_env = self.builder.ins().band_imm(high, ENV_FIELD_MASK);
        let bound = self.builder.ins().icmp_imm(IntCC::NotEqual, lam_env, 0);
        self.guard(
            bound,
            VmError::TypeMismatch {
                op: "CALL",
                detail: "lambda has no bound env",
            },
        );
        let Some(ret_label) = self.labels.get(pc + 1) else {
            // a CALL as the very last instruction has nowhere to return
            self.emit_panic(VmError::BadJump {
                op: "CALL",
                target: pc as i64 + 1,
            });
            return;
        };
        // saved return address: label index plus the caller's frame
        // pointer in the high field
        let ip_base = self.iconst(IP_TAG | ret_label as i64);
        let fp = self.load_reg(self.fp_ptr);
        let fp_high = self.builder.ins().ishl_imm(fp, 32);
        let ip_cell = self.builder.ins().bor(ip_base, fp_high);
        self.stack_store(sp, ip_cell);
        let ep = self.load_reg(self.ep_ptr);
        let env_cell = self.builder.ins().bor_imm(ep, ENV_TAG);
        let sp1 = self.builder.ins().iadd_imm(sp, 1);
        self.stack_store(sp1, env_cell);
        let sp2 = self.builder.ins().iadd_imm(sp, 2);
        self.store_reg(self.sp_ptr, sp2);
        self.store_reg(self.ep_ptr, lam_env);
        // frame pointer: the callee's last argument slot
        let fp_new = self.builder.ins().iadd_imm(sp2, -4);
        let zero = self.iconst(0);
        let fp_new = self.builder.ins().smax(fp_new, zero);
        self.store_reg(self.fp_ptr, fp_new);
        let addr = self.builder.ins().band_imm(lambda, 0xFFFF_FFFF);
        self.store_reg(self.selector_ptr, addr);
        self.builder.ins().jump(self.dispatch, &[]);
        self.terminated = true;
    }

    fn translate_ret(&mut self, n: u32) {
        let drop = n as i64 + 1;
        self.need(2 + drop, "RET");
        let sp = self.load_reg(self.sp_ptr);
        let top = self.builder.ins().iadd_imm(sp, -1);
        let under = self.builder.ins().iadd_imm(sp, -2);
        let env_cell = self.stack_load(top);
        self.check_tag(env_cell, Tag::Environment, "RET", "type mismatch");
        let ip_cell = self.stack_load(under);
        self.check_tag(ip_cell, Tag::InstructionPointer, "RET", "type mismatch");
        let ep = self.builder.ins().band_imm(env_cell, ENV_FIELD_MASK);
        self.store_reg(self.ep_ptr, ep);
        let high = self.builder.ins().ushr_imm(ip_cell, 32);
        let fp = self.builder.ins().band_imm(high, ENV_FIELD_MASK);
        self.store_reg(self.fp_ptr, fp);
        let sp_after = self.builder.ins().iadd_imm(sp, -(2 + drop));
        self.store_reg(self.sp_ptr, sp_after);
        let label = self.builder.ins().band_imm(ip_cell, 0xFFFF_FFFF);
        self.store_reg(self.selector_ptr, label);
        self.builder.ins().jump(self.dispatch, &[]);
        self.terminated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_source;
    use crate::vm::VmConfig;

    fn run_both(src: &str, config: &VmConfig) -> (Vec<u8>, Vec<u8>) {
        let program = compile_source(src, false).unwrap();
        let mut interp = Vm::new(config);
        interp.capture_output();
        interp.run(&program).unwrap();

        let mut native = Vm::new(config);
        native.capture_output();
        run_jit(&mut native, &program).unwrap();
        (interp.take_output(), native.take_output())
    }

    #[test]
    fn native_matches_interpreter_on_arithmetic() {
        let (a, b) = run_both("(print (+ 8 (- 10 3)))", &VmConfig::default());
        assert_eq!(a, b"15");
        assert_eq!(a, b);
    }

    #[test]
    fn native_matches_interpreter_on_calls() {
        let src = "(define fact (lambda (n) (cond (eq n 0) 1 (1) (* n (fact (- n 1)))))) \
                   (print (fact 6))";
        let (a, b) = run_both(src, &VmConfig::default());
        assert_eq!(a, b"720");
        assert_eq!(a, b);
    }

    #[test]
    fn native_matches_interpreter_on_closures() {
        let src = "(define mk (lambda (x) (lambda (y) (+ x y)))) \
                   (define f (mk 10)) (print (f 32))";
        let (a, b) = run_both(src, &VmConfig::default());
        assert_eq!(a, b"42");
        assert_eq!(a, b);
    }

    #[test]
    fn native_runs_the_collector() {
        let src = "(define loop (lambda (i) (cond (eq i 0) 7 (1) \
                   (begin (cons i Nil) (loop (- i 1)))))) (print (loop 30))";
        let config = VmConfig {
            heap_size: 400,
            ..VmConfig::default()
        };
        let program = compile_source(src, false).unwrap();
        let mut vm = Vm::new(&config);
        vm.capture_output();
        run_jit(&mut vm, &program).unwrap();
        assert_eq!(vm.take_output(), b"7");
        assert!(vm.heap().gc_count() >= 1);
    }

    #[test]
    fn native_panics_surface_as_vm_errors() {
        let program = compile_source("(/ 1 0)", false).unwrap();
        let mut vm = Vm::new(&VmConfig::default());
        vm.capture_output();
        let err = run_jit(&mut vm, &program).unwrap_err();
        assert!(matches!(
            err,
            JitError::Vm(VmError::DivisionByZero { op: "DIV" })
        ));
    }
}
