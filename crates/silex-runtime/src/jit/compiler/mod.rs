//! Tier-0 IL compiler
//!
//! One linear pass over the bytecode producing naive, correct x64. Every
//! value lives in frame memory: the evaluation stack is a slot array
//! below the locals, each push a store and each pop a load, with rax (and
//! xmm0) as the only scratch top-of-stack. Correctness over speed.
//!
//! Frame shape (offsets from rbp):
//!
//! ```text
//!   +16+8k   argument slot k (register args homed, stack args in place)
//!   +8       return address
//!    0       saved rbp
//!   -8..-56  saved rbx, rdi, rsi, r12..r15
//!   -56-L    locals (fixed slots, 64 bytes minimum each)
//!   below    evaluation-stack slots, slot j at eval_base - 8j
//!   rsp..    outgoing call area (32-byte shadow + stack args)
//! ```
//!
//! The frame allocation is emitted with a placeholder and patched once
//! the body's high-water marks are known; rsp never moves inside a body,
//! so every slot has a fixed rbp-relative address and the unwind info is
//! one canonical shape.

pub mod objects;
pub mod ops;
pub mod stack;

use crate::codemap::{CodeMap, CompiledCode, FuncletInfo, FuncletKind};
use crate::eh::{NativeClauseKind, NativeEhClause};
use crate::error::{CompileError, Result, RuntimeError};
use crate::gc::stackmap::StackMapBuilder;
use crate::jit::code_heap::CodeHeap;
use crate::jit::emitter::{Cc, CodeEmitter, Gpr, Mem, PatchSite, Xmm};
use crate::jit::registry::MethodCell;
use crate::jit::thunks::HelperBridges;
use crate::assembly::loader::TypeLoader;
use crate::types::MethodTable;
use crate::unwind::UnwindInfo;
use rustc_hash::FxHashMap;
use self::stack::{EvalStack, EvalTag, Item};
use silex_metadata::{
    Decoder, EhClauseKind, Instruction, LocalsSig, MethodBody, MethodSig, Op, Token, TypeSig,
};
use std::sync::Arc;

/// Everything the compiler needs from the surrounding runtime.
pub struct CompileEnv<'a> {
    pub loader: &'a TypeLoader,
    pub bridges: HelperBridges,
    /// Address of the GC trap byte polled at loop back-edges.
    pub trap_flag: usize,
    /// Get-or-create the registry cell (and trampoline) for a method.
    pub reserve: &'a dyn Fn(u32, u32) -> Arc<MethodCell>,
}

/// Well-known throw kinds for `helper_throw_wellknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThrowKind {
    NullReference = 0,
    IndexOutOfRange = 1,
    Overflow = 2,
    DivideByZero = 3,
    InvalidCast = 4,
    StackOverflow = 5,
    OutOfMemory = 6,
    CompilationFailed = 7,
    InvalidOperation = 8,
}

const SAVED_BYTES: i32 = 56;
const ARG_BASE: i32 = 16;
const SHADOW: u32 = 0x20;

/// Kind of one planned argument slot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanKind {
    /// Integer family in one slot.
    Gpr(EvalTag),
    F32,
    F64,
    /// Value type spread across consecutive slots.
    ValueSlots,
    /// Large value type passed as a pointer to a caller copy.
    ValuePointer,
    /// Hidden return-buffer pointer.
    RetBuf,
}

#[derive(Debug, Clone)]
struct PlanArg {
    first_slot: u32,
    count: u32,
    kind: PlanKind,
    size: u32,
    vt: Option<&'static MethodTable>,
    is_ref: bool,
}

/// How a call's result comes back.
#[derive(Debug, Clone)]
enum RetKind {
    Void,
    Gpr(EvalTag),
    F32,
    F64,
    /// ≤ 8-byte value type in the accumulator.
    ValueInAcc(&'static MethodTable, u32),
    /// 9–16-byte value type in rax:rdx.
    ValueInPair(&'static MethodTable, u32),
    /// Larger value types through the hidden buffer.
    ValueBuffered(&'static MethodTable, u32),
}

#[derive(Debug, Clone)]
struct CallPlan {
    args: Vec<PlanArg>,
    total_slots: u32,
    ret: RetKind,
}

#[derive(Debug, Clone)]
struct LocalSlot {
    /// rbp-relative offset of the value base (bytes ascend from here).
    offset: i32,
    size: u32,
    tag: EvalTag,
    vt: Option<&'static MethodTable>,
    is_ref: bool,
    /// Value-relative reference runs for value-type locals.
    ref_slots: Vec<u32>,
}

/// A funclet pending emission.
struct PendingFunclet {
    clause_index: usize,
    kind: FuncletKind,
    il_begin: u32,
    il_end: u32,
}

struct EmittedFunclet {
    clause_index: usize,
    kind: FuncletKind,
    begin: u32,
    end: u32,
    frame_patch: usize,
    /// Parity the funclet's rsp needs at call sites: jumped-into catch
    /// funclets enter with rsp ≡ 0 (mod 16), called funclets with ≡ 8.
    entered_by_jump: bool,
}

/// The per-method compiler.
pub struct MethodCompiler<'a> {
    env: &'a CompileEnv<'a>,
    assembly: u32,
    token: u32,
    name: String,
    sig: MethodSig,
    e: CodeEmitter,
    stack: EvalStack,
    own_plan: CallPlan,
    locals: Vec<LocalSlot>,
    locals_bytes: u32,
    /// rbp-relative offset of evaluation slot 0.
    eval_base: i32,
    frame_patch: usize,
    max_extra_out: u32,
    max_eval_slots: u32,
    il2native: FxHashMap<u32, u32>,
    entry_states: FxHashMap<u32, EvalStack>,
    branch_states: FxHashMap<u32, EvalStack>,
    fixups: Vec<(PatchSite, u32)>,
    funclet_call_fixups: Vec<(PatchSite, usize)>,
    smap: StackMapBuilder,
    fixed_live: Vec<usize>,
    clauses: Vec<silex_metadata::EhClause>,
    unreachable: bool,
    constrained: Option<Token>,
    /// Set while compiling a funclet body (clause index).
    in_funclet: Option<usize>,
    /// `add rsp, imm32` sites of the funclet currently being compiled.
    funclet_epilogue_patches: Vec<usize>,
    /// Per-funclet frame-size immediates awaiting the final patch:
    /// (prologue site, epilogue sites, entered-by-jump parity).
    pending_funclet_imm_patches: Vec<(usize, Vec<usize>, bool)>,
}

impl<'a> MethodCompiler<'a> {
    fn tag_of(sig: &TypeSig) -> EvalTag {
        match sig {
            TypeSig::Bool
            | TypeSig::Char
            | TypeSig::I1
            | TypeSig::U1
            | TypeSig::I2
            | TypeSig::U2
            | TypeSig::I4
            | TypeSig::U4 => EvalTag::I32,
            TypeSig::I8 | TypeSig::U8 => EvalTag::I64,
            TypeSig::I | TypeSig::U => EvalTag::NInt,
            TypeSig::R4 => EvalTag::Float32,
            TypeSig::R8 => EvalTag::Float64,
            TypeSig::ByRef(_) | TypeSig::Ptr(_) | TypeSig::FnPtr(_) => EvalTag::Ptr,
            s if s.is_reference() => EvalTag::Ref,
            _ => EvalTag::Value,
        }
    }

    /// Build the slot plan for a signature in its owning assembly.
    fn build_plan(&self, owner: u32, sig: &MethodSig) -> Result<CallPlan> {
        let mut args = Vec::new();
        let mut slot = 0u32;

        let ret = match &sig.ret {
            TypeSig::Void => RetKind::Void,
            TypeSig::R4 => RetKind::F32,
            TypeSig::R8 => RetKind::F64,
            s if Self::tag_of(s) != EvalTag::Value => RetKind::Gpr(Self::tag_of(s)),
            s => {
                let shape = self.env.loader.shape_of(owner, s, None)?;
                let mt = shape.mt.ok_or(RuntimeError::Compile(
                    CompileError::UnresolvedToken(Token(0), "return value type"),
                ))?;
                if shape.size <= 8 {
                    RetKind::ValueInAcc(mt, shape.size)
                } else if shape.size <= 16 {
                    RetKind::ValueInPair(mt, shape.size)
                } else {
                    // Caller allocates the hidden buffer; it displaces
                    // `this`/arg0 by one slot.
                    args.push(PlanArg {
                        first_slot: slot,
                        count: 1,
                        kind: PlanKind::RetBuf,
                        size: 8,
                        vt: Some(mt),
                        is_ref: false,
                    });
                    slot += 1;
                    RetKind::ValueBuffered(mt, shape.size)
                }
            }
        };

        if sig.has_this {
            args.push(PlanArg {
                first_slot: slot,
                count: 1,
                kind: PlanKind::Gpr(EvalTag::Ref),
                size: 8,
                vt: None,
                is_ref: true,
            });
            slot += 1;
        }

        for param in &sig.params {
            let tag = Self::tag_of(param);
            let arg = match tag {
                EvalTag::Float32 => PlanArg {
                    first_slot: slot,
                    count: 1,
                    kind: PlanKind::F32,
                    size: 4,
                    vt: None,
                    is_ref: false,
                },
                EvalTag::Float64 => PlanArg {
                    first_slot: slot,
                    count: 1,
                    kind: PlanKind::F64,
                    size: 8,
                    vt: None,
                    is_ref: false,
                },
                EvalTag::Value => {
                    let shape = self.env.loader.shape_of(owner, param, None)?;
                    let vt = shape.mt;
                    if shape.size <= 16 {
                        let count = (shape.size.max(1) + 7) / 8;
                        PlanArg {
                            first_slot: slot,
                            count,
                            kind: PlanKind::ValueSlots,
                            size: shape.size,
                            vt,
                            is_ref: false,
                        }
                    } else {
                        PlanArg {
                            first_slot: slot,
                            count: 1,
                            kind: PlanKind::ValuePointer,
                            size: shape.size,
                            vt,
                            is_ref: false,
                        }
                    }
                }
                tag => PlanArg {
                    first_slot: slot,
                    count: 1,
                    kind: PlanKind::Gpr(tag),
                    size: 8,
                    vt: None,
                    is_ref: tag == EvalTag::Ref,
                },
            };
            slot += arg.count;
            args.push(arg);
        }

        Ok(CallPlan {
            args,
            total_slots: slot,
            ret,
        })
    }

    /// Logical ldarg index → plan index (skipping a hidden ret buffer).
    fn plan_arg(&self, index: u16) -> Result<&PlanArg> {
        let skip = usize::from(matches!(self.own_plan.ret, RetKind::ValueBuffered(..)));
        self.own_plan
            .args
            .get(skip + index as usize)
            .ok_or(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "argument index out of range",
            )))
    }

    fn arg_home(slot: u32) -> Mem {
        Mem::disp(Gpr::Rbp, ARG_BASE + 8 * slot as i32)
    }

    /// Frame-relative offset of evaluation slot `slot`.
    fn slot_off(&self, slot: u32) -> i32 {
        EvalStack::slot_offset(slot, self.eval_base)
    }

    /// Value-base offset of the item `n` below the top.
    fn item_off(&self, n: usize) -> i32 {
        self.stack.value_offset(n, self.eval_base)
    }

    fn item_mem(&self, n: usize) -> Mem {
        Mem::disp(Gpr::Rbp, self.item_off(n))
    }

    fn note_eval_depth(&mut self) {
        self.max_eval_slots = self.max_eval_slots.max(self.stack.depth_slots());
    }

    // ---- push/pop code emission ----

    fn push_gpr(&mut self, tag: EvalTag, reg: Gpr) {
        self.stack.push(Item::scalar(tag));
        self.note_eval_depth();
        let mem = self.item_mem(0);
        self.e.mov_mr(mem, reg);
    }

    fn pop_gpr(&mut self, reg: Gpr) -> Result<Item> {
        let mem = self.item_mem(0);
        self.e.mov_rm(reg, mem);
        let item = self.stack.pop().ok_or(RuntimeError::Compile(
            CompileError::StackUnderflow(0),
        ))?;
        if !item.tag.is_gpr() {
            return Err(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "expected an integer-family operand",
            )));
        }
        Ok(item)
    }

    fn push_f64(&mut self, reg: Xmm) {
        self.stack.push(Item::scalar(EvalTag::Float64));
        self.note_eval_depth();
        let mem = self.item_mem(0);
        self.e.movsd_mr(mem, reg);
    }

    fn push_f32(&mut self, reg: Xmm) {
        self.stack.push(Item::scalar(EvalTag::Float32));
        self.note_eval_depth();
        let mem = self.item_mem(0);
        self.e.movss_mr(mem, reg);
    }

    /// Pop a float operand into `reg` as f64, promoting f32.
    fn pop_float_as_f64(&mut self, reg: Xmm) -> Result<Item> {
        let mem = self.item_mem(0);
        let item = self.stack.pop().ok_or(RuntimeError::Compile(
            CompileError::StackUnderflow(0),
        ))?;
        match item.tag {
            EvalTag::Float64 => self.e.movsd_rm(reg, mem),
            EvalTag::Float32 => {
                self.e.movss_rm(reg, mem);
                self.e.cvtss2sd(reg, reg);
            }
            _ => {
                return Err(RuntimeError::Compile(CompileError::StackMismatch(
                    0,
                    "expected a float operand",
                )))
            }
        }
        Ok(item)
    }

    /// Push a value-type item and return its value-base offset.
    fn push_value(&mut self, vt: &'static MethodTable, size: u32) -> i32 {
        self.stack.push(Item::value(vt, size));
        self.note_eval_depth();
        self.item_off(0)
    }

    /// Copy `size` bytes from [rsi-source] to [rdi-dest]. Clobbers rsi,
    /// rdi, rcx (all dead across Tier-0 statements).
    fn emit_copy(&mut self, dst: Mem, src: Mem, size: u32) {
        self.e.lea(Gpr::Rdi, dst);
        self.e.lea(Gpr::Rsi, src);
        self.e.mov_ri(Gpr::Rcx, size as i64);
        self.e.rep_movsb();
    }

    // ---- safepoints and helper calls ----

    /// Record a safepoint at the current offset (a call-return site).
    fn record_safepoint(&mut self) {
        let offset = self.e.offset() as u32;
        let mut live_ids: Vec<usize> = self.fixed_live.clone();
        for slot in self.stack.ref_slot_indices() {
            let off = self.slot_off(slot);
            live_ids.push(self.smap.frame_slot(off));
        }
        let mut mask = vec![false; self.smap.slot_count()];
        for id in live_ids {
            mask[id] = true;
        }
        self.smap.record_safepoint(offset, mask);
    }

    /// Call a runtime helper bridge; arguments must already be in place.
    fn helper_call(&mut self, bridge: usize) {
        self.e.mov_ri64(Gpr::Rax, bridge as u64);
        self.e.call_r(Gpr::Rax);
        self.record_safepoint();
    }

    /// Emit an unconditional well-known throw (never returns).
    fn emit_throw(&mut self, kind: ThrowKind) {
        self.e.mov_ri(Gpr::Rcx, kind as u32 as i64);
        let bridge = self.env.bridges.throw_wellknown;
        self.helper_call(bridge);
        self.e.ud2();
    }

    /// Branch over an inline throw when `cc` holds.
    fn emit_check(&mut self, ok: Cc, kind: ThrowKind) {
        let skip = self.e.jcc_forward(ok);
        self.emit_throw(kind);
        let target = self.e.offset();
        self.e.patch(skip, target);
    }

    /// Null-check the object reference in `reg`.
    fn emit_null_check(&mut self, reg: Gpr) {
        self.e.test_rr(reg, reg);
        self.emit_check(Cc::Ne, ThrowKind::NullReference);
    }

    /// Call through a method cell's entry word.
    fn emit_call_cell(&mut self, cell: &MethodCell) {
        self.e.mov_ri64(Gpr::Rax, cell.entry_slot_addr() as u64);
        self.e.call_m(Mem::base(Gpr::Rax));
        self.record_safepoint();
    }

    fn reserve(&self, assembly: u32, token: u32) -> Arc<MethodCell> {
        (self.env.reserve)(assembly, token)
    }

    // ---- managed call lowering ----

    /// Lower a call to `plan` whose argument values sit on top of the
    /// evaluation stack (last argument on top). `entry` emits the actual
    /// transfer once arguments are marshalled.
    fn lower_call(
        &mut self,
        plan: &CallPlan,
        virtual_slot: Option<u32>,
        cell: Option<&MethodCell>,
        fn_ptr_below_args: bool,
        null_check_this: bool,
    ) -> Result<()> {
        // The stack, top to bottom: [argN .. arg1, (this), (fnptr)].
        let arg_count = plan
            .args
            .iter()
            .filter(|a| a.kind != PlanKind::RetBuf)
            .count();
        if self.stack.len() < arg_count + usize::from(fn_ptr_below_args) {
            return Err(RuntimeError::Compile(CompileError::StackUnderflow(0)));
        }

        // Outgoing stack-arg surcharge for the frame.
        if plan.total_slots > 4 {
            self.max_extra_out = self.max_extra_out.max(plan.total_slots - 4);
        }

        // Where the return value region will start once args are popped.
        let args_slots: u32 = (0..arg_count).map(|i| self.stack.peek(i).unwrap().slots).sum();
        let fnptr_slots = u32::from(fn_ptr_below_args);
        let result_first_slot = self.stack.depth_slots() - args_slots - fnptr_slots;

        // Retbuf destination (the result item's future value base).
        let retbuf_off = match plan.ret {
            RetKind::ValueBuffered(_, size) => {
                let slots = (size + 7) / 8;
                Some(EvalStack::slot_offset(result_first_slot + slots - 1, self.eval_base))
            }
            _ => None,
        };

        // Emit stores slot-by-slot: stack slots first, registers last so
        // no argument register is clobbered while sourcing others.
        let mut moves: Vec<(u32, ArgMove)> = Vec::new();
        let mut source_index = 0usize;
        for plan_arg in &plan.args {
            match plan_arg.kind {
                PlanKind::RetBuf => {
                    moves.push((plan_arg.first_slot, ArgMove::Lea(retbuf_off.unwrap())));
                }
                PlanKind::ValuePointer => {
                    let item_index = arg_count - 1 - source_index;
                    let off = self.item_off(item_index);
                    moves.push((plan_arg.first_slot, ArgMove::Lea(off)));
                    source_index += 1;
                }
                PlanKind::ValueSlots => {
                    let item_index = arg_count - 1 - source_index;
                    let base = self.item_off(item_index);
                    for piece in 0..plan_arg.count {
                        moves.push((
                            plan_arg.first_slot + piece,
                            ArgMove::Load(base + 8 * piece as i32),
                        ));
                    }
                    source_index += 1;
                }
                PlanKind::F32 => {
                    let item_index = arg_count - 1 - source_index;
                    let off = self.item_off(item_index);
                    let promote = matches!(
                        self.stack.peek(item_index).map(|i| i.tag),
                        Some(EvalTag::Float64)
                    );
                    moves.push((plan_arg.first_slot, ArgMove::LoadF32(off, promote)));
                    source_index += 1;
                }
                PlanKind::F64 => {
                    let item_index = arg_count - 1 - source_index;
                    let off = self.item_off(item_index);
                    let from_f32 = matches!(
                        self.stack.peek(item_index).map(|i| i.tag),
                        Some(EvalTag::Float32)
                    );
                    moves.push((plan_arg.first_slot, ArgMove::LoadF64(off, from_f32)));
                    source_index += 1;
                }
                PlanKind::Gpr(_) => {
                    let item_index = arg_count - 1 - source_index;
                    let off = self.item_off(item_index);
                    moves.push((plan_arg.first_slot, ArgMove::Load(off)));
                    source_index += 1;
                }
            }
        }

        // Stack-passed slots first.
        for (slot, mv) in moves.iter().filter(|(s, _)| *s >= 4) {
            self.emit_arg_move(*mv, ArgDest::Stack(*slot));
        }
        // Then register slots.
        for (slot, mv) in moves.iter().filter(|(s, _)| *s < 4) {
            self.emit_arg_move(*mv, ArgDest::Reg(*slot));
        }

        // Virtual dispatch loads the entry from the receiver's vtable;
        // direct calls go through the cell; calli takes the pointer from
        // the stack (below the arguments).
        let fnptr_off = if fn_ptr_below_args {
            Some(self.item_off(arg_count))
        } else {
            None
        };

        // Pop argument items (and the function pointer for calli).
        for _ in 0..arg_count + usize::from(fn_ptr_below_args) {
            self.stack.pop();
        }

        match (virtual_slot, cell, fnptr_off) {
            (Some(slot), _, _) => {
                // The receiver's register: `this` is slot 0, or slot 1
                // behind a hidden return buffer. Null-check, then load
                // the entry out of the vtable.
                const GPRS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];
                let this_slot = plan
                    .args
                    .iter()
                    .find(|a| a.kind != PlanKind::RetBuf)
                    .map(|a| a.first_slot)
                    .unwrap_or(0);
                let receiver = GPRS[this_slot as usize];
                self.emit_null_check(receiver);
                self.e.mov_rm(Gpr::Rax, Mem::base(receiver));
                self.e.mov_rm(
                    Gpr::Rax,
                    Mem::disp(Gpr::Rax, crate::types::VTABLE_OFFSET as i32 + 8 * slot as i32),
                );
                self.e.call_r(Gpr::Rax);
                self.record_safepoint();
            }
            (None, Some(cell), _) => {
                if null_check_this {
                    const GPRS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];
                    let this_slot = plan
                        .args
                        .iter()
                        .find(|a| a.kind != PlanKind::RetBuf)
                        .map(|a| a.first_slot)
                        .unwrap_or(0);
                    self.emit_null_check(GPRS[this_slot as usize]);
                }
                self.emit_call_cell(cell)
            }
            (None, None, Some(off)) => {
                self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, off));
                self.e.call_r(Gpr::Rax);
                self.record_safepoint();
            }
            _ => unreachable!("call without a target"),
        }

        // Push the result.
        match plan.ret.clone() {
            RetKind::Void => {}
            RetKind::Gpr(tag) => self.push_gpr(tag, Gpr::Rax),
            RetKind::F32 => self.push_f32(Xmm::Xmm0),
            RetKind::F64 => self.push_f64(Xmm::Xmm0),
            RetKind::ValueInAcc(vt, size) => {
                let off = self.push_value(vt, size);
                self.e.mov_mr(Mem::disp(Gpr::Rbp, off), Gpr::Rax);
            }
            RetKind::ValueInPair(vt, size) => {
                let off = self.push_value(vt, size);
                self.e.mov_mr(Mem::disp(Gpr::Rbp, off), Gpr::Rax);
                self.e.mov_mr(Mem::disp(Gpr::Rbp, off + 8), Gpr::Rdx);
            }
            RetKind::ValueBuffered(vt, size) => {
                // The callee wrote through the hidden pointer straight
                // into the result region.
                let off = self.push_value(vt, size);
                debug_assert_eq!(Some(off), retbuf_off);
            }
        }
        Ok(())
    }

    fn emit_arg_move(&mut self, mv: ArgMove, dest: ArgDest) {
        const GPRS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];
        const XMMS: [Xmm; 4] = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3];
        match dest {
            ArgDest::Stack(slot) => {
                let out = Mem::disp(Gpr::Rsp, 8 * slot as i32);
                match mv {
                    ArgMove::Load(off) => {
                        self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, off));
                        self.e.mov_mr(out, Gpr::Rax);
                    }
                    ArgMove::Lea(off) => {
                        self.e.lea(Gpr::Rax, Mem::disp(Gpr::Rbp, off));
                        self.e.mov_mr(out, Gpr::Rax);
                    }
                    ArgMove::LoadF32(off, from_f64) => {
                        if from_f64 {
                            self.e.movsd_rm(Xmm::Xmm5, Mem::disp(Gpr::Rbp, off));
                            self.e.cvtsd2ss(Xmm::Xmm5, Xmm::Xmm5);
                        } else {
                            self.e.movss_rm(Xmm::Xmm5, Mem::disp(Gpr::Rbp, off));
                        }
                        self.e.movss_mr(out, Xmm::Xmm5);
                    }
                    ArgMove::LoadF64(off, from_f32) => {
                        if from_f32 {
                            self.e.movss_rm(Xmm::Xmm5, Mem::disp(Gpr::Rbp, off));
                            self.e.cvtss2sd(Xmm::Xmm5, Xmm::Xmm5);
                        } else {
                            self.e.movsd_rm(Xmm::Xmm5, Mem::disp(Gpr::Rbp, off));
                        }
                        self.e.movsd_mr(out, Xmm::Xmm5);
                    }
                }
            }
            ArgDest::Reg(slot) => {
                let gpr = GPRS[slot as usize];
                let xmm = XMMS[slot as usize];
                match mv {
                    ArgMove::Load(off) => self.e.mov_rm(gpr, Mem::disp(Gpr::Rbp, off)),
                    ArgMove::Lea(off) => self.e.lea(gpr, Mem::disp(Gpr::Rbp, off)),
                    ArgMove::LoadF32(off, from_f64) => {
                        if from_f64 {
                            self.e.movsd_rm(xmm, Mem::disp(Gpr::Rbp, off));
                            self.e.cvtsd2ss(xmm, xmm);
                        } else {
                            self.e.movss_rm(xmm, Mem::disp(Gpr::Rbp, off));
                        }
                    }
                    ArgMove::LoadF64(off, from_f32) => {
                        if from_f32 {
                            self.e.movss_rm(xmm, Mem::disp(Gpr::Rbp, off));
                            self.e.cvtss2sd(xmm, xmm);
                        } else {
                            self.e.movsd_rm(xmm, Mem::disp(Gpr::Rbp, off));
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ArgMove {
    /// 8-byte load from a frame offset.
    Load(i32),
    /// Address of a frame offset.
    Lea(i32),
    /// Float single (promoting from f64 when flagged).
    LoadF32(i32, bool),
    /// Float double (promoting from f32 when flagged).
    LoadF64(i32, bool),
}

#[derive(Debug, Clone, Copy)]
enum ArgDest {
    Reg(u32),
    Stack(u32),
}

/// The compiled artefact before placement.
pub struct CompiledBytes {
    pub code: Vec<u8>,
    pub prologue_len: u32,
    pub unwind: UnwindInfo,
    pub stack_map: Vec<u8>,
    pub clauses: Vec<NativeEhClause>,
    pub funclets: Vec<FuncletInfo>,
}

impl<'a> MethodCompiler<'a> {
    pub fn new(
        env: &'a CompileEnv<'a>,
        assembly: u32,
        token: u32,
        name: String,
        sig: MethodSig,
        body: &MethodBody<'_>,
        locals_sig: Option<LocalsSig>,
    ) -> Result<MethodCompiler<'a>> {
        let instruction_count = Decoder::decode_all(body.code)?.len().max(1);
        let limit = 4096
            + instruction_count * crate::defaults::MAX_NATIVE_PER_IL
            + body.clauses.len() * 512;

        let mut compiler = MethodCompiler {
            env,
            assembly,
            token,
            name,
            sig: sig.clone(),
            e: CodeEmitter::new(limit),
            stack: EvalStack::new(),
            own_plan: CallPlan {
                args: Vec::new(),
                total_slots: 0,
                ret: RetKind::Void,
            },
            locals: Vec::new(),
            locals_bytes: 0,
            eval_base: 0,
            frame_patch: 0,
            max_extra_out: 0,
            max_eval_slots: 0,
            il2native: FxHashMap::default(),
            entry_states: FxHashMap::default(),
            branch_states: FxHashMap::default(),
            fixups: Vec::new(),
            funclet_call_fixups: Vec::new(),
            smap: StackMapBuilder::new(),
            fixed_live: Vec::new(),
            clauses: body.clauses.clone(),
            unreachable: false,
            constrained: None,
            in_funclet: None,
            funclet_epilogue_patches: Vec::new(),
            pending_funclet_imm_patches: Vec::new(),
        };

        compiler.own_plan = compiler.build_plan(assembly, &sig)?;

        // Locals: fixed slots, 64 bytes minimum, below the saved regs.
        let mut cursor: u32 = 0;
        if let Some(locals) = locals_sig {
            for local in &locals.locals {
                let local = match local {
                    TypeSig::Pinned(inner) => inner.as_ref(),
                    other => other,
                };
                let shape = compiler.env.loader.shape_of(assembly, local, None)?;
                let slot_bytes = crate::defaults::LOCAL_SLOT.max((shape.size + 7) / 8 * 8);
                cursor += slot_bytes;
                let tag = Self::tag_of(local);
                let mut ref_slots = Vec::new();
                if tag == EvalTag::Ref {
                    ref_slots.push(0);
                } else {
                    for series in &shape.series {
                        let mut run = series.offset;
                        while run < series.offset + series.run_bytes {
                            ref_slots.push(run);
                            run += 8;
                        }
                    }
                }
                compiler.locals.push(LocalSlot {
                    offset: -(SAVED_BYTES + cursor as i32),
                    size: shape.size.max(if tag == EvalTag::Value { 1 } else { 8 }),
                    tag,
                    vt: shape.mt.filter(|_| tag == EvalTag::Value),
                    is_ref: tag == EvalTag::Ref,
                    ref_slots,
                });
            }
        }
        compiler.locals_bytes = cursor;
        compiler.eval_base = -(SAVED_BYTES + cursor as i32 + 8);
        Ok(compiler)
    }

    /// Drive compilation of the whole method.
    pub fn compile(mut self, body: &MethodBody<'_>) -> Result<CompiledBytes> {
        let instructions = Decoder::decode_all(body.code)?;

        // Prologue.
        self.frame_patch = crate::jit::thunks::emit_tier0_prologue(&mut self.e, 0);
        self.emit_arg_homing();
        self.emit_locals_init(body.init_locals);

        // Fixed stack-map slots: homed reference arguments and reference
        // slots of locals are live at every safepoint (Tier-0 policy).
        let own_args = self.own_plan.args.clone();
        for arg in &own_args {
            if arg.is_ref {
                let off = ARG_BASE + 8 * arg.first_slot as i32;
                let id = self.smap.frame_slot(off);
                self.fixed_live.push(id);
            }
        }
        let locals = self.locals.clone();
        for local in &locals {
            for &run in &local.ref_slots {
                let id = self.smap.frame_slot(local.offset + run as i32);
                self.fixed_live.push(id);
            }
        }

        // Leave targets are reachable with an empty evaluation stack even
        // when all textual predecessors are inside handler regions (the
        // usual shape of the continuation after a protected block), so
        // seed them before the linear pass decides reachability.
        for instruction in &instructions {
            if let Op::Leave(target) = instruction.op {
                self.branch_states
                    .entry(target)
                    .or_insert_with(EvalStack::new);
            }
        }

        // Funclet regions are compiled separately; the main pass skips
        // them.
        let mut skip_ranges: Vec<(u32, u32)> = Vec::new();
        for clause in &self.clauses {
            skip_ranges.push((
                clause.handler_offset,
                clause.handler_offset + clause.handler_len,
            ));
            if let EhClauseKind::Filter { filter_offset } = clause.kind {
                skip_ranges.push((filter_offset, clause.handler_offset));
            }
        }

        self.lower_range(&instructions, |offset| {
            skip_ranges
                .iter()
                .any(|(b, e)| offset >= *b && offset < *e)
        })?;
        // Map the end of the IL body before funclet emission moves the
        // cursor; a try range may extend to the very end.
        self.il2native
            .entry(body.code.len() as u32)
            .or_insert(self.e.offset() as u32);

        // Capture native try ranges now: the funclet pass below remaps
        // handler-start offsets to funclet code.
        let try_ranges: Vec<(u32, u32)> = self
            .clauses
            .clone()
            .iter()
            .map(|clause| {
                Ok((
                    self.native_of(clause.try_offset)?,
                    self.native_of(clause.try_offset + clause.try_len)?,
                ))
            })
            .collect::<Result<_>>()?;

        // Funclets.
        let pending: Vec<PendingFunclet> = self
            .clauses
            .iter()
            .enumerate()
            .flat_map(|(index, clause)| {
                let mut out = Vec::new();
                if let EhClauseKind::Filter { filter_offset } = clause.kind {
                    out.push(PendingFunclet {
                        clause_index: index,
                        kind: FuncletKind::Filter,
                        il_begin: filter_offset,
                        il_end: clause.handler_offset,
                    });
                }
                out.push(PendingFunclet {
                    clause_index: index,
                    kind: match clause.kind {
                        EhClauseKind::Catch(_) => FuncletKind::Catch,
                        EhClauseKind::Filter { .. } => FuncletKind::Catch,
                        EhClauseKind::Finally => FuncletKind::Finally,
                        EhClauseKind::Fault => FuncletKind::Fault,
                    },
                    il_begin: clause.handler_offset,
                    il_end: clause.handler_offset + clause.handler_len,
                });
                out
            })
            .collect();

        let mut emitted: Vec<EmittedFunclet> = Vec::new();
        for funclet in &pending {
            let done = self.compile_funclet(&instructions, funclet)?;
            emitted.push(done);
        }

        // Resolve IL-target fixups now every offset is placed.
        let fixups = std::mem::take(&mut self.fixups);
        for (site, il) in fixups {
            let native = *self.il2native.get(&il).ok_or(RuntimeError::Compile(
                CompileError::StackMismatch(il, "branch into unmapped code"),
            ))?;
            self.e.patch(site, native as usize);
        }
        // Normal-path finally calls target their clause's funclet.
        let funclet_fixups = std::mem::take(&mut self.funclet_call_fixups);
        for (site, clause_index) in funclet_fixups {
            let target = emitted
                .iter()
                .find(|f| f.clause_index == clause_index && f.kind != FuncletKind::Filter)
                .expect("funclet emitted");
            self.e.patch(site, target.begin as usize);
        }

        // Frame sizes: the main frame holds locals, the evaluation area
        // and the outgoing call area, padded so rsp lands 16-byte aligned
        // at call sites. Funclets only hold an outgoing area.
        let outgoing = SHADOW + 8 * self.max_extra_out;
        let mut frame = self.locals_bytes + 8 * self.max_eval_slots + outgoing;
        while frame % 16 != 8 {
            frame += 8;
        }
        self.e.patch_u32(self.frame_patch, frame);

        let funclet_patches = std::mem::take(&mut self.pending_funclet_imm_patches);
        for (frame_patch, epilogue_patches, entered_by_jump) in funclet_patches {
            let mut size = outgoing;
            let rem = if entered_by_jump { 0 } else { 8 };
            while size % 16 != rem {
                size += 8;
            }
            self.e.patch_u32(frame_patch, size);
            for at in epilogue_patches {
                self.e.patch_u32(at, size);
            }
        }

        // Native clause table.
        let mut native_clauses = Vec::new();
        for (index, clause) in self.clauses.clone().iter().enumerate() {
            let (try_begin, try_end) = try_ranges[index];
            let handler = emitted
                .iter()
                .position(|f| f.clause_index == index && f.kind != FuncletKind::Filter)
                .expect("handler funclet");
            let kind = match clause.kind {
                EhClauseKind::Catch(token) => NativeClauseKind::Catch {
                    catch_type: self.env.loader.resolve_type(self.assembly, token)?,
                    handler,
                },
                EhClauseKind::Filter { .. } => {
                    let filter = emitted
                        .iter()
                        .position(|f| {
                            f.clause_index == index && f.kind == FuncletKind::Filter
                        })
                        .expect("filter funclet");
                    NativeClauseKind::Filter { filter, handler }
                }
                EhClauseKind::Finally => NativeClauseKind::Finally { handler },
                EhClauseKind::Fault => NativeClauseKind::Fault { handler },
            };
            native_clauses.push(NativeEhClause {
                kind,
                try_begin,
                try_end,
            });
        }

        let code_len = self.e.offset() as u32;
        let funclet_infos = emitted
            .iter()
            .map(|f| {
                let mut size = outgoing;
                let rem = if f.entered_by_jump { 0 } else { 8 };
                while size % 16 != rem {
                    size += 8;
                }
                FuncletInfo {
                    kind: f.kind,
                    begin: f.begin,
                    end: f.end,
                    unwind: UnwindInfo::funclet_frame(size),
                }
            })
            .collect();

        log::debug!(
            "jit: {} compiled, {} bytes, {} clauses",
            self.name,
            code_len,
            native_clauses.len()
        );
        Ok(CompiledBytes {
            code: self.e.into_bytes(),
            prologue_len: 22,
            unwind: UnwindInfo::tier0_frame(frame),
            stack_map: self.smap.encode(code_len),
            clauses: native_clauses,
            funclets: funclet_infos,
        })
    }

    fn native_of(&self, il: u32) -> Result<u32> {
        self.il2native
            .get(&il)
            .copied()
            .ok_or(RuntimeError::Compile(CompileError::StackMismatch(
                il,
                "IL offset not placed",
            )))
    }

    fn emit_arg_homing(&mut self) {
        const GPRS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];
        const XMMS: [Xmm; 4] = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3];
        let plan = self.own_plan.clone();
        for arg in &plan.args {
            for piece in 0..arg.count {
                let slot = arg.first_slot + piece;
                if slot >= 4 {
                    continue; // already in the caller's outgoing area
                }
                let home = Self::arg_home(slot);
                match arg.kind {
                    PlanKind::F32 => self.e.movss_mr(home, XMMS[slot as usize]),
                    PlanKind::F64 => self.e.movsd_mr(home, XMMS[slot as usize]),
                    _ => self.e.mov_mr(home, GPRS[slot as usize]),
                }
            }
        }
    }

    fn emit_locals_init(&mut self, init_all: bool) {
        let locals = self.locals.clone();
        for local in &locals {
            if init_all {
                let slots = (local.size + 7) / 8;
                for i in 0..slots {
                    self.e
                        .mov_mi(Mem::disp(Gpr::Rbp, local.offset + 8 * i as i32), 0);
                }
            } else {
                // Reference slots are in the stack map from the first
                // safepoint on, so they must never hold garbage.
                for &run in &local.ref_slots {
                    self.e
                        .mov_mi(Mem::disp(Gpr::Rbp, local.offset + run as i32), 0);
                }
            }
        }
    }

    /// Lower a run of instructions, skipping those for which `skip`
    /// holds (funclet regions during the main pass).
    fn lower_range(
        &mut self,
        instructions: &[Instruction],
        skip: impl Fn(u32) -> bool,
    ) -> Result<()> {
        for instruction in instructions {
            let offset = instruction.offset;
            if skip(offset) {
                // Region boundaries (try ends, handler starts) must still
                // map to a native offset for clause-range conversion; the
                // funclet pass overwrites handler-internal entries later.
                self.il2native
                    .entry(offset)
                    .or_insert(self.e.offset() as u32);
                continue;
            }

            // Join-point bookkeeping.
            if let Some(expected) = self.branch_states.remove(&offset) {
                if self.unreachable {
                    self.stack = expected;
                    self.unreachable = false;
                } else if !self.stack.state_matches(&expected) {
                    return Err(RuntimeError::Compile(CompileError::StackMismatch(
                        offset,
                        "evaluation stack differs across predecessors",
                    )));
                }
            }
            self.il2native.insert(offset, self.e.offset() as u32);
            self.entry_states.insert(offset, self.stack.clone());
            if self.unreachable {
                continue;
            }
            self.lower_instruction(instruction)?;
        }
        Ok(())
    }

    /// Record a branch to `target` and verify/queue its stack state.
    fn note_branch(&mut self, target: u32) -> Result<()> {
        if let Some(expected) = self.entry_states.get(&target) {
            if !self.stack.state_matches(expected) {
                return Err(RuntimeError::Compile(CompileError::StackMismatch(
                    target,
                    "evaluation stack differs at backward branch target",
                )));
            }
        } else if let Some(expected) = self.branch_states.get(&target) {
            if !self.stack.state_matches(expected) {
                return Err(RuntimeError::Compile(CompileError::StackMismatch(
                    target,
                    "evaluation stack differs among branches to target",
                )));
            }
        } else {
            self.branch_states.insert(target, self.stack.clone());
        }
        Ok(())
    }

    /// Emit a jump to an IL target (backward direct, forward patched),
    /// polling the trap flag on back-edges.
    fn emit_jump(&mut self, target: u32) -> Result<()> {
        self.note_branch(target)?;
        if let Some(&native) = self.il2native.get(&target) {
            self.emit_backedge_poll();
            self.e.jmp_to(native as usize);
        } else {
            let site = self.e.jmp_forward();
            self.fixups.push((site, target));
        }
        Ok(())
    }

    /// Conditional jump to an IL target on `cc`.
    fn emit_jcc(&mut self, cc: Cc, target: u32) -> Result<()> {
        self.note_branch(target)?;
        if let Some(&native) = self.il2native.get(&target) {
            // Back-edge: poll the trap flag on the taken path.
            let skip = self.e.jcc_forward(invert_cc(cc));
            self.emit_backedge_poll();
            self.e.jmp_to(native as usize);
            let after = self.e.offset();
            self.e.patch(skip, after);
        } else {
            let site = self.e.jcc_forward(cc);
            self.fixups.push((site, target));
        }
        Ok(())
    }

    /// Loop back-edge safepoint: check the trap byte and park when set.
    fn emit_backedge_poll(&mut self) {
        self.e.mov_ri64(Gpr::Rax, self.env.trap_flag as u64);
        self.e.cmp_m8i(Mem::base(Gpr::Rax), 0);
        let skip = self.e.jcc_forward(Cc::E);
        let bridge = self.env.bridges.safepoint_poll;
        self.helper_call(bridge);
        let after = self.e.offset();
        self.e.patch(skip, after);
    }

    // ---- returns ----

    fn lower_ret(&mut self) -> Result<()> {
        match self.own_plan.ret.clone() {
            RetKind::Void => {}
            RetKind::Gpr(_) => {
                self.pop_gpr(Gpr::Rax)?;
            }
            RetKind::F32 => {
                let mem = self.item_mem(0);
                let item = self.stack.pop().ok_or(RuntimeError::Compile(
                    CompileError::StackUnderflow(0),
                ))?;
                if item.tag == EvalTag::Float64 {
                    self.e.movsd_rm(Xmm::Xmm0, mem);
                    self.e.cvtsd2ss(Xmm::Xmm0, Xmm::Xmm0);
                } else {
                    self.e.movss_rm(Xmm::Xmm0, mem);
                }
            }
            RetKind::F64 => {
                self.pop_float_as_f64(Xmm::Xmm0)?;
            }
            RetKind::ValueInAcc(..) => {
                let off = self.item_off(0);
                self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, off));
                self.stack.pop();
            }
            RetKind::ValueInPair(..) => {
                let off = self.item_off(0);
                self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, off));
                self.e.mov_rm(Gpr::Rdx, Mem::disp(Gpr::Rbp, off + 8));
                self.stack.pop();
            }
            RetKind::ValueBuffered(_, size) => {
                // Copy into the caller's buffer (hidden arg slot 0) and
                // return the buffer address.
                let src = self.item_mem(0);
                self.e.mov_rm(Gpr::Rdi, Self::arg_home(0));
                self.e.lea(Gpr::Rsi, src);
                self.e.mov_ri(Gpr::Rcx, size as i64);
                self.e.rep_movsb();
                self.e.mov_rm(Gpr::Rax, Self::arg_home(0));
                self.stack.pop();
            }
        }
        if self.in_funclet.is_some() {
            return Err(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "ret inside an exception handler",
            )));
        }
        crate::jit::thunks::emit_tier0_epilogue(&mut self.e);
        self.unreachable = true;
        Ok(())
    }

    // ---- leave / funclets ----

    /// Finally clauses exited when transferring from `from` to `target`.
    fn finallies_between(&self, from: u32, target: u32) -> Vec<usize> {
        self.clauses
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                matches!(c.kind, EhClauseKind::Finally)
                    && c.covers(from)
                    && !c.covers(target)
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn lower_leave(&mut self, from: u32, target: u32) -> Result<()> {
        // Leave empties the evaluation stack.
        self.stack.clear();
        // On the normal path the finallies run as explicit calls,
        // innermost first.
        let pending = match self.in_funclet {
            None => self.finallies_between(from, target),
            Some(clause_index) => {
                // Leaving a handler: run finallies whose try region
                // encloses the handler and not the target.
                let handler_offset = self.clauses[clause_index].handler_offset;
                self.finallies_between(handler_offset, target)
                    .into_iter()
                    .filter(|&i| i != clause_index)
                    .collect()
            }
        };
        for clause_index in pending {
            self.e.mov_ri(Gpr::Rcx, 0);
            self.e.mov_rr(Gpr::Rdx, Gpr::Rbp);
            let site = self.e.call_forward();
            self.funclet_call_fixups.push((site, clause_index));
            self.record_safepoint();
        }

        if let Some(clause_index) = self.in_funclet {
            let kind = &self.clauses[clause_index].kind;
            if matches!(kind, EhClauseKind::Catch(_) | EhClauseKind::Filter { .. }) {
                // Catch funclets exit by restoring their own registers
                // and jumping straight to the leave target in the parent
                // body.
                self.emit_funclet_epilogue_to_target(target)?;
                self.unreachable = true;
                return Ok(());
            }
        }

        self.note_branch(target)?;
        if let Some(&native) = self.il2native.get(&target) {
            self.e.jmp_to(native as usize);
        } else {
            let site = self.e.jmp_forward();
            self.fixups.push((site, target));
        }
        self.unreachable = true;
        Ok(())
    }

    fn emit_funclet_epilogue_pops(&mut self) {
        // Undo `sub rsp, K` without touching rbp (it holds the parent
        // frame): the funclet frame patch rewrites this immediate too.
        // add rsp, imm32 keeps a fixed shape for patching.
        self.e.add_ri(Gpr::Rsp, 0x7FFF_FFF0);
        let at = self.e.offset() - 4;
        self.funclet_epilogue_patches.push(at);
        for reg in [
            Gpr::R15,
            Gpr::R14,
            Gpr::R13,
            Gpr::R12,
            Gpr::Rsi,
            Gpr::Rdi,
            Gpr::Rbx,
            Gpr::Rbp,
        ] {
            self.e.pop_r(reg);
        }
    }

    fn emit_funclet_epilogue_to_target(&mut self, target: u32) -> Result<()> {
        self.emit_funclet_epilogue_pops();
        if let Some(&native) = self.il2native.get(&target) {
            self.e.jmp_to(native as usize);
        } else {
            let site = self.e.jmp_forward();
            self.fixups.push((site, target));
        }
        Ok(())
    }

    fn compile_funclet(
        &mut self,
        instructions: &[Instruction],
        pending: &PendingFunclet,
    ) -> Result<EmittedFunclet> {
        // Funclet prologue: save the caller's registers, adopt the parent
        // frame pointer from rdx, reserve an outgoing area.
        while self.e.offset() % 16 != 0 {
            self.e.int3();
        }
        let begin = self.e.offset() as u32;
        self.e.push_r(Gpr::Rbp);
        for reg in [
            Gpr::Rbx,
            Gpr::Rdi,
            Gpr::Rsi,
            Gpr::R12,
            Gpr::R13,
            Gpr::R14,
            Gpr::R15,
        ] {
            self.e.push_r(reg);
        }
        self.e.mov_rr(Gpr::Rbp, Gpr::Rdx);
        let frame_patch = self.e.sub_rsp_imm32(0);
        debug_assert_eq!(self.e.offset() as u32 - begin, 22);

        // Handler bodies start with a fresh evaluation stack; catches and
        // filters receive the exception object (in rcx) as its one item.
        self.stack.clear();
        self.unreachable = false;
        self.in_funclet = Some(pending.clause_index);
        self.funclet_epilogue_patches.clear();
        if matches!(pending.kind, FuncletKind::Catch | FuncletKind::Filter) {
            self.push_gpr(EvalTag::Ref, Gpr::Rcx);
        }

        self.lower_range(
            instructions,
            |offset| !(offset >= pending.il_begin && offset < pending.il_end),
        )?;

        let end = self.e.offset() as u32;
        self.in_funclet = None;
        self.stack.clear();
        self.unreachable = false;

        let entered_by_jump = pending.kind == FuncletKind::Catch;

        // Record the per-funclet epilogue immediates so the final frame
        // patch can rewrite them alongside the prologue allocation.
        let epilogue_patches = std::mem::take(&mut self.funclet_epilogue_patches);
        self.pending_funclet_imm_patches
            .push((frame_patch, epilogue_patches, entered_by_jump));

        Ok(EmittedFunclet {
            clause_index: pending.clause_index,
            kind: pending.kind,
            begin,
            end,
            frame_patch,
            entered_by_jump,
        })
    }

    /// EndFinally / EndFilter lowering.
    fn lower_end_funclet(&mut self, is_filter: bool) -> Result<()> {
        if self.in_funclet.is_none() {
            return Err(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "endfinally outside a handler",
            )));
        }
        if is_filter {
            self.pop_gpr(Gpr::Rax)?;
        } else {
            self.e.mov_ri(Gpr::Rax, 0);
        }
        self.emit_funclet_epilogue_pops();
        self.e.ret();
        self.unreachable = true;
        Ok(())
    }
}

fn invert_cc(cc: Cc) -> Cc {
    match cc {
        Cc::O => Cc::No,
        Cc::No => Cc::O,
        Cc::B => Cc::Ae,
        Cc::Ae => Cc::B,
        Cc::E => Cc::Ne,
        Cc::Ne => Cc::E,
        Cc::Be => Cc::A,
        Cc::A => Cc::Be,
        Cc::S => Cc::Ns,
        Cc::Ns => Cc::S,
        Cc::P => Cc::Np,
        Cc::Np => Cc::P,
        Cc::L => Cc::Ge,
        Cc::Ge => Cc::L,
        Cc::Le => Cc::G,
        Cc::G => Cc::Le,
    }
}

/// Compile one reserved method and publish it.
pub fn compile_method(
    env: &CompileEnv<'_>,
    code_heap: &CodeHeap,
    code_map: &CodeMap,
    assembly: u32,
    token: u32,
) -> Result<Arc<CompiledCode>> {
    let resolved = env.loader.resolve_method(assembly, Token(token))?;
    if resolved.rva == 0 {
        return Err(RuntimeError::Compile(CompileError::NoBody));
    }
    let record = env.loader.assemblies.get(resolved.assembly)?;
    let body_bytes = record.view.body_bytes(resolved.rva)?;
    let body = MethodBody::parse(body_bytes)?;
    let locals_sig = match body.locals_token {
        Some(token) => {
            let blob = record.view.tables().stand_alone_sig(token.rid())?;
            Some(LocalsSig::parse(&mut record.view.blobs().reader(blob)?)?)
        }
        None => None,
    };

    let compiler = MethodCompiler::new(
        env,
        resolved.assembly,
        resolved.token,
        format!("{}::{}", resolved.declaring.name(), resolved.name),
        resolved.sig.clone(),
        &body,
        locals_sig,
    )?;
    let name = compiler.name.clone();
    let compiled = compiler.compile(&body)?;

    let base = code_heap
        .install(&compiled.code, resolved.assembly)
        .ok_or(RuntimeError::Compile(CompileError::CodeHeapExhausted))?;

    let code = Arc::new(CompiledCode {
        assembly: resolved.assembly,
        token: resolved.token,
        name,
        code_base: base,
        code_len: compiled.code.len() as u32,
        prologue_len: compiled.prologue_len,
        unwind: compiled.unwind,
        stack_map: crate::gc::stackmap::StackMap::decode(&compiled.stack_map)
            .expect("stack map round-trip"),
        eh_clauses: compiled.clauses,
        funclets: compiled.funclets,
    });
    code_map.register(code.clone());
    Ok(code)
}
