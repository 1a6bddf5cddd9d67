//! Instruction lowering: locals/arguments, fields, arrays, objects, calls
//!
//! Value types follow one rule set everywhere: values up to 8 bytes take
//! one slot, 9–16 bytes two, anything larger ceil(size/8) slots;
//! address-of always yields a single pointer slot; large arguments go by
//! pointer to a caller copy; large returns travel through a hidden
//! buffer that displaces arg 0. Field access on a value sitting on the
//! evaluation stack addresses frame memory directly - the slot is never
//! dereferenced as a pointer.

use super::stack::{EvalTag, Item};
use super::{MethodCompiler, PlanKind, ThrowKind};
use crate::error::{CompileError, Result, RuntimeError};
use crate::jit::emitter::{Cc, Gpr, Mem, Xmm};
use crate::types::MethodTable;
use silex_metadata::{IndKind, MethodSig, TableId, Token, TypeSig};

impl MethodCompiler<'_> {
    // ---- shaped loads/stores ----

    /// Push the value at `[base_reg + offset]` described by `sig`.
    fn emit_load_typed(&mut self, base: Gpr, offset: i32, sig: &TypeSig, owner: u32) -> Result<()> {
        let mem = Mem::disp(base, offset);
        match sig {
            TypeSig::Bool | TypeSig::U1 => {
                self.e.load8_zx(Gpr::Rax, mem);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            TypeSig::I1 => {
                self.e.load8_sx(Gpr::Rax, mem);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            TypeSig::Char | TypeSig::U2 => {
                self.e.load16_zx(Gpr::Rax, mem);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            TypeSig::I2 => {
                self.e.load16_sx(Gpr::Rax, mem);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            TypeSig::I4 | TypeSig::U4 => {
                self.e.load32_sx(Gpr::Rax, mem);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            TypeSig::I8 | TypeSig::U8 => {
                self.e.mov_rm(Gpr::Rax, mem);
                self.push_gpr(EvalTag::I64, Gpr::Rax);
            }
            TypeSig::I | TypeSig::U => {
                self.e.mov_rm(Gpr::Rax, mem);
                self.push_gpr(EvalTag::NInt, Gpr::Rax);
            }
            TypeSig::Ptr(_) | TypeSig::ByRef(_) | TypeSig::FnPtr(_) => {
                self.e.mov_rm(Gpr::Rax, mem);
                self.push_gpr(EvalTag::Ptr, Gpr::Rax);
            }
            TypeSig::R4 => {
                self.e.movss_rm(Xmm::Xmm0, mem);
                self.push_f32(Xmm::Xmm0);
            }
            TypeSig::R8 => {
                self.e.movsd_rm(Xmm::Xmm0, mem);
                self.push_f64(Xmm::Xmm0);
            }
            s if s.is_reference() => {
                self.e.mov_rm(Gpr::Rax, mem);
                self.push_gpr(EvalTag::Ref, Gpr::Rax);
            }
            s => {
                let shape = self.env.loader.shape_of(owner, s, None)?;
                let mt = shape.mt.ok_or(RuntimeError::Compile(
                    CompileError::UnresolvedToken(Token(0), "value-type load"),
                ))?;
                let dst = self.push_value(mt, shape.size);
                self.emit_copy(Mem::disp(Gpr::Rbp, dst), mem, shape.size);
            }
        }
        Ok(())
    }

    /// Pop the top of the stack into `[base_reg + offset]` shaped by
    /// `sig`. `base` must not be rax/rcx/rsi/rdi (scratch).
    fn emit_store_typed(&mut self, base: Gpr, offset: i32, sig: &TypeSig) -> Result<()> {
        let mem = Mem::disp(base, offset);
        match sig {
            TypeSig::Bool | TypeSig::U1 | TypeSig::I1 => {
                self.pop_gpr(Gpr::Rax)?;
                self.e.store8(mem, Gpr::Rax);
            }
            TypeSig::Char | TypeSig::U2 | TypeSig::I2 => {
                self.pop_gpr(Gpr::Rax)?;
                self.e.store16(mem, Gpr::Rax);
            }
            TypeSig::I4 | TypeSig::U4 => {
                self.pop_gpr(Gpr::Rax)?;
                self.e.mov_mr32(mem, Gpr::Rax);
            }
            TypeSig::R4 => {
                let item = self.stack.top().cloned().ok_or(RuntimeError::Compile(
                    CompileError::StackUnderflow(0),
                ))?;
                let src = self.item_mem(0);
                if item.tag == EvalTag::Float64 {
                    self.e.movsd_rm(Xmm::Xmm0, src);
                    self.e.cvtsd2ss(Xmm::Xmm0, Xmm::Xmm0);
                } else {
                    self.e.movss_rm(Xmm::Xmm0, src);
                }
                self.stack.pop();
                self.e.movss_mr(mem, Xmm::Xmm0);
            }
            TypeSig::R8 => {
                self.pop_float_as_f64(Xmm::Xmm0)?;
                self.e.movsd_mr(mem, Xmm::Xmm0);
            }
            s if super::MethodCompiler::tag_of(s) != EvalTag::Value => {
                self.pop_gpr(Gpr::Rax)?;
                self.e.mov_mr(mem, Gpr::Rax);
            }
            _ => {
                let item = self.stack.top().cloned().ok_or(RuntimeError::Compile(
                    CompileError::StackUnderflow(0),
                ))?;
                if item.tag != EvalTag::Value {
                    return Err(RuntimeError::Compile(CompileError::StackMismatch(
                        0,
                        "expected a value type to store",
                    )));
                }
                let src = self.item_off(0);
                self.emit_copy(mem, Mem::disp(Gpr::Rbp, src), item.slots * 8);
                self.stack.pop();
            }
        }
        Ok(())
    }

    // ---- arguments ----

    pub(super) fn lower_ldarg(&mut self, index: u16) -> Result<()> {
        let arg = self.plan_arg(index)?.clone();
        let home = Self::arg_home(arg.first_slot);
        match arg.kind {
            PlanKind::Gpr(tag) => {
                self.e.mov_rm(Gpr::Rax, home);
                self.push_gpr(tag, Gpr::Rax);
            }
            PlanKind::F32 => {
                self.e.movss_rm(Xmm::Xmm0, home);
                self.push_f32(Xmm::Xmm0);
            }
            PlanKind::F64 => {
                self.e.movsd_rm(Xmm::Xmm0, home);
                self.push_f64(Xmm::Xmm0);
            }
            PlanKind::ValueSlots => {
                let vt = arg.vt.ok_or(RuntimeError::Compile(
                    CompileError::UnresolvedToken(Token(0), "value-type argument"),
                ))?;
                let dst = self.push_value(vt, arg.size);
                for piece in 0..arg.count {
                    self.e
                        .mov_rm(Gpr::Rax, Self::arg_home(arg.first_slot + piece));
                    self.e
                        .mov_mr(Mem::disp(Gpr::Rbp, dst + 8 * piece as i32), Gpr::Rax);
                }
            }
            PlanKind::ValuePointer => {
                let vt = arg.vt.ok_or(RuntimeError::Compile(
                    CompileError::UnresolvedToken(Token(0), "value-type argument"),
                ))?;
                let dst = self.push_value(vt, arg.size);
                self.e.mov_rm(Gpr::Rsi, home);
                self.e.lea(Gpr::Rdi, Mem::disp(Gpr::Rbp, dst));
                self.e.mov_ri(Gpr::Rcx, arg.size as i64);
                self.e.rep_movsb();
            }
            PlanKind::RetBuf => unreachable!("ret buffer is not a logical argument"),
        }
        Ok(())
    }

    pub(super) fn lower_ldarga(&mut self, index: u16) -> Result<()> {
        let arg = self.plan_arg(index)?.clone();
        match arg.kind {
            PlanKind::ValuePointer => {
                // The caller's temp is the argument; its address is the
                // pointer already in the home slot.
                self.e.mov_rm(Gpr::Rax, Self::arg_home(arg.first_slot));
            }
            _ => {
                self.e.lea(Gpr::Rax, Self::arg_home(arg.first_slot));
            }
        }
        self.push_gpr(EvalTag::Ptr, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_starg(&mut self, index: u16) -> Result<()> {
        let arg = self.plan_arg(index)?.clone();
        match arg.kind {
            PlanKind::Gpr(_) => {
                self.pop_gpr(Gpr::Rax)?;
                self.e.mov_mr(Self::arg_home(arg.first_slot), Gpr::Rax);
            }
            PlanKind::F32 => {
                let src = self.item_mem(0);
                self.e.movss_rm(Xmm::Xmm0, src);
                self.stack.pop();
                self.e.movss_mr(Self::arg_home(arg.first_slot), Xmm::Xmm0);
            }
            PlanKind::F64 => {
                self.pop_float_as_f64(Xmm::Xmm0)?;
                self.e.movsd_mr(Self::arg_home(arg.first_slot), Xmm::Xmm0);
            }
            PlanKind::ValueSlots => {
                let src = self.item_off(0);
                for piece in 0..arg.count {
                    self.e
                        .mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, src + 8 * piece as i32));
                    self.e
                        .mov_mr(Self::arg_home(arg.first_slot + piece), Gpr::Rax);
                }
                self.stack.pop();
            }
            PlanKind::ValuePointer => {
                let src = self.item_off(0);
                self.e.mov_rm(Gpr::Rdi, Self::arg_home(arg.first_slot));
                self.e.lea(Gpr::Rsi, Mem::disp(Gpr::Rbp, src));
                self.e.mov_ri(Gpr::Rcx, arg.size as i64);
                self.e.rep_movsb();
                self.stack.pop();
            }
            PlanKind::RetBuf => unreachable!(),
        }
        Ok(())
    }

    // ---- locals ----

    pub(super) fn lower_ldloc(&mut self, index: u16) -> Result<()> {
        let local = self
            .locals
            .get(index as usize)
            .cloned()
            .ok_or(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "local index out of range",
            )))?;
        match local.tag {
            EvalTag::Float32 => {
                self.e.movss_rm(Xmm::Xmm0, Mem::disp(Gpr::Rbp, local.offset));
                self.push_f32(Xmm::Xmm0);
            }
            EvalTag::Float64 => {
                self.e.movsd_rm(Xmm::Xmm0, Mem::disp(Gpr::Rbp, local.offset));
                self.push_f64(Xmm::Xmm0);
            }
            EvalTag::Value => {
                let vt = local.vt.ok_or(RuntimeError::Compile(
                    CompileError::UnresolvedToken(Token(0), "value-type local"),
                ))?;
                let dst = self.push_value(vt, local.size);
                self.emit_copy(
                    Mem::disp(Gpr::Rbp, dst),
                    Mem::disp(Gpr::Rbp, local.offset),
                    local.size,
                );
            }
            tag => {
                self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, local.offset));
                self.push_gpr(tag, Gpr::Rax);
            }
        }
        Ok(())
    }

    pub(super) fn lower_ldloca(&mut self, index: u16) -> Result<()> {
        let local = self
            .locals
            .get(index as usize)
            .cloned()
            .ok_or(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "local index out of range",
            )))?;
        self.e.lea(Gpr::Rax, Mem::disp(Gpr::Rbp, local.offset));
        self.push_gpr(EvalTag::Ptr, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_stloc(&mut self, index: u16) -> Result<()> {
        let local = self
            .locals
            .get(index as usize)
            .cloned()
            .ok_or(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "local index out of range",
            )))?;
        match local.tag {
            EvalTag::Float32 => {
                let item = self.stack.top().cloned().ok_or(RuntimeError::Compile(
                    CompileError::StackUnderflow(0),
                ))?;
                let src = self.item_mem(0);
                if item.tag == EvalTag::Float64 {
                    self.e.movsd_rm(Xmm::Xmm0, src);
                    self.e.cvtsd2ss(Xmm::Xmm0, Xmm::Xmm0);
                } else {
                    self.e.movss_rm(Xmm::Xmm0, src);
                }
                self.stack.pop();
                self.e.movss_mr(Mem::disp(Gpr::Rbp, local.offset), Xmm::Xmm0);
            }
            EvalTag::Float64 => {
                self.pop_float_as_f64(Xmm::Xmm0)?;
                self.e.movsd_mr(Mem::disp(Gpr::Rbp, local.offset), Xmm::Xmm0);
            }
            EvalTag::Value => {
                let item = self.stack.top().cloned().ok_or(RuntimeError::Compile(
                    CompileError::StackUnderflow(0),
                ))?;
                if item.tag != EvalTag::Value {
                    return Err(RuntimeError::Compile(CompileError::StackMismatch(
                        0,
                        "storing a scalar into a value-type local",
                    )));
                }
                let src = self.item_off(0);
                self.emit_copy(
                    Mem::disp(Gpr::Rbp, local.offset),
                    Mem::disp(Gpr::Rbp, src),
                    item.slots * 8,
                );
                self.stack.pop();
            }
            _ => {
                self.pop_gpr(Gpr::Rax)?;
                self.e.mov_mr(Mem::disp(Gpr::Rbp, local.offset), Gpr::Rax);
            }
        }
        Ok(())
    }

    // ---- indirect access ----

    fn ind_sig(kind: IndKind) -> TypeSig {
        match kind {
            IndKind::I1 => TypeSig::I1,
            IndKind::U1 => TypeSig::U1,
            IndKind::I2 => TypeSig::I2,
            IndKind::U2 => TypeSig::U2,
            IndKind::I4 => TypeSig::I4,
            IndKind::U4 => TypeSig::U4,
            IndKind::I8 => TypeSig::I8,
            IndKind::I => TypeSig::I,
            IndKind::R4 => TypeSig::R4,
            IndKind::R8 => TypeSig::R8,
            IndKind::Ref => TypeSig::Object,
        }
    }

    pub(super) fn lower_ldind(&mut self, kind: IndKind) -> Result<()> {
        self.pop_gpr(Gpr::Rdx)?;
        self.emit_load_typed(Gpr::Rdx, 0, &Self::ind_sig(kind), self.assembly)
    }

    pub(super) fn lower_stind(&mut self, kind: IndKind) -> Result<()> {
        // Stack: [addr, value]; the address is under the value.
        let addr_off = self.item_off(1);
        self.e.mov_rm(Gpr::Rdx, Mem::disp(Gpr::Rbp, addr_off));
        self.emit_store_typed(Gpr::Rdx, 0, &Self::ind_sig(kind))?;
        self.stack.pop(); // the address
        Ok(())
    }

    pub(super) fn lower_ldobj(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        self.pop_gpr(Gpr::Rdx)?;
        if mt.is_value_type() {
            let size = mt.base_size() as u32;
            let dst = self.push_value(mt, size);
            self.emit_copy(Mem::disp(Gpr::Rbp, dst), Mem::base(Gpr::Rdx), size);
        } else {
            self.e.mov_rm(Gpr::Rax, Mem::base(Gpr::Rdx));
            self.push_gpr(EvalTag::Ref, Gpr::Rax);
        }
        Ok(())
    }

    pub(super) fn lower_stobj(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        let addr_off = self.item_off(1);
        self.e.mov_rm(Gpr::Rdx, Mem::disp(Gpr::Rbp, addr_off));
        if mt.is_value_type() {
            let src = self.item_off(0);
            self.emit_copy(
                Mem::base(Gpr::Rdx),
                Mem::disp(Gpr::Rbp, src),
                mt.base_size() as u32,
            );
            self.stack.pop();
        } else {
            self.pop_gpr(Gpr::Rax)?;
            self.e.mov_mr(Mem::base(Gpr::Rdx), Gpr::Rax);
        }
        self.stack.pop(); // the address
        Ok(())
    }

    pub(super) fn lower_cpobj(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        let size = if mt.is_value_type() {
            mt.base_size() as u32
        } else {
            8
        };
        self.pop_gpr(Gpr::Rsi)?; // source address
        self.pop_gpr(Gpr::Rdi)?; // destination address
        self.e.mov_ri(Gpr::Rcx, size as i64);
        self.e.rep_movsb();
        Ok(())
    }

    pub(super) fn lower_initobj(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        let size = if mt.is_value_type() {
            mt.base_size() as u32
        } else {
            8
        };
        self.pop_gpr(Gpr::Rdi)?;
        self.e.xor_rr32(Gpr::Rax, Gpr::Rax);
        self.e.mov_ri(Gpr::Rcx, size as i64);
        self.e.rep_stosb();
        Ok(())
    }

    // ---- fields ----

    pub(super) fn lower_ldfld(&mut self, token: Token) -> Result<()> {
        let field = self.env.loader.resolve_field(self.assembly, token)?;
        if field.is_static {
            return self.lower_ldsfld(token);
        }
        let target = self.stack.top().cloned().ok_or(RuntimeError::Compile(
            CompileError::StackUnderflow(0),
        ))?;
        match target.tag {
            EvalTag::Ref => {
                self.e.mov_rm(Gpr::Rdx, self.item_mem_at(0));
                self.stack.pop();
                self.emit_null_check(Gpr::Rdx);
                self.emit_load_typed(
                    Gpr::Rdx,
                    field.offset as i32,
                    &field.sig.clone(),
                    self.assembly,
                )?;
            }
            EvalTag::Ptr | EvalTag::NInt => {
                self.e.mov_rm(Gpr::Rdx, self.item_mem_at(0));
                self.stack.pop();
                self.emit_load_typed(
                    Gpr::Rdx,
                    field.offset as i32,
                    &field.sig.clone(),
                    self.assembly,
                )?;
            }
            EvalTag::Value => {
                // The value lives on the evaluation stack: address its
                // field directly in frame memory, never through a
                // pointer load.
                let base = self.item_off(0);
                let field_off = base + field.offset as i32;
                // Read before the pop: the result may overwrite the
                // value's own slots.
                let sig = field.sig.clone();
                match &sig {
                    s if super::MethodCompiler::tag_of(s) == EvalTag::Value => {
                        // Copy out through a scratch region above the
                        // value, then rebuild the stack.
                        let shape = self.env.loader.shape_of(self.assembly, s, None)?;
                        let mt = shape.mt.ok_or(RuntimeError::Compile(
                            CompileError::UnresolvedToken(token, "nested value field"),
                        ))?;
                        self.e.lea(Gpr::Rsi, Mem::disp(Gpr::Rbp, field_off));
                        self.stack.pop();
                        let dst = self.push_value(mt, shape.size);
                        self.e.lea(Gpr::Rdi, Mem::disp(Gpr::Rbp, dst));
                        self.e.mov_ri(Gpr::Rcx, shape.size as i64);
                        self.e.rep_movsb();
                    }
                    s => {
                        // Scalars: load to a register, pop the value,
                        // push the field.
                        self.e.lea(Gpr::Rdx, Mem::disp(Gpr::Rbp, field_off));
                        self.stack.pop();
                        self.emit_load_typed(Gpr::Rdx, 0, s, self.assembly)?;
                    }
                }
            }
            _ => {
                return Err(RuntimeError::Compile(CompileError::StackMismatch(
                    0,
                    "field access on a non-object operand",
                )))
            }
        }
        Ok(())
    }

    fn item_mem_at(&self, n: usize) -> Mem {
        Mem::disp(Gpr::Rbp, self.item_off(n))
    }

    pub(super) fn lower_ldflda(&mut self, token: Token) -> Result<()> {
        let field = self.env.loader.resolve_field(self.assembly, token)?;
        if field.is_static {
            return self.lower_ldsflda(token);
        }
        let target = self.stack.top().cloned().ok_or(RuntimeError::Compile(
            CompileError::StackUnderflow(0),
        ))?;
        match target.tag {
            EvalTag::Ref => {
                self.pop_gpr(Gpr::Rax)?;
                self.emit_null_check(Gpr::Rax);
                self.e.add_ri(Gpr::Rax, field.offset as i32);
                self.push_gpr(EvalTag::Ptr, Gpr::Rax);
            }
            EvalTag::Ptr | EvalTag::NInt => {
                self.pop_gpr(Gpr::Rax)?;
                self.e.add_ri(Gpr::Rax, field.offset as i32);
                self.push_gpr(EvalTag::Ptr, Gpr::Rax);
            }
            _ => {
                return Err(RuntimeError::Compile(CompileError::StackMismatch(
                    0,
                    "address of a field of an evaluation-stack value",
                )))
            }
        }
        Ok(())
    }

    pub(super) fn lower_stfld(&mut self, token: Token) -> Result<()> {
        let field = self.env.loader.resolve_field(self.assembly, token)?;
        if field.is_static {
            return self.lower_stsfld(token);
        }
        // Stack: [target, value].
        let target = self.stack.peek(1).cloned().ok_or(RuntimeError::Compile(
            CompileError::StackUnderflow(0),
        ))?;
        if !matches!(target.tag, EvalTag::Ref | EvalTag::Ptr | EvalTag::NInt) {
            return Err(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "storing a field of a non-addressable target",
            )));
        }
        let target_off = self.item_off(1);
        self.e.mov_rm(Gpr::Rdx, Mem::disp(Gpr::Rbp, target_off));
        if target.tag == EvalTag::Ref {
            self.emit_null_check(Gpr::Rdx);
        }
        self.emit_store_typed(Gpr::Rdx, field.offset as i32, &field.sig.clone())?;
        self.stack.pop(); // the target
        Ok(())
    }

    pub(super) fn lower_ldsfld(&mut self, token: Token) -> Result<()> {
        let field = self.env.loader.resolve_field(self.assembly, token)?;
        if !field.is_static {
            return Err(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "ldsfld on an instance field",
            )));
        }
        self.e.mov_ri64(Gpr::Rdx, field.static_addr as u64);
        self.emit_load_typed(Gpr::Rdx, 0, &field.sig.clone(), self.assembly)
    }

    pub(super) fn lower_ldsflda(&mut self, token: Token) -> Result<()> {
        let field = self.env.loader.resolve_field(self.assembly, token)?;
        self.e.mov_ri64(Gpr::Rax, field.static_addr as u64);
        self.push_gpr(EvalTag::Ptr, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_stsfld(&mut self, token: Token) -> Result<()> {
        let field = self.env.loader.resolve_field(self.assembly, token)?;
        self.e.mov_ri64(Gpr::Rdx, field.static_addr as u64);
        self.emit_store_typed(Gpr::Rdx, 0, &field.sig.clone())
    }

    // ---- strings, objects, arrays ----

    pub(super) fn lower_ldstr(&mut self, token: Token) -> Result<()> {
        self.e.mov_ri(Gpr::Rcx, self.assembly as i64);
        self.e.mov_ri(Gpr::Rdx, token.0 as i64);
        let bridge = self.env.bridges.ldstr;
        self.helper_call(bridge);
        self.push_gpr(EvalTag::Ref, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_newobj(&mut self, token: Token) -> Result<()> {
        let ctor = self.env.loader.resolve_method(self.assembly, token)?;
        let plan = self.build_plan(ctor.assembly, &ctor.sig)?;
        let declaring = ctor.declaring;
        let cell = self.reserve(ctor.assembly, ctor.token);

        if declaring.is_value_type() {
            // Construct into a zeroed scratch value above the arguments,
            // pass its address as `this`, then move it down to where the
            // arguments began.
            let size = declaring.base_size() as u32;
            let slots = (size.max(1) + 7) / 8;
            let args_slots: u32 = (0..ctor.sig.params.len())
                .map(|i| self.stack.peek(i).map_or(0, |it| it.slots))
                .sum();
            let result_first = self.stack.depth_slots() - args_slots;

            let temp_off = self.push_value(declaring, size);
            for piece in 0..slots {
                self.e
                    .mov_mi(Mem::disp(Gpr::Rbp, temp_off + 8 * piece as i32), 0);
            }
            self.lower_ctor_call_on_temp(&plan, &cell, temp_off)?;

            // Pop the temp, pop nothing else (args were consumed by the
            // call), then push the result region and copy downward.
            let dest_last_slot = result_first + slots - 1;
            let dest_off = crate::jit::compiler::stack::EvalStack::slot_offset(
                dest_last_slot,
                self.eval_base,
            );
            if dest_off != temp_off {
                for piece in (0..slots).rev() {
                    self.e.mov_rm(
                        Gpr::Rax,
                        Mem::disp(Gpr::Rbp, temp_off + 8 * piece as i32),
                    );
                    self.e.mov_mr(
                        Mem::disp(Gpr::Rbp, dest_off + 8 * piece as i32),
                        Gpr::Rax,
                    );
                }
            }
            self.stack.push(Item::value(declaring, size));
            self.note_eval_depth();
            return Ok(());
        }

        // Reference type: allocate, then run the constructor with the
        // fresh object as `this`.
        self.e
            .mov_ri64(Gpr::Rcx, declaring as *const MethodTable as usize as u64);
        let bridge = self.env.bridges.alloc_object;
        self.helper_call(bridge);
        self.push_gpr(EvalTag::Ref, Gpr::Rax);

        // Stack is now [args..., obj]; the constructor wants this first.
        self.lower_ctor_call_on_obj(&plan, &cell)?;
        Ok(())
    }

    /// Invoke a constructor whose `this` is the scratch value at
    /// `temp_off`, consuming the argument items beneath the temp.
    fn lower_ctor_call_on_temp(
        &mut self,
        plan: &super::CallPlan,
        cell: &crate::jit::registry::MethodCell,
        temp_off: i32,
    ) -> Result<()> {
        // Arguments are items 1..=n (the temp is item 0).
        let arg_count = plan.args.len() - 1; // minus `this`
        if plan.total_slots > 4 {
            self.max_extra_out = self.max_extra_out.max(plan.total_slots - 4);
        }
        let mut moves: Vec<(u32, super::ArgMove)> = Vec::new();
        moves.push((0, super::ArgMove::Lea(temp_off)));
        for (i, plan_arg) in plan.args.iter().skip(1).enumerate() {
            let item_index = arg_count - i; // below the temp
            self.plan_arg_moves(plan_arg, item_index, &mut moves)?;
        }
        for (slot, mv) in moves.iter().filter(|(s, _)| *s >= 4) {
            self.emit_arg_move(*mv, super::ArgDest::Stack(*slot));
        }
        for (slot, mv) in moves.iter().filter(|(s, _)| *s < 4) {
            self.emit_arg_move(*mv, super::ArgDest::Reg(*slot));
        }
        // Pop temp and arguments from the mirror before the safepoint.
        for _ in 0..arg_count + 1 {
            self.stack.pop();
        }
        self.emit_call_cell(cell);
        Ok(())
    }

    /// Invoke a constructor on the freshly allocated object on top of the
    /// stack: [args..., obj].
    fn lower_ctor_call_on_obj(
        &mut self,
        plan: &super::CallPlan,
        cell: &crate::jit::registry::MethodCell,
    ) -> Result<()> {
        let arg_count = plan.args.len() - 1;
        if plan.total_slots > 4 {
            self.max_extra_out = self.max_extra_out.max(plan.total_slots - 4);
        }
        let obj_off = self.item_off(0);
        let mut moves: Vec<(u32, super::ArgMove)> = Vec::new();
        moves.push((0, super::ArgMove::Load(obj_off)));
        for (i, plan_arg) in plan.args.iter().skip(1).enumerate() {
            let item_index = arg_count - i; // items below the object
            self.plan_arg_moves(plan_arg, item_index, &mut moves)?;
        }
        for (slot, mv) in moves.iter().filter(|(s, _)| *s >= 4) {
            self.emit_arg_move(*mv, super::ArgDest::Stack(*slot));
        }
        for (slot, mv) in moves.iter().filter(|(s, _)| *s < 4) {
            self.emit_arg_move(*mv, super::ArgDest::Reg(*slot));
        }

        // Result region: where the first argument used to live.
        let args_slots: u32 = (1..=arg_count)
            .map(|i| self.stack.peek(i).map_or(0, |it| it.slots))
            .sum();
        let result_slot = self.stack.depth_slots() - 1 - args_slots;

        for _ in 0..arg_count + 1 {
            self.stack.pop();
        }
        self.emit_call_cell(cell);

        // Recover the object (its old slot is above the current depth
        // and still intact) and push it as the result.
        self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, obj_off));
        self.stack.push(Item::scalar(EvalTag::Ref));
        self.note_eval_depth();
        let dest = self.item_off(0);
        self.e.mov_mr(Mem::disp(Gpr::Rbp, dest), Gpr::Rax);
        debug_assert_eq!(
            crate::jit::compiler::stack::EvalStack::slot_offset(result_slot, self.eval_base),
            dest
        );
        Ok(())
    }

    /// Shared per-argument move planning for the constructor paths.
    fn plan_arg_moves(
        &mut self,
        plan_arg: &super::PlanArg,
        item_index: usize,
        moves: &mut Vec<(u32, super::ArgMove)>,
    ) -> Result<()> {
        let off = self.item_off(item_index);
        match plan_arg.kind {
            PlanKind::Gpr(_) => moves.push((plan_arg.first_slot, super::ArgMove::Load(off))),
            PlanKind::F32 => {
                let from_f64 = matches!(
                    self.stack.peek(item_index).map(|i| i.tag),
                    Some(EvalTag::Float64)
                );
                moves.push((plan_arg.first_slot, super::ArgMove::LoadF32(off, from_f64)));
            }
            PlanKind::F64 => {
                let from_f32 = matches!(
                    self.stack.peek(item_index).map(|i| i.tag),
                    Some(EvalTag::Float32)
                );
                moves.push((plan_arg.first_slot, super::ArgMove::LoadF64(off, from_f32)));
            }
            PlanKind::ValueSlots => {
                for piece in 0..plan_arg.count {
                    moves.push((
                        plan_arg.first_slot + piece,
                        super::ArgMove::Load(off + 8 * piece as i32),
                    ));
                }
            }
            PlanKind::ValuePointer => {
                moves.push((plan_arg.first_slot, super::ArgMove::Lea(off)));
            }
            PlanKind::RetBuf => {
                return Err(RuntimeError::Compile(CompileError::StackMismatch(
                    0,
                    "constructor with a return buffer",
                )))
            }
        }
        Ok(())
    }

    pub(super) fn lower_newarr(&mut self, token: Token) -> Result<()> {
        let elem_mt = self.env.loader.resolve_type(self.assembly, token)?;
        // Element shape reconstructed from its MethodTable; the sig is
        // only a cache-name fallback.
        let elem_sig = TypeSig::Class(token);
        let shape = crate::assembly::loader::Shape {
            size: if elem_mt.is_value_type() {
                elem_mt.base_size() as u32
            } else {
                8
            },
            align: 8,
            is_ref: !elem_mt.is_value_type(),
            series: if elem_mt.is_value_type() {
                elem_mt.gc_series().to_vec()
            } else {
                Vec::new()
            },
            mt: Some(elem_mt),
        };
        let array_mt = self.env.loader.array_of(self.assembly, &elem_sig, &shape)?;

        self.pop_gpr(Gpr::Rdx)?; // length
        self.e
            .mov_ri64(Gpr::Rcx, array_mt as *const MethodTable as usize as u64);
        let bridge = self.env.bridges.alloc_array;
        self.helper_call(bridge);
        self.push_gpr(EvalTag::Ref, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_ldlen(&mut self) -> Result<()> {
        self.pop_gpr(Gpr::Rdx)?;
        self.emit_null_check(Gpr::Rdx);
        self.e
            .mov_rm(Gpr::Rax, Mem::disp(Gpr::Rdx, crate::object::ARRAY_LENGTH_OFFSET as i32));
        self.push_gpr(EvalTag::NInt, Gpr::Rax);
        Ok(())
    }

    /// Pop [array, index]; leave the element address in rdx. The caller
    /// provides the element stride.
    fn emit_element_addr(&mut self, elem_size: u32) -> Result<()> {
        self.pop_gpr(Gpr::Rcx)?; // index
        self.pop_gpr(Gpr::Rdx)?; // array
        self.emit_element_addr_regs(elem_size);
        Ok(())
    }

    /// Element address from rdx (array) and rcx (index): null check,
    /// unsigned bounds check (negative indexes wrap past any length),
    /// then scale and offset. Result in rdx.
    fn emit_element_addr_regs(&mut self, elem_size: u32) {
        self.emit_null_check(Gpr::Rdx);
        self.e.cmp_rm(
            Gpr::Rcx,
            Mem::disp(Gpr::Rdx, crate::object::ARRAY_LENGTH_OFFSET as i32),
        );
        self.emit_check(Cc::B, ThrowKind::IndexOutOfRange);
        if elem_size.is_power_of_two() {
            let shift = elem_size.trailing_zeros() as u8;
            if shift > 0 {
                self.e.shl_ri(Gpr::Rcx, shift);
            }
        } else {
            self.e.mov_ri(Gpr::Rax, elem_size as i64);
            self.e.imul_rr(Gpr::Rcx, Gpr::Rax);
        }
        self.e
            .add_ri(Gpr::Rcx, crate::object::ARRAY_DATA_OFFSET as i32);
        self.e.add_rr(Gpr::Rdx, Gpr::Rcx);
    }

    pub(super) fn lower_ldelem_scalar(&mut self, kind: IndKind) -> Result<()> {
        self.emit_element_addr(kind.size())?;
        self.emit_load_typed(Gpr::Rdx, 0, &Self::ind_sig(kind), self.assembly)
    }

    pub(super) fn lower_stelem_scalar(&mut self, kind: IndKind) -> Result<()> {
        // Stack: [array, index, value]. The value's bytes stay put above
        // the popped depth, so remember where it was and consume the
        // mirror entries before computing the element address.
        let value_off = self.item_off(0);
        let value = self.stack.pop().ok_or(RuntimeError::Compile(
            CompileError::StackUnderflow(0),
        ))?;
        self.emit_element_addr(kind.size())?;
        self.emit_store_kind_from(kind, value_off, value.tag)
    }

    /// Store a scalar from a frame offset into [rdx] by access kind.
    fn emit_store_kind_from(&mut self, kind: IndKind, src: i32, tag: EvalTag) -> Result<()> {
        let src_mem = Mem::disp(Gpr::Rbp, src);
        match kind {
            IndKind::R4 => {
                if tag == EvalTag::Float64 {
                    self.e.movsd_rm(Xmm::Xmm0, src_mem);
                    self.e.cvtsd2ss(Xmm::Xmm0, Xmm::Xmm0);
                } else {
                    self.e.movss_rm(Xmm::Xmm0, src_mem);
                }
                self.e.movss_mr(Mem::base(Gpr::Rdx), Xmm::Xmm0);
            }
            IndKind::R8 => {
                if tag == EvalTag::Float32 {
                    self.e.movss_rm(Xmm::Xmm0, src_mem);
                    self.e.cvtss2sd(Xmm::Xmm0, Xmm::Xmm0);
                } else {
                    self.e.movsd_rm(Xmm::Xmm0, src_mem);
                }
                self.e.movsd_mr(Mem::base(Gpr::Rdx), Xmm::Xmm0);
            }
            IndKind::I1 | IndKind::U1 => {
                self.e.mov_rm(Gpr::Rax, src_mem);
                self.e.store8(Mem::base(Gpr::Rdx), Gpr::Rax);
            }
            IndKind::I2 | IndKind::U2 => {
                self.e.mov_rm(Gpr::Rax, src_mem);
                self.e.store16(Mem::base(Gpr::Rdx), Gpr::Rax);
            }
            IndKind::I4 | IndKind::U4 => {
                self.e.mov_rm(Gpr::Rax, src_mem);
                self.e.mov_mr32(Mem::base(Gpr::Rdx), Gpr::Rax);
            }
            IndKind::I8 | IndKind::I | IndKind::Ref => {
                self.e.mov_rm(Gpr::Rax, src_mem);
                self.e.mov_mr(Mem::base(Gpr::Rdx), Gpr::Rax);
            }
        }
        Ok(())
    }

    pub(super) fn lower_ldelem_any(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        if mt.is_value_type() {
            let size = mt.base_size() as u32;
            self.emit_element_addr(size)?;
            let dst = self.push_value(mt, size);
            self.emit_copy(Mem::disp(Gpr::Rbp, dst), Mem::base(Gpr::Rdx), size);
        } else {
            self.emit_element_addr(8)?;
            self.e.mov_rm(Gpr::Rax, Mem::base(Gpr::Rdx));
            self.push_gpr(EvalTag::Ref, Gpr::Rax);
        }
        Ok(())
    }

    pub(super) fn lower_stelem_any(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        if mt.is_value_type() {
            let size = mt.base_size() as u32;
            let value_off = self.item_off(0);
            self.stack.pop().ok_or(RuntimeError::Compile(
                CompileError::StackUnderflow(0),
            ))?;
            self.emit_element_addr(size)?;
            self.emit_copy(Mem::base(Gpr::Rdx), Mem::disp(Gpr::Rbp, value_off), size);
            Ok(())
        } else {
            self.lower_stelem_scalar(IndKind::Ref)
        }
    }

    pub(super) fn lower_ldelema(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        let size = if mt.is_value_type() {
            mt.base_size() as u32
        } else {
            8
        };
        self.emit_element_addr(size)?;
        self.push_gpr(EvalTag::Ptr, Gpr::Rdx);
        Ok(())
    }

    // ---- boxing and casts ----

    pub(super) fn lower_box(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        if !mt.is_value_type() {
            return Ok(()); // boxing a reference type is the identity
        }
        if self.stack.is_empty() {
            return Err(RuntimeError::Compile(CompileError::StackUnderflow(0)));
        }
        let src = self.item_off(0);
        self.e
            .mov_ri64(Gpr::Rcx, mt as *const MethodTable as usize as u64);
        self.e.lea(Gpr::Rdx, Mem::disp(Gpr::Rbp, src));
        // The value stays in the mirror across the helper so any refs
        // inside it survive a collection during allocation.
        let bridge = self.env.bridges.box_value;
        self.helper_call(bridge);
        self.stack.pop();
        self.push_gpr(EvalTag::Ref, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_unbox(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        let obj_mem = self.item_mem_at(0);
        self.e.mov_rm(Gpr::Rcx, obj_mem);
        self.e
            .mov_ri64(Gpr::Rdx, mt as *const MethodTable as usize as u64);
        let bridge = self.env.bridges.unbox;
        self.helper_call(bridge);
        self.stack.pop();
        self.push_gpr(EvalTag::Ptr, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_unbox_any(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        if mt.is_value_type() {
            self.lower_unbox(token)?;
            self.pop_gpr(Gpr::Rdx)?;
            let size = mt.base_size() as u32;
            let dst = self.push_value(mt, size);
            self.emit_copy(Mem::disp(Gpr::Rbp, dst), Mem::base(Gpr::Rdx), size);
            Ok(())
        } else {
            self.lower_castclass(token)
        }
    }

    pub(super) fn lower_isinst(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        let obj_mem = self.item_mem_at(0);
        self.e.mov_rm(Gpr::Rcx, obj_mem);
        self.e
            .mov_ri64(Gpr::Rdx, mt as *const MethodTable as usize as u64);
        let bridge = self.env.bridges.isinst;
        self.helper_call(bridge);
        self.stack.pop();
        self.push_gpr(EvalTag::Ref, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_castclass(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        let obj_mem = self.item_mem_at(0);
        self.e.mov_rm(Gpr::Rcx, obj_mem);
        self.e
            .mov_ri64(Gpr::Rdx, mt as *const MethodTable as usize as u64);
        let bridge = self.env.bridges.castclass;
        self.helper_call(bridge);
        self.stack.pop();
        self.push_gpr(EvalTag::Ref, Gpr::Rax);
        Ok(())
    }

    // ---- calls ----

    /// Target name and signature without full resolution; constrained
    /// calls on primitives must not require the target to exist as
    /// metadata.
    fn peek_method_shape(&self, token: Token) -> Result<(String, MethodSig)> {
        let record = self.env.loader.assemblies.get(self.assembly)?;
        let (name, sig_blob) = match token.table()? {
            TableId::MethodDef => {
                let row = record.view.tables().method_def(token.rid())?;
                (row.name, row.signature)
            }
            TableId::MemberRef => {
                let row = record.view.tables().member_ref(token.rid())?;
                (row.name, row.signature)
            }
            _ => {
                return Err(RuntimeError::Compile(CompileError::UnresolvedToken(
                    token,
                    "call target",
                )))
            }
        };
        let name = record.view.strings().get(name)?.to_string();
        let sig = MethodSig::parse(&mut record.view.blobs().reader(sig_blob)?)?;
        Ok((name, sig))
    }

    pub(super) fn lower_managed_call(
        &mut self,
        token: Token,
        is_callvirt: bool,
        offset: u32,
    ) -> Result<()> {
        let constrained = self.constrained.take();

        // Primitive receivers bypass the vtable entirely: their ahead-of-
        // time entries would expect a boxed receiver.
        if let Some(ctoken) = constrained {
            let cmt = self.env.loader.resolve_type(self.assembly, ctoken)?;
            if cmt.is_value_type() {
                let (name, sig) = self.peek_method_shape(token)?;
                if self.try_inline_primitive(cmt, &name, &sig)?.is_some() {
                    return Ok(());
                }
            }
        }

        let resolved = self.env.loader.resolve_method(self.assembly, token)?;
        let plan = self.build_plan(resolved.assembly, &resolved.sig)?;
        let is_virtual = resolved
            .flags
            .contains(silex_metadata::MethodAttributes::VIRTUAL);

        if let Some(ctoken) = constrained {
            let cmt = self.env.loader.resolve_type(self.assembly, ctoken)?;
            if cmt.is_value_type() {
                if std::ptr::eq(resolved.declaring, cmt) {
                    // The value type overrides: call directly with the
                    // managed pointer already on the stack.
                    let cell = self.reserve(resolved.assembly, resolved.token);
                    return self.lower_call(&plan, None, Some(&cell), false, false);
                }
                // Inherited implementation expects a boxed receiver.
                let arg_items = resolved.sig.params.len();
                let recv_off = self.item_off(arg_items);
                self.e
                    .mov_ri64(Gpr::Rcx, cmt as *const MethodTable as usize as u64);
                self.e.mov_rm(Gpr::Rdx, Mem::disp(Gpr::Rbp, recv_off));
                let bridge = self.env.bridges.box_value;
                self.helper_call(bridge);
                self.e.mov_mr(Mem::disp(Gpr::Rbp, recv_off), Gpr::Rax);
                self.stack.replace(arg_items, Item::scalar(EvalTag::Ref));
            } else {
                // Constrained on a reference type: the receiver slot
                // holds a pointer to the reference; load it through.
                let arg_items = resolved.sig.params.len();
                let recv_off = self.item_off(arg_items);
                self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, recv_off));
                self.e.mov_rm(Gpr::Rax, Mem::base(Gpr::Rax));
                self.e.mov_mr(Mem::disp(Gpr::Rbp, recv_off), Gpr::Rax);
                self.stack.replace(arg_items, Item::scalar(EvalTag::Ref));
            }
        }

        if is_callvirt && is_virtual {
            let slot = resolved.vtable_slot.ok_or(RuntimeError::Compile(
                CompileError::UnsupportedOpcode(
                    format!("virtual dispatch on {}", resolved.name),
                    offset,
                ),
            ))?;
            self.lower_call(&plan, Some(slot), None, false, false)
        } else {
            let cell = self.reserve(resolved.assembly, resolved.token);
            let needs_null_check = is_callvirt && resolved.sig.has_this;
            self.lower_call(&plan, None, Some(&cell), false, needs_null_check)
        }
    }

    /// Constrained `GetHashCode`/`Equals` on the built-in primitives
    /// bypass the vtable: their pre-built entries would expect a boxed
    /// receiver.
    fn try_inline_primitive(
        &mut self,
        cmt: &'static MethodTable,
        name: &str,
        sig: &MethodSig,
    ) -> Result<Option<()>> {
        let known = &self.env.loader.known;
        let size: u32 = if std::ptr::eq(cmt, known.int32)
            || std::ptr::eq(cmt, known.uint32)
            || std::ptr::eq(cmt, known.float32)
        {
            4
        } else if std::ptr::eq(cmt, known.int64)
            || std::ptr::eq(cmt, known.uint64)
            || std::ptr::eq(cmt, known.intptr)
            || std::ptr::eq(cmt, known.uintptr)
            || std::ptr::eq(cmt, known.float64)
        {
            8
        } else if std::ptr::eq(cmt, known.int16) || std::ptr::eq(cmt, known.uint16)
            || std::ptr::eq(cmt, known.char)
        {
            2
        } else if std::ptr::eq(cmt, known.int8)
            || std::ptr::eq(cmt, known.uint8)
            || std::ptr::eq(cmt, known.boolean)
        {
            1
        } else {
            return Ok(None);
        };
        match name {
            "GetHashCode" if sig.has_this && sig.params.is_empty() => {
                // Receiver is a managed pointer to the primitive.
                self.pop_gpr(Gpr::Rdx)?;
                match size {
                    1 => self.e.load8_zx(Gpr::Rax, Mem::base(Gpr::Rdx)),
                    2 => self.e.load16_zx(Gpr::Rax, Mem::base(Gpr::Rdx)),
                    4 => self.e.load32_sx(Gpr::Rax, Mem::base(Gpr::Rdx)),
                    _ => {
                        // 64-bit: fold the halves, the canonical identity
                        // hash.
                        self.e.mov_rm(Gpr::Rax, Mem::base(Gpr::Rdx));
                        self.e.mov_rr(Gpr::Rcx, Gpr::Rax);
                        self.e.shr_ri(Gpr::Rcx, 32);
                        self.e.xor_rr(Gpr::Rax, Gpr::Rcx);
                        self.e.movsxd(Gpr::Rax, Gpr::Rax);
                    }
                }
                self.push_gpr(EvalTag::I32, Gpr::Rax);
                Ok(Some(()))
            }
            "Equals" if sig.has_this && sig.params.len() == 1 => {
                self.emit_primitive_equals(cmt, size)?;
                Ok(Some(()))
            }
            _ => Ok(None),
        }
    }

    /// Inline `Equals` for a primitive receiver: the argument arrives as
    /// the plain value (the typed overload), a managed pointer, or a
    /// boxed instance, and equality is payload-bit equality at the
    /// primitive's width.
    fn emit_primitive_equals(&mut self, cmt: &'static MethodTable, size: u32) -> Result<()> {
        let arg = self.stack.top().cloned().ok_or(RuntimeError::Compile(
            CompileError::StackUnderflow(0),
        ))?;
        match arg.tag {
            EvalTag::Ptr => {
                self.pop_gpr(Gpr::Rcx)?; // argument pointer
                self.pop_gpr(Gpr::Rdx)?; // receiver pointer
                self.emit_load_payload(Gpr::Rax, Gpr::Rdx, 0, size);
                self.emit_load_payload(Gpr::Rcx, Gpr::Rcx, 0, size);
            }
            EvalTag::Ref => {
                // Boxed argument: null or a foreign runtime type is
                // unequal; otherwise compare against the boxed payload.
                self.pop_gpr(Gpr::Rcx)?; // boxed argument
                self.pop_gpr(Gpr::Rdx)?; // receiver pointer
                self.e.test_rr(Gpr::Rcx, Gpr::Rcx);
                let null = self.e.jcc_forward(Cc::E);
                self.e.mov_rm(Gpr::Rax, Mem::base(Gpr::Rcx));
                self.e
                    .mov_ri64(Gpr::R10, cmt as *const MethodTable as usize as u64);
                self.e.cmp_rr(Gpr::Rax, Gpr::R10);
                let foreign = self.e.jcc_forward(Cc::Ne);
                self.emit_load_payload(Gpr::Rax, Gpr::Rdx, 0, size);
                self.emit_load_payload(
                    Gpr::Rcx,
                    Gpr::Rcx,
                    crate::object::FIELDS_OFFSET as i32,
                    size,
                );
                self.e.cmp_rr(Gpr::Rax, Gpr::Rcx);
                self.e.setcc_zx(Cc::E, Gpr::Rax);
                let done = self.e.jmp_forward();
                let miss = self.e.offset();
                self.e.patch(null, miss);
                self.e.patch(foreign, miss);
                self.e.xor_rr32(Gpr::Rax, Gpr::Rax);
                let end = self.e.offset();
                self.e.patch(done, end);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
                return Ok(());
            }
            _ => {
                // Plain value of the primitive's own width. Narrow slots
                // may carry stale upper bits (a raw float single, say),
                // so both sides normalise to the payload width.
                let mem = self.item_mem_at(0);
                self.e.mov_rm(Gpr::Rcx, mem);
                self.stack.pop();
                self.pop_gpr(Gpr::Rdx)?; // receiver pointer
                self.emit_load_payload(Gpr::Rax, Gpr::Rdx, 0, size);
                match size {
                    1 => self.e.movzx8(Gpr::Rcx, Gpr::Rcx),
                    2 => self.e.movzx16(Gpr::Rcx, Gpr::Rcx),
                    4 => self.e.mov_rr32(Gpr::Rcx, Gpr::Rcx),
                    _ => {}
                }
            }
        }
        self.e.cmp_rr(Gpr::Rax, Gpr::Rcx);
        self.e.setcc_zx(Cc::E, Gpr::Rax);
        self.push_gpr(EvalTag::I32, Gpr::Rax);
        Ok(())
    }

    /// Zero-extending payload load at the primitive's width.
    fn emit_load_payload(&mut self, dst: Gpr, base: Gpr, offset: i32, size: u32) {
        let mem = Mem::disp(base, offset);
        match size {
            1 => self.e.load8_zx(dst, mem),
            2 => self.e.load16_zx(dst, mem),
            4 => self.e.mov_rm32(dst, mem),
            _ => self.e.mov_rm(dst, mem),
        }
    }

    pub(super) fn lower_calli(&mut self, token: Token) -> Result<()> {
        // The token is a StandAloneSig describing the call shape; the
        // function pointer sits below the arguments.
        if token.table()? != TableId::StandAloneSig {
            return Err(RuntimeError::Compile(CompileError::UnresolvedToken(
                token,
                "calli signature",
            )));
        }
        let record = self.env.loader.assemblies.get(self.assembly)?;
        let blob = record.view.tables().stand_alone_sig(token.rid())?;
        let sig = MethodSig::parse(&mut record.view.blobs().reader(blob)?)?;
        let plan = self.build_plan(self.assembly, &sig)?;
        self.lower_call(&plan, None, None, true, false)
    }

    /// `jmp`: tail-transfer to a method with the same signature, reusing
    /// this frame's incoming arguments.
    pub(super) fn lower_jmp_call(&mut self, token: Token) -> Result<()> {
        if !self.stack.is_empty() {
            return Err(RuntimeError::Compile(CompileError::StackMismatch(
                0,
                "jmp with a non-empty evaluation stack",
            )));
        }
        let resolved = self.env.loader.resolve_method(self.assembly, token)?;
        let cell = self.reserve(resolved.assembly, resolved.token);

        // Reload the register-bank arguments from their homes, tear the
        // frame down, and jump; the stack-passed arguments are already in
        // the caller's outgoing area, which becomes the target's view.
        const GPRS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];
        const XMMS: [Xmm; 4] = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3];
        let own = self.own_plan.clone();
        for arg in &own.args {
            for piece in 0..arg.count {
                let slot = arg.first_slot + piece;
                if slot >= 4 {
                    continue;
                }
                let home = Self::arg_home(slot);
                match arg.kind {
                    PlanKind::F32 => self.e.movss_rm(XMMS[slot as usize], home),
                    PlanKind::F64 => self.e.movsd_rm(XMMS[slot as usize], home),
                    _ => self.e.mov_rm(GPRS[slot as usize], home),
                }
            }
        }
        self.e.mov_ri64(Gpr::Rax, cell.entry_slot_addr() as u64);
        self.e.mov_rm(Gpr::Rax, Mem::base(Gpr::Rax));
        self.e.mov_rr(Gpr::R10, Gpr::Rax);
        self.e.lea(Gpr::Rsp, Mem::disp(Gpr::Rbp, -56));
        for reg in [
            Gpr::R15,
            Gpr::R14,
            Gpr::R13,
            Gpr::R12,
            Gpr::Rsi,
            Gpr::Rdi,
            Gpr::Rbx,
        ] {
            self.e.pop_r(reg);
        }
        self.e.pop_r(Gpr::Rbp);
        self.e.jmp_r(Gpr::R10);
        self.unreachable = true;
        Ok(())
    }

    pub(super) fn lower_ldftn(&mut self, token: Token) -> Result<()> {
        let resolved = self.env.loader.resolve_method(self.assembly, token)?;
        let cell = self.reserve(resolved.assembly, resolved.token);
        self.e.mov_ri64(Gpr::Rax, cell.entry_slot_addr() as u64);
        self.e.mov_rm(Gpr::Rax, Mem::base(Gpr::Rax));
        self.push_gpr(EvalTag::NInt, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_ldvirtftn(&mut self, token: Token) -> Result<()> {
        let resolved = self.env.loader.resolve_method(self.assembly, token)?;
        let slot = resolved.vtable_slot.ok_or(RuntimeError::Compile(
            CompileError::UnsupportedOpcode("ldvirtftn on a non-virtual".into(), 0),
        ))?;
        self.pop_gpr(Gpr::Rax)?;
        self.emit_null_check(Gpr::Rax);
        self.e.mov_rm(Gpr::Rax, Mem::base(Gpr::Rax));
        self.e.mov_rm(
            Gpr::Rax,
            Mem::disp(
                Gpr::Rax,
                crate::types::VTABLE_OFFSET as i32 + 8 * slot as i32,
            ),
        );
        self.push_gpr(EvalTag::NInt, Gpr::Rax);
        Ok(())
    }

    // ---- type tokens and typed references ----

    pub(super) fn lower_ldtoken(&mut self, token: Token) -> Result<()> {
        match token.table()? {
            TableId::TypeDef | TableId::TypeRef | TableId::TypeSpec => {
                let mt = self.env.loader.resolve_type(self.assembly, token)?;
                self.e
                    .mov_ri64(Gpr::Rax, mt as *const MethodTable as usize as u64);
                self.push_gpr(EvalTag::NInt, Gpr::Rax);
                Ok(())
            }
            _ => Err(RuntimeError::Compile(CompileError::UnsupportedOpcode(
                "ldtoken on a member".into(),
                0,
            ))),
        }
    }

    pub(super) fn lower_mkrefany(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        self.pop_gpr(Gpr::Rax)?; // the pointer
        let typed_ref = self.env.loader.known.typed_ref;
        let base = self.push_value(typed_ref, 16);
        self.e.mov_mr(Mem::disp(Gpr::Rbp, base), Gpr::Rax);
        self.e
            .mov_ri64(Gpr::Rax, mt as *const MethodTable as usize as u64);
        self.e.mov_mr(Mem::disp(Gpr::Rbp, base + 8), Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_refanyval(&mut self, token: Token) -> Result<()> {
        let mt = self.env.loader.resolve_type(self.assembly, token)?;
        let base = self.item_off(0);
        self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, base + 8));
        self.e
            .mov_ri64(Gpr::Rcx, mt as *const MethodTable as usize as u64);
        self.e.cmp_rr(Gpr::Rax, Gpr::Rcx);
        self.emit_check(Cc::E, ThrowKind::InvalidCast);
        self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, base));
        self.stack.pop();
        self.push_gpr(EvalTag::Ptr, Gpr::Rax);
        Ok(())
    }

    pub(super) fn lower_refanytype(&mut self) -> Result<()> {
        let base = self.item_off(0);
        self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, base + 8));
        self.stack.pop();
        self.push_gpr(EvalTag::NInt, Gpr::Rax);
        Ok(())
    }
}
