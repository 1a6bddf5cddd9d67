//! Instruction lowering: dispatch, arithmetic, branches, conversions
//!
//! Straight-line code per instruction: read the inputs off the top of the
//! evaluation stack, compute in rax/rcx (or xmm0/xmm1), write the result
//! back. 32-bit integers stay canonically sign-extended in their slots so
//! mixed-width operations need no fix-ups at use sites.

use super::stack::{EvalTag, Item};
use super::{MethodCompiler, ThrowKind};
use crate::error::{CompileError, Result, RuntimeError};
use crate::jit::emitter::{Cc, Gpr, Mem, Xmm};
use silex_metadata::{CmpCond, ConvKind, Instruction, Op};

impl MethodCompiler<'_> {
    pub(super) fn lower_instruction(&mut self, instruction: &Instruction) -> Result<()> {
        let offset = instruction.offset;
        match instruction.op.clone() {
            Op::Nop => {}
            Op::Break => self.e.int3(),

            // ---- constants ----
            Op::LdNull => {
                self.stack.push(Item::scalar(EvalTag::Ref));
                self.note_eval_depth();
                let mem = self.item_mem(0);
                self.e.mov_mi(mem, 0);
            }
            Op::LdcI4(v) => {
                self.stack.push(Item::scalar(EvalTag::I32));
                self.note_eval_depth();
                let mem = self.item_mem(0);
                self.e.mov_mi(mem, v);
            }
            Op::LdcI8(v) => {
                self.e.mov_ri(Gpr::Rax, v);
                self.push_gpr(EvalTag::I64, Gpr::Rax);
            }
            Op::LdcR4(v) => {
                self.e.mov_ri(Gpr::Rax, v.to_bits() as i64);
                self.stack.push(Item::scalar(EvalTag::Float32));
                self.note_eval_depth();
                let mem = self.item_mem(0);
                self.e.mov_mr(mem, Gpr::Rax);
            }
            Op::LdcR8(v) => {
                self.e.mov_ri(Gpr::Rax, v.to_bits() as i64);
                self.stack.push(Item::scalar(EvalTag::Float64));
                self.note_eval_depth();
                let mem = self.item_mem(0);
                self.e.mov_mr(mem, Gpr::Rax);
            }

            // ---- stack shuffling ----
            Op::Dup => self.lower_dup()?,
            Op::Pop => {
                self.stack
                    .pop()
                    .ok_or(RuntimeError::Compile(CompileError::StackUnderflow(offset)))?;
            }

            // ---- arguments and locals ----
            Op::LdArg(n) => self.lower_ldarg(n)?,
            Op::LdArgA(n) => self.lower_ldarga(n)?,
            Op::StArg(n) => self.lower_starg(n)?,
            Op::LdLoc(n) => self.lower_ldloc(n)?,
            Op::LdLocA(n) => self.lower_ldloca(n)?,
            Op::StLoc(n) => self.lower_stloc(n)?,

            // ---- arithmetic ----
            Op::Add | Op::Sub | Op::Mul | Op::And | Op::Or | Op::Xor => {
                self.lower_binop(&instruction.op)?
            }
            Op::Div | Op::DivUn | Op::Rem | Op::RemUn => self.lower_div(&instruction.op)?,
            Op::Shl | Op::Shr | Op::ShrUn => self.lower_shift(&instruction.op)?,
            Op::Neg => self.lower_neg()?,
            Op::Not => self.lower_not()?,
            Op::AddOvf { unsigned } => self.lower_ovf_binop(OvfOp::Add, unsigned)?,
            Op::SubOvf { unsigned } => self.lower_ovf_binop(OvfOp::Sub, unsigned)?,
            Op::MulOvf { unsigned } => self.lower_ovf_binop(OvfOp::Mul, unsigned)?,

            // ---- comparisons ----
            Op::Ceq => self.lower_compare(CmpCond::Eq, false)?,
            Op::Cgt => self.lower_compare(CmpCond::Gt, false)?,
            Op::CgtUn => self.lower_compare(CmpCond::Gt, true)?,
            Op::Clt => self.lower_compare(CmpCond::Lt, false)?,
            Op::CltUn => self.lower_compare(CmpCond::Lt, true)?,

            // ---- branches ----
            Op::Br(target) => {
                self.emit_jump(target)?;
                self.unreachable = true;
            }
            Op::BrTrue(target) => {
                self.pop_gpr(Gpr::Rax)?;
                self.e.test_rr(Gpr::Rax, Gpr::Rax);
                self.emit_jcc(Cc::Ne, target)?;
            }
            Op::BrFalse(target) => {
                self.pop_gpr(Gpr::Rax)?;
                self.e.test_rr(Gpr::Rax, Gpr::Rax);
                self.emit_jcc(Cc::E, target)?;
            }
            Op::BrCmp {
                cond,
                unsigned,
                target,
            } => self.lower_branch_compare(cond, unsigned, target)?,
            Op::Switch(targets) => {
                self.pop_gpr(Gpr::Rax)?;
                for (index, target) in targets.iter().enumerate() {
                    self.e.cmp_ri32(Gpr::Rax, index as i32);
                    self.emit_jcc(Cc::E, *target)?;
                }
            }

            // ---- conversions ----
            Op::Conv(kind) => self.lower_conv(kind)?,
            Op::ConvOvf { kind, unsigned_src } => self.lower_conv_ovf(kind, unsigned_src)?,
            Op::ConvRUn => self.lower_conv_r_un()?,
            Op::CkFinite => self.lower_ckfinite()?,

            // ---- indirect and block memory ----
            Op::LdInd(kind) => self.lower_ldind(kind)?,
            Op::StInd(kind) => self.lower_stind(kind)?,
            Op::LdObj(token) => self.lower_ldobj(token)?,
            Op::StObj(token) => self.lower_stobj(token)?,
            Op::CpObj(token) => self.lower_cpobj(token)?,
            Op::InitObj(token) => self.lower_initobj(token)?,
            Op::CpBlk => {
                self.pop_gpr(Gpr::Rcx)?;
                self.pop_gpr(Gpr::Rsi)?;
                self.pop_gpr(Gpr::Rdi)?;
                self.e.rep_movsb();
            }
            Op::InitBlk => {
                self.pop_gpr(Gpr::Rcx)?;
                self.pop_gpr(Gpr::Rax)?;
                self.pop_gpr(Gpr::Rdi)?;
                self.e.rep_stosb();
            }

            // ---- fields ----
            Op::LdFld(token) => self.lower_ldfld(token)?,
            Op::LdFldA(token) => self.lower_ldflda(token)?,
            Op::StFld(token) => self.lower_stfld(token)?,
            Op::LdsFld(token) => self.lower_ldsfld(token)?,
            Op::LdsFldA(token) => self.lower_ldsflda(token)?,
            Op::StsFld(token) => self.lower_stsfld(token)?,

            // ---- objects, arrays, strings ----
            Op::LdStr(token) => self.lower_ldstr(token)?,
            Op::NewObj(token) => self.lower_newobj(token)?,
            Op::NewArr(token) => self.lower_newarr(token)?,
            Op::LdLen => self.lower_ldlen()?,
            Op::LdElem(kind) => self.lower_ldelem_scalar(kind)?,
            Op::LdElemAny(token) => self.lower_ldelem_any(token)?,
            Op::LdElemA(token) => self.lower_ldelema(token)?,
            Op::StElem(kind) => self.lower_stelem_scalar(kind)?,
            Op::StElemAny(token) => self.lower_stelem_any(token)?,
            Op::Box(token) => self.lower_box(token)?,
            Op::Unbox(token) => self.lower_unbox(token)?,
            Op::UnboxAny(token) => self.lower_unbox_any(token)?,
            Op::IsInst(token) => self.lower_isinst(token)?,
            Op::CastClass(token) => self.lower_castclass(token)?,

            // ---- calls ----
            Op::Call(token) => self.lower_managed_call(token, false, offset)?,
            Op::CallVirt(token) => self.lower_managed_call(token, true, offset)?,
            Op::CallI(token) => self.lower_calli(token)?,
            Op::Jmp(token) => self.lower_jmp_call(token)?,
            Op::Ret => self.lower_ret()?,
            Op::LdFtn(token) => self.lower_ldftn(token)?,
            Op::LdVirtFtn(token) => self.lower_ldvirtftn(token)?,

            // ---- exceptions ----
            Op::Throw => {
                let mem = self.item_mem(0);
                self.e.mov_rm(Gpr::Rcx, mem);
                self.stack.pop();
                let bridge = self.env.bridges.throw;
                self.helper_call(bridge);
                self.e.ud2();
                self.unreachable = true;
            }
            Op::Rethrow => {
                let bridge = self.env.bridges.rethrow;
                self.helper_call(bridge);
                self.e.ud2();
                self.unreachable = true;
            }
            Op::Leave(target) => self.lower_leave(offset, target)?,
            Op::EndFinally => self.lower_end_funclet(false)?,
            Op::EndFilter => self.lower_end_funclet(true)?,

            // ---- type machinery ----
            Op::SizeOf(token) => {
                let mt = self.env.loader.resolve_type(self.assembly, token)?;
                let size = if mt.is_value_type() {
                    mt.base_size() as i32
                } else {
                    8
                };
                self.stack.push(Item::scalar(EvalTag::I32));
                self.note_eval_depth();
                let mem = self.item_mem(0);
                self.e.mov_mi(mem, size);
            }
            Op::LdToken(token) => self.lower_ldtoken(token)?,
            Op::ArgList => {
                let total = self.own_plan.total_slots;
                self.e.lea(
                    Gpr::Rax,
                    Mem::disp(Gpr::Rbp, super::ARG_BASE + 8 * total as i32),
                );
                self.push_gpr(EvalTag::NInt, Gpr::Rax);
            }
            Op::MkRefAny(token) => self.lower_mkrefany(token)?,
            Op::RefAnyVal(token) => self.lower_refanyval(token)?,
            Op::RefAnyType => self.lower_refanytype()?,

            // ---- prefixes ----
            Op::Constrained(token) => self.constrained = Some(token),
            Op::Volatile | Op::ReadOnly | Op::Tail => {}
            Op::Unaligned(_) => {}

            op @ (Op::LocAlloc) => {
                return Err(RuntimeError::Compile(CompileError::UnsupportedOpcode(
                    format!("{op:?}"),
                    offset,
                )))
            }
        }
        Ok(())
    }

    fn lower_dup(&mut self) -> Result<()> {
        let top = self
            .stack
            .top()
            .cloned()
            .ok_or(RuntimeError::Compile(CompileError::StackUnderflow(0)))?;
        let src = self.item_off(0);
        let size = top.slots * 8;
        self.stack.push(top);
        self.note_eval_depth();
        let dst = self.item_off(0);
        if size == 8 {
            self.e.mov_rm(Gpr::Rax, Mem::disp(Gpr::Rbp, src));
            self.e.mov_mr(Mem::disp(Gpr::Rbp, dst), Gpr::Rax);
        } else {
            self.emit_copy(Mem::disp(Gpr::Rbp, dst), Mem::disp(Gpr::Rbp, src), size);
        }
        Ok(())
    }

    // ---- integer/float binary operations ----

    /// Pop two integer-family operands into (rax, rcx) and pick the
    /// operation width. Returns the result tag.
    fn pop_int_pair(&mut self) -> Result<(EvalTag, bool)> {
        let b = self.pop_gpr(Gpr::Rcx)?;
        let a = self.pop_gpr(Gpr::Rax)?;
        let wide = a.tag != EvalTag::I32 || b.tag != EvalTag::I32;
        let tag = if !wide {
            EvalTag::I32
        } else if a.tag == EvalTag::I64 || b.tag == EvalTag::I64 {
            EvalTag::I64
        } else if a.tag == EvalTag::Ptr || b.tag == EvalTag::Ptr {
            EvalTag::Ptr
        } else {
            EvalTag::NInt
        };
        Ok((tag, wide))
    }

    /// Sign-extend eax and push as a canonical 32-bit integer.
    fn push_i32_canonical(&mut self) {
        self.e.movsxd(Gpr::Rax, Gpr::Rax);
        self.push_gpr(EvalTag::I32, Gpr::Rax);
    }

    fn both_floats(&self) -> bool {
        matches!(
            (self.stack.peek(0), self.stack.peek(1)),
            (Some(a), Some(b)) if a.tag.is_float() && b.tag.is_float()
        )
    }

    fn lower_binop(&mut self, op: &Op) -> Result<()> {
        if self.both_floats() {
            return self.lower_float_binop(op);
        }
        let (tag, wide) = self.pop_int_pair()?;
        match (op, wide) {
            (Op::Add, true) => self.e.add_rr(Gpr::Rax, Gpr::Rcx),
            (Op::Add, false) => self.e.add_rr32(Gpr::Rax, Gpr::Rcx),
            (Op::Sub, true) => self.e.sub_rr(Gpr::Rax, Gpr::Rcx),
            (Op::Sub, false) => self.e.sub_rr32(Gpr::Rax, Gpr::Rcx),
            (Op::Mul, true) => self.e.imul_rr(Gpr::Rax, Gpr::Rcx),
            (Op::Mul, false) => self.e.imul_rr32(Gpr::Rax, Gpr::Rcx),
            (Op::And, true) => self.e.and_rr(Gpr::Rax, Gpr::Rcx),
            (Op::And, false) => self.e.and_rr32(Gpr::Rax, Gpr::Rcx),
            (Op::Or, true) => self.e.or_rr(Gpr::Rax, Gpr::Rcx),
            (Op::Or, false) => self.e.or_rr32(Gpr::Rax, Gpr::Rcx),
            (Op::Xor, true) => self.e.xor_rr(Gpr::Rax, Gpr::Rcx),
            (Op::Xor, false) => self.e.xor_rr32(Gpr::Rax, Gpr::Rcx),
            _ => unreachable!(),
        }
        if wide {
            self.push_gpr(tag, Gpr::Rax);
        } else {
            self.push_i32_canonical();
        }
        Ok(())
    }

    fn lower_float_binop(&mut self, op: &Op) -> Result<()> {
        let single = matches!(
            (self.stack.peek(0), self.stack.peek(1)),
            (Some(a), Some(b))
                if a.tag == EvalTag::Float32 && b.tag == EvalTag::Float32
        );
        if single {
            let b_mem = self.item_mem(0);
            self.e.movss_rm(Xmm::Xmm1, b_mem);
            self.stack.pop();
            let a_mem = self.item_mem(0);
            self.e.movss_rm(Xmm::Xmm0, a_mem);
            self.stack.pop();
            match op {
                Op::Add => self.e.addss(Xmm::Xmm0, Xmm::Xmm1),
                Op::Sub => self.e.subss(Xmm::Xmm0, Xmm::Xmm1),
                Op::Mul => self.e.mulss(Xmm::Xmm0, Xmm::Xmm1),
                Op::Div => self.e.divss(Xmm::Xmm0, Xmm::Xmm1),
                _ => {
                    return Err(RuntimeError::Compile(CompileError::StackMismatch(
                        0,
                        "bitwise operation on floats",
                    )))
                }
            }
            self.push_f32(Xmm::Xmm0);
        } else {
            self.pop_float_as_f64(Xmm::Xmm1)?;
            self.pop_float_as_f64(Xmm::Xmm0)?;
            match op {
                Op::Add => self.e.addsd(Xmm::Xmm0, Xmm::Xmm1),
                Op::Sub => self.e.subsd(Xmm::Xmm0, Xmm::Xmm1),
                Op::Mul => self.e.mulsd(Xmm::Xmm0, Xmm::Xmm1),
                Op::Div => self.e.divsd(Xmm::Xmm0, Xmm::Xmm1),
                _ => {
                    return Err(RuntimeError::Compile(CompileError::StackMismatch(
                        0,
                        "bitwise operation on floats",
                    )))
                }
            }
            self.push_f64(Xmm::Xmm0);
        }
        Ok(())
    }

    fn lower_div(&mut self, op: &Op) -> Result<()> {
        if self.both_floats() {
            if matches!(op, Op::Div) {
                return self.lower_float_binop(&Op::Div);
            }
            // Float remainder falls outside the scalar SSE set.
            return Err(RuntimeError::Compile(CompileError::UnsupportedOpcode(
                "rem on floats".into(),
                0,
            )));
        }
        let (tag, wide) = self.pop_int_pair()?;
        let signed = matches!(op, Op::Div | Op::Rem);
        let want_rem = matches!(op, Op::Rem | Op::RemUn);

        // Divide-by-zero first, then the lone signed-overflow case
        // (MIN / -1), then the hardware divide.
        self.e.test_rr(Gpr::Rcx, Gpr::Rcx);
        self.emit_check(Cc::Ne, ThrowKind::DivideByZero);
        if signed {
            if wide {
                self.e.cmp_ri(Gpr::Rcx, -1);
            } else {
                self.e.cmp_ri32(Gpr::Rcx, -1);
            }
            let not_minus_one = self.e.jcc_forward(Cc::Ne);
            if wide {
                self.e.mov_ri64(Gpr::Rdx, i64::MIN as u64);
                self.e.cmp_rr(Gpr::Rax, Gpr::Rdx);
            } else {
                self.e.cmp_ri32(Gpr::Rax, i32::MIN);
            }
            self.emit_check(Cc::Ne, ThrowKind::Overflow);
            let after = self.e.offset();
            self.e.patch(not_minus_one, after);
            if wide {
                self.e.cqo();
                self.e.idiv(Gpr::Rcx);
            } else {
                self.e.cdq();
                self.e.idiv32(Gpr::Rcx);
            }
        } else {
            self.e.xor_rr32(Gpr::Rdx, Gpr::Rdx);
            if wide {
                self.e.div(Gpr::Rcx);
            } else {
                self.e.div32(Gpr::Rcx);
            }
        }
        if want_rem {
            self.e.mov_rr(Gpr::Rax, Gpr::Rdx);
        }
        if wide {
            self.push_gpr(tag, Gpr::Rax);
        } else {
            self.push_i32_canonical();
        }
        Ok(())
    }

    fn lower_shift(&mut self, op: &Op) -> Result<()> {
        let _count = self.pop_gpr(Gpr::Rcx)?;
        let value = self.pop_gpr(Gpr::Rax)?;
        let wide = value.tag != EvalTag::I32;
        match (op, wide) {
            (Op::Shl, true) => self.e.shl_cl(Gpr::Rax),
            (Op::Shl, false) => self.e.shl_cl32(Gpr::Rax),
            (Op::Shr, true) => self.e.sar_cl(Gpr::Rax),
            (Op::Shr, false) => self.e.sar_cl32(Gpr::Rax),
            (Op::ShrUn, true) => self.e.shr_cl(Gpr::Rax),
            (Op::ShrUn, false) => self.e.shr_cl32(Gpr::Rax),
            _ => unreachable!(),
        }
        if wide {
            self.push_gpr(value.tag, Gpr::Rax);
        } else {
            self.push_i32_canonical();
        }
        Ok(())
    }

    fn lower_neg(&mut self) -> Result<()> {
        if matches!(self.stack.top().map(|i| i.tag), Some(t) if t.is_float()) {
            self.pop_float_as_f64(Xmm::Xmm1)?;
            self.e.xorps(Xmm::Xmm0, Xmm::Xmm0);
            self.e.subsd(Xmm::Xmm0, Xmm::Xmm1);
            self.push_f64(Xmm::Xmm0);
            return Ok(());
        }
        let value = self.pop_gpr(Gpr::Rax)?;
        if value.tag == EvalTag::I32 {
            self.e.neg32(Gpr::Rax);
            self.push_i32_canonical();
        } else {
            self.e.neg(Gpr::Rax);
            self.push_gpr(value.tag, Gpr::Rax);
        }
        Ok(())
    }

    fn lower_not(&mut self) -> Result<()> {
        let value = self.pop_gpr(Gpr::Rax)?;
        if value.tag == EvalTag::I32 {
            self.e.not32(Gpr::Rax);
            self.push_i32_canonical();
        } else {
            self.e.not(Gpr::Rax);
            self.push_gpr(value.tag, Gpr::Rax);
        }
        Ok(())
    }

    fn lower_ovf_binop(&mut self, op: OvfOp, unsigned: bool) -> Result<()> {
        let (tag, wide) = self.pop_int_pair()?;
        match (op, wide, unsigned) {
            (OvfOp::Add, true, _) => self.e.add_rr(Gpr::Rax, Gpr::Rcx),
            (OvfOp::Add, false, _) => self.e.add_rr32(Gpr::Rax, Gpr::Rcx),
            (OvfOp::Sub, true, _) => self.e.sub_rr(Gpr::Rax, Gpr::Rcx),
            (OvfOp::Sub, false, _) => self.e.sub_rr32(Gpr::Rax, Gpr::Rcx),
            (OvfOp::Mul, true, false) => self.e.imul_rr(Gpr::Rax, Gpr::Rcx),
            (OvfOp::Mul, false, false) => self.e.imul_rr32(Gpr::Rax, Gpr::Rcx),
            (OvfOp::Mul, true, true) => self.e.mul(Gpr::Rcx),
            (OvfOp::Mul, false, true) => self.e.mul32(Gpr::Rcx),
        }
        let fail = if unsigned { Cc::Ae } else { Cc::No };
        self.emit_check(fail, ThrowKind::Overflow);
        if wide {
            self.push_gpr(tag, Gpr::Rax);
        } else {
            self.push_i32_canonical();
        }
        Ok(())
    }

    // ---- comparisons ----

    fn int_cc(cond: CmpCond, unsigned: bool) -> Cc {
        match (cond, unsigned) {
            (CmpCond::Eq, _) => Cc::E,
            (CmpCond::Ne, _) => Cc::Ne,
            (CmpCond::Lt, false) => Cc::L,
            (CmpCond::Lt, true) => Cc::B,
            (CmpCond::Le, false) => Cc::Le,
            (CmpCond::Le, true) => Cc::Be,
            (CmpCond::Gt, false) => Cc::G,
            (CmpCond::Gt, true) => Cc::A,
            (CmpCond::Ge, false) => Cc::Ge,
            (CmpCond::Ge, true) => Cc::Ae,
        }
    }

    /// Compare two integer-family operands, leaving flags set; returns
    /// the 32-bit/64-bit choice made.
    fn emit_int_compare(&mut self) -> Result<()> {
        let b = self.pop_gpr(Gpr::Rcx)?;
        let a = self.pop_gpr(Gpr::Rax)?;
        if a.tag == EvalTag::I32 && b.tag == EvalTag::I32 {
            self.e.cmp_rr32(Gpr::Rax, Gpr::Rcx);
        } else {
            self.e.cmp_rr(Gpr::Rax, Gpr::Rcx);
        }
        Ok(())
    }

    fn lower_compare(&mut self, cond: CmpCond, unsigned: bool) -> Result<()> {
        if self.both_floats() {
            self.lower_float_compare_bool(cond, unsigned)?;
        } else {
            self.emit_int_compare()?;
            self.e.setcc_zx(Self::int_cc(cond, unsigned), Gpr::Rax);
            self.push_gpr(EvalTag::I32, Gpr::Rax);
        }
        Ok(())
    }

    fn lower_branch_compare(
        &mut self,
        cond: CmpCond,
        unsigned: bool,
        target: u32,
    ) -> Result<()> {
        if self.both_floats() {
            self.lower_float_compare_bool(cond, unsigned)?;
            self.pop_gpr(Gpr::Rax)?;
            self.e.test_rr32(Gpr::Rax, Gpr::Rax);
            self.emit_jcc(Cc::Ne, target)?;
        } else {
            self.emit_int_compare()?;
            self.emit_jcc(Self::int_cc(cond, unsigned), target)?;
        }
        Ok(())
    }

    /// Float compare producing a 0/1 integer, with ECMA unordered
    /// semantics: ordered for the plain forms, unordered-or for `.un`.
    fn lower_float_compare_bool(&mut self, cond: CmpCond, unsigned: bool) -> Result<()> {
        self.pop_float_as_f64(Xmm::Xmm1)?;
        self.pop_float_as_f64(Xmm::Xmm0)?;
        match (cond, unsigned) {
            (CmpCond::Eq, _) => {
                // Equal and ordered.
                self.e.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                self.e.setcc_zx(Cc::E, Gpr::Rax);
                self.e.setcc_zx(Cc::Np, Gpr::Rcx);
                self.e.and_rr32(Gpr::Rax, Gpr::Rcx);
            }
            (CmpCond::Ne, _) => {
                // Unequal or unordered.
                self.e.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                self.e.setcc_zx(Cc::Ne, Gpr::Rax);
                self.e.setcc_zx(Cc::P, Gpr::Rcx);
                self.e.or_rr32(Gpr::Rax, Gpr::Rcx);
            }
            (CmpCond::Lt, false) => {
                self.e.ucomisd(Xmm::Xmm1, Xmm::Xmm0);
                self.e.setcc_zx(Cc::A, Gpr::Rax);
            }
            (CmpCond::Lt, true) => {
                self.e.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                self.e.setcc_zx(Cc::B, Gpr::Rax);
            }
            (CmpCond::Le, false) => {
                self.e.ucomisd(Xmm::Xmm1, Xmm::Xmm0);
                self.e.setcc_zx(Cc::Ae, Gpr::Rax);
            }
            (CmpCond::Le, true) => {
                self.e.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                self.e.setcc_zx(Cc::Be, Gpr::Rax);
            }
            (CmpCond::Gt, false) => {
                self.e.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                self.e.setcc_zx(Cc::A, Gpr::Rax);
            }
            (CmpCond::Gt, true) => {
                self.e.ucomisd(Xmm::Xmm1, Xmm::Xmm0);
                self.e.setcc_zx(Cc::B, Gpr::Rax);
            }
            (CmpCond::Ge, false) => {
                self.e.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
                self.e.setcc_zx(Cc::Ae, Gpr::Rax);
            }
            (CmpCond::Ge, true) => {
                self.e.ucomisd(Xmm::Xmm1, Xmm::Xmm0);
                self.e.setcc_zx(Cc::Be, Gpr::Rax);
            }
        }
        self.push_gpr(EvalTag::I32, Gpr::Rax);
        Ok(())
    }

    // ---- conversions ----

    fn lower_conv(&mut self, kind: ConvKind) -> Result<()> {
        let src_is_float = matches!(self.stack.top().map(|i| i.tag), Some(t) if t.is_float());
        if src_is_float {
            match kind {
                ConvKind::R4 => {
                    self.pop_float_as_f64(Xmm::Xmm0)?;
                    self.e.cvtsd2ss(Xmm::Xmm0, Xmm::Xmm0);
                    self.push_f32(Xmm::Xmm0);
                    return Ok(());
                }
                ConvKind::R8 => {
                    self.pop_float_as_f64(Xmm::Xmm0)?;
                    self.push_f64(Xmm::Xmm0);
                    return Ok(());
                }
                _ => {
                    self.pop_float_as_f64(Xmm::Xmm0)?;
                    self.e.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
                    // Narrow as an integer below.
                }
            }
        } else {
            match kind {
                ConvKind::R4 => {
                    self.pop_gpr(Gpr::Rax)?;
                    self.e.cvtsi2ss(Xmm::Xmm0, Gpr::Rax);
                    self.push_f32(Xmm::Xmm0);
                    return Ok(());
                }
                ConvKind::R8 => {
                    self.pop_gpr(Gpr::Rax)?;
                    self.e.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
                    self.push_f64(Xmm::Xmm0);
                    return Ok(());
                }
                _ => {
                    self.pop_gpr(Gpr::Rax)?;
                }
            }
        }

        match kind {
            ConvKind::I1 => {
                self.e.movsx8(Gpr::Rax, Gpr::Rax);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            ConvKind::U1 => {
                self.e.movzx8(Gpr::Rax, Gpr::Rax);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            ConvKind::I2 => {
                self.e.movsx16(Gpr::Rax, Gpr::Rax);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            ConvKind::U2 => {
                self.e.movzx16(Gpr::Rax, Gpr::Rax);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            ConvKind::I4 | ConvKind::U4 => {
                self.e.movsxd(Gpr::Rax, Gpr::Rax);
                self.push_gpr(EvalTag::I32, Gpr::Rax);
            }
            ConvKind::I8 => {
                self.push_gpr(EvalTag::I64, Gpr::Rax);
            }
            ConvKind::U8 => {
                // Unsigned widening from 32-bit sources; wider sources
                // keep their bits.
                self.push_gpr(EvalTag::I64, Gpr::Rax);
            }
            ConvKind::I => {
                self.push_gpr(EvalTag::NInt, Gpr::Rax);
            }
            ConvKind::U => {
                self.push_gpr(EvalTag::NInt, Gpr::Rax);
            }
            ConvKind::R4 | ConvKind::R8 => unreachable!(),
        }
        Ok(())
    }

    fn lower_conv_r_un(&mut self) -> Result<()> {
        self.pop_gpr(Gpr::Rax)?;
        // Unsigned 64-bit to double: direct when bit 63 is clear, else
        // halve with sticky low bit and double the result.
        self.e.test_rr(Gpr::Rax, Gpr::Rax);
        let slow = self.e.jcc_forward(Cc::S);
        self.e.cvtsi2sd(Xmm::Xmm0, Gpr::Rax);
        let done = self.e.jmp_forward();
        let slow_at = self.e.offset();
        self.e.patch(slow, slow_at);
        self.e.mov_rr(Gpr::Rcx, Gpr::Rax);
        self.e.shr_ri(Gpr::Rcx, 1);
        self.e.and_ri(Gpr::Rax, 1);
        self.e.or_rr(Gpr::Rcx, Gpr::Rax);
        self.e.cvtsi2sd(Xmm::Xmm0, Gpr::Rcx);
        self.e.addsd(Xmm::Xmm0, Xmm::Xmm0);
        let done_at = self.e.offset();
        self.e.patch(done, done_at);
        self.push_f64(Xmm::Xmm0);
        Ok(())
    }

    fn lower_ckfinite(&mut self) -> Result<()> {
        let mem = self.item_mem(0);
        match self.stack.top().map(|i| i.tag) {
            Some(EvalTag::Float64) => self.e.mov_rm(Gpr::Rax, mem),
            Some(EvalTag::Float32) => {
                // Promote in place so the exponent test sees a double.
                self.e.movss_rm(Xmm::Xmm0, mem);
                self.e.cvtss2sd(Xmm::Xmm0, Xmm::Xmm0);
                self.e.movsd_mr(mem, Xmm::Xmm0);
                self.stack.pop();
                self.stack.push(Item::scalar(EvalTag::Float64));
                let mem = self.item_mem(0);
                self.e.mov_rm(Gpr::Rax, mem);
            }
            _ => {
                return Err(RuntimeError::Compile(CompileError::StackMismatch(
                    0,
                    "ckfinite on a non-float",
                )))
            }
        }
        self.e.mov_ri64(Gpr::Rcx, 0x7FF0_0000_0000_0000);
        self.e.and_rr(Gpr::Rax, Gpr::Rcx);
        self.e.cmp_rr(Gpr::Rax, Gpr::Rcx);
        self.emit_check(Cc::Ne, ThrowKind::Overflow);
        Ok(())
    }

    fn lower_conv_ovf(&mut self, kind: ConvKind, unsigned_src: bool) -> Result<()> {
        let src_is_float = matches!(self.stack.top().map(|i| i.tag), Some(t) if t.is_float());
        if src_is_float {
            self.pop_float_as_f64(Xmm::Xmm0)?;
            self.emit_float_range_check(kind)?;
            self.e.cvttsd2si(Gpr::Rax, Xmm::Xmm0);
        } else {
            self.pop_gpr(Gpr::Rax)?;
        }

        // Narrow, widen back with the target's signedness, and require
        // the round trip to be lossless.
        let (widen_signed, push_tag): (Option<fn(&mut crate::jit::emitter::CodeEmitter)>, _) =
            match kind {
                ConvKind::I1 => (
                    Some(|e: &mut crate::jit::emitter::CodeEmitter| e.movsx8(Gpr::Rcx, Gpr::Rax)),
                    EvalTag::I32,
                ),
                ConvKind::U1 => (
                    Some(|e: &mut crate::jit::emitter::CodeEmitter| e.movzx8(Gpr::Rcx, Gpr::Rax)),
                    EvalTag::I32,
                ),
                ConvKind::I2 => (
                    Some(|e: &mut crate::jit::emitter::CodeEmitter| e.movsx16(Gpr::Rcx, Gpr::Rax)),
                    EvalTag::I32,
                ),
                ConvKind::U2 => (
                    Some(|e: &mut crate::jit::emitter::CodeEmitter| e.movzx16(Gpr::Rcx, Gpr::Rax)),
                    EvalTag::I32,
                ),
                ConvKind::I4 => (
                    Some(|e: &mut crate::jit::emitter::CodeEmitter| e.movsxd(Gpr::Rcx, Gpr::Rax)),
                    EvalTag::I32,
                ),
                ConvKind::U4 => (
                    Some(|e: &mut crate::jit::emitter::CodeEmitter| e.mov_rr32(Gpr::Rcx, Gpr::Rax)),
                    EvalTag::I32,
                ),
                ConvKind::I8 | ConvKind::I => (None, if kind == ConvKind::I {
                    EvalTag::NInt
                } else {
                    EvalTag::I64
                }),
                ConvKind::U8 | ConvKind::U => (None, if kind == ConvKind::U {
                    EvalTag::NInt
                } else {
                    EvalTag::I64
                }),
                ConvKind::R4 | ConvKind::R8 => {
                    return Err(RuntimeError::Compile(CompileError::UnsupportedOpcode(
                        "conv.ovf to float".into(),
                        0,
                    )))
                }
            };

        match widen_signed {
            Some(emit_widen) => {
                emit_widen(&mut self.e);
                self.e.cmp_rr(Gpr::Rax, Gpr::Rcx);
                self.emit_check(Cc::E, ThrowKind::Overflow);
                if push_tag == EvalTag::I32 {
                    // Canonicalise to the narrowed value.
                    self.e.mov_rr(Gpr::Rax, Gpr::Rcx);
                    if kind == ConvKind::U4 {
                        self.e.movsxd(Gpr::Rax, Gpr::Rax);
                    }
                }
                self.push_gpr(push_tag, Gpr::Rax);
            }
            None => {
                // 64-bit targets: only the sign bit can overflow, and
                // only when source and target signedness disagree.
                let signed_target = matches!(kind, ConvKind::I8 | ConvKind::I);
                if (signed_target && unsigned_src) || (!signed_target && !unsigned_src) {
                    self.e.test_rr(Gpr::Rax, Gpr::Rax);
                    self.emit_check(Cc::Ns, ThrowKind::Overflow);
                }
                self.push_gpr(push_tag, Gpr::Rax);
            }
        }
        Ok(())
    }

    /// Range-check xmm0 against the exclusive bounds of `kind`; NaN fails
    /// the first compare through its parity flag.
    fn emit_float_range_check(&mut self, kind: ConvKind) -> Result<()> {
        let (lower, upper) = match kind {
            ConvKind::I1 => (-129.0, 128.0),
            ConvKind::U1 => (-1.0, 256.0),
            ConvKind::I2 => (-32769.0, 32768.0),
            ConvKind::U2 => (-1.0, 65536.0),
            ConvKind::I4 => (-2147483649.0, 2147483648.0),
            ConvKind::U4 => (-1.0, 4294967296.0),
            ConvKind::I8 | ConvKind::I => (-9223372036854777856.0, 9223372036854775808.0),
            // Unsigned 64-bit sources above 2^63 exceed the signed
            // truncation below; Tier-0 rejects them as overflow.
            ConvKind::U8 | ConvKind::U => (-1.0, 9223372036854775808.0),
            _ => return Ok(()),
        };
        self.e.mov_ri64(Gpr::Rax, (lower as f64).to_bits());
        self.e.movq_xr(Xmm::Xmm1, Gpr::Rax);
        self.e.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
        // value <= lower, or NaN (CF and ZF both set when unordered).
        self.emit_check(Cc::A, ThrowKind::Overflow);
        self.e.mov_ri64(Gpr::Rax, (upper as f64).to_bits());
        self.e.movq_xr(Xmm::Xmm1, Gpr::Rax);
        self.e.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
        self.emit_check(Cc::B, ThrowKind::Overflow);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum OvfOp {
    Add,
    Sub,
    Mul,
}
