//! Emitted runtime thunks
//!
//! Small pieces of machine code the runtime generates once at bring-up
//! (plus one trampoline per reserved method):
//!
//! - **Helper bridges** - every call from managed code into a runtime
//!   helper goes through a bridge that spills the caller's non-volatile
//!   context into the current thread's anchor (`[r15 + ctx]`) and tail
//!   jumps to the Rust helper. The anchor is where GC stack walks and
//!   exception dispatch start for a thread parked inside the runtime.
//! - **Entry thunk** - the runtime→managed transition: establishes the
//!   Tier-0 frame, pins r15 to the thread state, marshals an argument
//!   blob into the managed convention and calls the target.
//! - **Funclet-call thunk** - invokes a filter/finally/fault funclet from
//!   the dispatcher with the exception in rcx and the parent frame in rdx.
//! - **Resume thunk** - loads a full non-volatile context plus rax/rcx/rdx
//!   and jumps; the exception dispatcher's only way to move control.
//! - **Lazy-compile trampolines** - the Reserved state of a method: saves
//!   the argument registers, calls the compiler through its bridge, then
//!   re-dispatches to the freshly published entry.
//!
//! The entry and funclet thunks are registered in the code map with
//! ordinary unwind info and stack maps, so walks traverse them like any
//! compiled method and the dispatcher can recognise them as boundaries.

use crate::codemap::{CodeMap, CompiledCode};
use crate::defaults::TRAMPOLINE_SIZE;
use crate::gc::stackmap::{SlotBase, SlotLocation, StackMap, StackMapBuilder, StackSlot};
use crate::jit::code_heap::CodeHeap;
use crate::jit::emitter::{Cc, CodeEmitter, Gpr, Mem, Xmm};
use crate::unwind::{ctx_off, UnwindInfo};
use std::sync::Arc;

/// Raw addresses of the Rust helper functions, gathered by the runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelperAddrs {
    pub alloc_object: usize,
    pub alloc_array: usize,
    pub ldstr: usize,
    pub box_value: usize,
    pub unbox: usize,
    pub isinst: usize,
    pub castclass: usize,
    pub throw: usize,
    pub rethrow: usize,
    pub throw_wellknown: usize,
    pub safepoint_poll: usize,
    pub lazy_compile: usize,
}

/// Bridge addresses managed code calls; same layout of concerns as
/// [`HelperAddrs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HelperBridges {
    pub alloc_object: usize,
    pub alloc_array: usize,
    pub ldstr: usize,
    pub box_value: usize,
    pub unbox: usize,
    pub isinst: usize,
    pub castclass: usize,
    pub throw: usize,
    pub rethrow: usize,
    pub throw_wellknown: usize,
    pub safepoint_poll: usize,
    pub lazy_compile: usize,
}

/// The state block consumed by the resume thunk: a full non-volatile
/// context followed by the volatile registers the target needs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeState {
    pub ctx: crate::unwind::Context,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
}

/// Entry-point signatures.
#[cfg(target_arch = "x86_64")]
pub type EntryThunkFn = unsafe extern "win64" fn(u64, u64, u64, u64) -> u64;
#[cfg(not(target_arch = "x86_64"))]
pub type EntryThunkFn = unsafe extern "C" fn(u64, u64, u64, u64) -> u64;

#[cfg(target_arch = "x86_64")]
pub type ResumeThunkFn = unsafe extern "win64" fn(*const ResumeState) -> !;
#[cfg(not(target_arch = "x86_64"))]
pub type ResumeThunkFn = unsafe extern "C" fn(*const ResumeState) -> !;

#[cfg(target_arch = "x86_64")]
pub type FuncletCallFn = unsafe extern "win64" fn(u64, u64, u64) -> u64;
#[cfg(not(target_arch = "x86_64"))]
pub type FuncletCallFn = unsafe extern "C" fn(u64, u64, u64) -> u64;

/// The emitted thunk set.
pub struct Thunks {
    pub bridges: HelperBridges,
    pub entry: EntryThunkFn,
    pub entry_code: Arc<CompiledCode>,
    /// Offset of the entry thunk's epilogue; the dispatcher resumes here
    /// when an exception reaches the invoke boundary.
    pub entry_epilogue: u32,
    pub call_funclet: FuncletCallFn,
    pub call_funclet_code: Arc<CompiledCode>,
    pub call_funclet_epilogue: u32,
    pub resume: ResumeThunkFn,
}

const SAVED_REGS: [Gpr; 7] = [
    Gpr::Rbx,
    Gpr::Rdi,
    Gpr::Rsi,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

/// Emit `push rbp; mov rbp, rsp; push <saved>; sub rsp, frame` - the
/// canonical Tier-0 prologue whose shape `UnwindInfo::tier0_frame`
/// describes. Returns the offset of the frame-size immediate.
pub fn emit_tier0_prologue(e: &mut CodeEmitter, frame_size: u32) -> usize {
    let start = e.offset();
    e.push_r(Gpr::Rbp);
    e.mov_rr(Gpr::Rbp, Gpr::Rsp);
    for reg in SAVED_REGS {
        e.push_r(reg);
    }
    let at = e.sub_rsp_imm32(frame_size);
    debug_assert_eq!(e.offset() - start, 22);
    at
}

/// Emit the matching epilogue: `lea rsp, [rbp-56]; pop <saved-rev>;
/// pop rbp; ret`.
pub fn emit_tier0_epilogue(e: &mut CodeEmitter) {
    e.lea(Gpr::Rsp, Mem::disp(Gpr::Rbp, -56));
    for reg in SAVED_REGS.iter().rev() {
        e.pop_r(*reg);
    }
    e.pop_r(Gpr::Rbp);
    e.ret();
}

fn register_thunk(
    code_map: &CodeMap,
    name: &str,
    base: usize,
    len: u32,
    unwind: UnwindInfo,
    stack_map: StackMap,
) -> Arc<CompiledCode> {
    let code = Arc::new(CompiledCode {
        assembly: 0,
        token: 0,
        name: name.to_string(),
        code_base: base,
        code_len: len,
        prologue_len: unwind.prologue_len as u32,
        unwind,
        stack_map,
        eh_clauses: Vec::new(),
        funclets: Vec::new(),
    });
    code_map.register(code.clone());
    code
}

/// Emit one helper bridge: spill the managed caller's context into the
/// thread anchor at `[r15 + 0..80]`, then tail-jump to the Rust helper
/// with all argument registers untouched (only rax is clobbered).
fn emit_bridge(e: &mut CodeEmitter, helper: usize) -> usize {
    let start = e.offset();
    for (reg, off) in [
        (Gpr::Rbx, ctx_off::RBX),
        (Gpr::Rbp, ctx_off::RBP),
        (Gpr::Rsi, ctx_off::RSI),
        (Gpr::Rdi, ctx_off::RDI),
        (Gpr::R12, ctx_off::R12),
        (Gpr::R13, ctx_off::R13),
        (Gpr::R14, ctx_off::R14),
        (Gpr::R15, ctx_off::R15),
    ] {
        e.mov_mr(Mem::disp(Gpr::R15, off), reg);
    }
    // Return address and post-return rsp of the managed caller.
    e.mov_rm(Gpr::Rax, Mem::base(Gpr::Rsp));
    e.mov_mr(Mem::disp(Gpr::R15, ctx_off::RIP), Gpr::Rax);
    e.lea(Gpr::Rax, Mem::disp(Gpr::Rsp, 8));
    e.mov_mr(Mem::disp(Gpr::R15, ctx_off::RSP), Gpr::Rax);
    e.mov_ri64(Gpr::Rax, helper as u64);
    e.jmp_r(Gpr::Rax);
    start
}

/// Emit every bring-up thunk into one published allocation and register
/// the walkable ones.
pub fn emit_all(code_heap: &CodeHeap, code_map: &CodeMap, helpers: HelperAddrs) -> Thunks {
    let mut e = CodeEmitter::new(4096);

    // ---- helper bridges ----
    let bridge_offsets = HelperBridges {
        alloc_object: emit_bridge(&mut e, helpers.alloc_object),
        alloc_array: emit_bridge(&mut e, helpers.alloc_array),
        ldstr: emit_bridge(&mut e, helpers.ldstr),
        box_value: emit_bridge(&mut e, helpers.box_value),
        unbox: emit_bridge(&mut e, helpers.unbox),
        isinst: emit_bridge(&mut e, helpers.isinst),
        castclass: emit_bridge(&mut e, helpers.castclass),
        throw: emit_bridge(&mut e, helpers.throw),
        rethrow: emit_bridge(&mut e, helpers.rethrow),
        throw_wellknown: emit_bridge(&mut e, helpers.throw_wellknown),
        safepoint_poll: emit_bridge(&mut e, helpers.safepoint_poll),
        lazy_compile: emit_bridge(&mut e, helpers.lazy_compile),
    };

    // ---- entry thunk ----
    // (rcx = target entry, rdx = argv, r8 = argc, r9 = thread state)
    while e.offset() % 16 != 0 {
        e.int3();
    }
    let entry_off = e.offset();
    {
        emit_tier0_prologue(&mut e, 0x138);

        e.mov_rr(Gpr::Rax, Gpr::Rcx); // target
        e.mov_rr(Gpr::R15, Gpr::R9); // thread state
        e.mov_rr(Gpr::R12, Gpr::Rdx); // argv
        e.mov_rr32(Gpr::R11, Gpr::R8); // argc

        // Copy stack-passed argument slots (argv[4..argc]) into the
        // outgoing area.
        e.mov_rr32(Gpr::Rcx, Gpr::R11);
        e.sub_ri32(Gpr::Rcx, 4);
        let skip = e.jcc_forward(Cc::Le);
        e.lea(Gpr::Rsi, Mem::disp(Gpr::R12, 0x20));
        e.lea(Gpr::Rdi, Mem::disp(Gpr::Rsp, 0x20));
        e.rep_movsq();
        let after = e.offset();
        e.patch(skip, after);

        // Register arguments, both banks.
        e.mov_rm(Gpr::Rcx, Mem::base(Gpr::R12));
        e.mov_rm(Gpr::Rdx, Mem::disp(Gpr::R12, 8));
        e.mov_rm(Gpr::R8, Mem::disp(Gpr::R12, 16));
        e.mov_rm(Gpr::R9, Mem::disp(Gpr::R12, 24));
        e.movsd_rm(Xmm::Xmm0, Mem::base(Gpr::R12));
        e.movsd_rm(Xmm::Xmm1, Mem::disp(Gpr::R12, 8));
        e.movsd_rm(Xmm::Xmm2, Mem::disp(Gpr::R12, 16));
        e.movsd_rm(Xmm::Xmm3, Mem::disp(Gpr::R12, 24));

        e.call_r(Gpr::Rax);
    }
    let entry_safepoint = (e.offset() - entry_off) as u32;
    // Float results come back in xmm0; mirror the bits into argv[0] so the
    // reflective caller can read either bank.
    e.movq_rx(Gpr::Rcx, Xmm::Xmm0);
    e.mov_mr(Mem::base(Gpr::R12), Gpr::Rcx);
    let entry_epilogue = (e.offset() - entry_off) as u32;
    emit_tier0_epilogue(&mut e);
    let entry_len = (e.offset() - entry_off) as u32;

    // ---- funclet-call thunk ----
    // (rcx = funclet, rdx = exception, r8 = parent frame pointer)
    while e.offset() % 16 != 0 {
        e.int3();
    }
    let funclet_off = e.offset();
    {
        emit_tier0_prologue(&mut e, 0x28);

        e.mov_rr(Gpr::Rax, Gpr::Rcx);
        e.mov_rr(Gpr::Rcx, Gpr::Rdx);
        e.mov_rr(Gpr::Rdx, Gpr::R8);
        e.call_r(Gpr::Rax);
    }
    let funclet_safepoint = (e.offset() - funclet_off) as u32;
    let funclet_epilogue = (e.offset() - funclet_off) as u32;
    emit_tier0_epilogue(&mut e);
    let funclet_len = (e.offset() - funclet_off) as u32;

    // ---- resume thunk ----
    // (rcx = *ResumeState) - never returns.
    while e.offset() % 16 != 0 {
        e.int3();
    }
    let resume_off = e.offset();
    {
        e.mov_rr(Gpr::R11, Gpr::Rcx);
        for (reg, off) in [
            (Gpr::Rbx, ctx_off::RBX),
            (Gpr::Rbp, ctx_off::RBP),
            (Gpr::Rsi, ctx_off::RSI),
            (Gpr::Rdi, ctx_off::RDI),
            (Gpr::R12, ctx_off::R12),
            (Gpr::R13, ctx_off::R13),
            (Gpr::R14, ctx_off::R14),
            (Gpr::R15, ctx_off::R15),
        ] {
            e.mov_rm(reg, Mem::disp(Gpr::R11, off));
        }
        e.mov_rm(Gpr::R10, Mem::disp(Gpr::R11, ctx_off::RIP));
        e.mov_rm(Gpr::Rax, Mem::disp(Gpr::R11, 80));
        e.mov_rm(Gpr::Rcx, Mem::disp(Gpr::R11, 88));
        e.mov_rm(Gpr::Rdx, Mem::disp(Gpr::R11, 96));
        e.mov_rm(Gpr::Rsp, Mem::disp(Gpr::R11, ctx_off::RSP));
        e.jmp_r(Gpr::R10);
    }

    let bytes = e.into_bytes();
    let base = code_heap
        .install(&bytes, 0)
        .expect("code heap exhausted during bring-up");

    let abs = |off: usize| base + off;

    let entry_code = {
        let mut sm = StackMapBuilder::new();
        sm.record_safepoint(entry_safepoint, Vec::new());
        register_thunk(
            code_map,
            "runtime.entry",
            abs(entry_off),
            entry_len,
            UnwindInfo::tier0_frame(0x138),
            StackMap::decode(&sm.encode(entry_len)).unwrap(),
        )
    };
    let call_funclet_code = {
        let mut sm = StackMapBuilder::new();
        sm.record_safepoint(funclet_safepoint, Vec::new());
        register_thunk(
            code_map,
            "runtime.call_funclet",
            abs(funclet_off),
            funclet_len,
            UnwindInfo::tier0_frame(0x28),
            StackMap::decode(&sm.encode(funclet_len)).unwrap(),
        )
    };

    // Safety: the addresses point at published, executable code following
    // the documented conventions.
    unsafe {
        Thunks {
            bridges: HelperBridges {
                alloc_object: abs(bridge_offsets.alloc_object),
                alloc_array: abs(bridge_offsets.alloc_array),
                ldstr: abs(bridge_offsets.ldstr),
                box_value: abs(bridge_offsets.box_value),
                unbox: abs(bridge_offsets.unbox),
                isinst: abs(bridge_offsets.isinst),
                castclass: abs(bridge_offsets.castclass),
                throw: abs(bridge_offsets.throw),
                rethrow: abs(bridge_offsets.rethrow),
                throw_wellknown: abs(bridge_offsets.throw_wellknown),
                safepoint_poll: abs(bridge_offsets.safepoint_poll),
                lazy_compile: abs(bridge_offsets.lazy_compile),
            },
            entry: std::mem::transmute::<usize, EntryThunkFn>(abs(entry_off)),
            entry_code,
            entry_epilogue,
            call_funclet: std::mem::transmute::<usize, FuncletCallFn>(abs(funclet_off)),
            call_funclet_code,
            call_funclet_epilogue: funclet_epilogue,
            resume: std::mem::transmute::<usize, ResumeThunkFn>(abs(resume_off)),
        }
    }
}

/// Emit one lazy-compile trampoline for a reserved method cell. The stub
/// preserves the four argument registers in both banks, calls the
/// compiler through its bridge, then re-dispatches to the returned entry.
pub fn emit_trampoline(
    code_heap: &CodeHeap,
    code_map: &CodeMap,
    lazy_compile_bridge: usize,
    cell_addr: usize,
    assembly: u32,
    token: u32,
) -> usize {
    let mut e = CodeEmitter::new(TRAMPOLINE_SIZE);
    e.push_r(Gpr::Rbp);
    e.mov_rr(Gpr::Rbp, Gpr::Rsp);
    e.sub_ri(Gpr::Rsp, 0x60);
    debug_assert_eq!(e.offset(), 8);

    e.mov_mr(Mem::disp(Gpr::Rsp, 0x20), Gpr::Rcx);
    e.mov_mr(Mem::disp(Gpr::Rsp, 0x28), Gpr::Rdx);
    e.mov_mr(Mem::disp(Gpr::Rsp, 0x30), Gpr::R8);
    e.mov_mr(Mem::disp(Gpr::Rsp, 0x38), Gpr::R9);
    e.movsd_mr(Mem::disp(Gpr::Rsp, 0x40), Xmm::Xmm0);
    e.movsd_mr(Mem::disp(Gpr::Rsp, 0x48), Xmm::Xmm1);
    e.movsd_mr(Mem::disp(Gpr::Rsp, 0x50), Xmm::Xmm2);
    e.movsd_mr(Mem::disp(Gpr::Rsp, 0x58), Xmm::Xmm3);

    e.mov_ri64(Gpr::Rcx, cell_addr as u64);
    e.mov_ri64(Gpr::Rax, lazy_compile_bridge as u64);
    e.call_r(Gpr::Rax);
    let safepoint = e.offset() as u32;
    e.mov_rr(Gpr::R10, Gpr::Rax);

    e.mov_rm(Gpr::Rcx, Mem::disp(Gpr::Rsp, 0x20));
    e.mov_rm(Gpr::Rdx, Mem::disp(Gpr::Rsp, 0x28));
    e.mov_rm(Gpr::R8, Mem::disp(Gpr::Rsp, 0x30));
    e.mov_rm(Gpr::R9, Mem::disp(Gpr::Rsp, 0x38));
    e.movsd_rm(Xmm::Xmm0, Mem::disp(Gpr::Rsp, 0x40));
    e.movsd_rm(Xmm::Xmm1, Mem::disp(Gpr::Rsp, 0x48));
    e.movsd_rm(Xmm::Xmm2, Mem::disp(Gpr::Rsp, 0x50));
    e.movsd_rm(Xmm::Xmm3, Mem::disp(Gpr::Rsp, 0x58));

    e.mov_rr(Gpr::Rsp, Gpr::Rbp);
    e.pop_r(Gpr::Rbp);
    e.jmp_r(Gpr::R10);

    let len = e.offset();
    debug_assert!(len <= TRAMPOLINE_SIZE);
    let bytes = e.into_bytes();
    let base = code_heap
        .install(&bytes, assembly)
        .expect("code heap exhausted emitting trampoline");

    // The argument saves may hold object references; scan them through
    // the exact-object filter during a collection under lazy compile.
    let mut sm = StackMapBuilder::new();
    for off in [0x20, 0x28, 0x30, 0x38] {
        sm.add_slot(StackSlot {
            location: SlotLocation::Offset {
                base: SlotBase::CalleeSp,
                offset: off,
            },
            interior: false,
            pinned: false,
        });
    }
    sm.record_safepoint(safepoint, vec![true; 4]);
    register_thunk(
        code_map,
        &format!("trampoline:{assembly}:{token:#x}"),
        base,
        len as u32,
        UnwindInfo::trampoline_frame(0x60),
        StackMap::decode(&sm.encode(len as u32)).unwrap(),
    );
    base
}
