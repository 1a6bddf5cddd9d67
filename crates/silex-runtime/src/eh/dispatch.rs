//! Two-pass exception dispatch
//!
//! First pass walks frames from the throw point with the unwinder,
//! scanning each frame's clause table for a try range containing the
//! faulting offset: typed catches match through the runtime subtype
//! test, filters run their funclet and answer. Second pass re-walks the
//! same frames, invoking every enclosing finally/fault funclet innermost
//! to outermost, then restores the matching frame's non-volatile context
//! and enters the catch funclet on it. Control transfer is done entirely
//! through the emitted resume thunk - no host unwinding machinery is
//! involved anywhere.
//!
//! Boundary frames are recognised by identity: the entry thunk marks the
//! reflective-invocation boundary (an exception reaching it parks in the
//! thread state and resumes the thunk's epilogue), and the funclet-call
//! thunk marks a nested dispatch out of a filter (absorbed as "no
//! match", per the filter contract).

use crate::codemap::CompiledCode;
use crate::eh::NativeClauseKind;
use crate::error::fatal;
use crate::jit::thunks::ResumeState;
use crate::object::ObjRef;
use crate::runtime::{current_thread, Runtime};
use crate::unwind::{virtual_unwind, Context};
use std::sync::Arc;

struct FrameRec {
    code: Arc<CompiledCode>,
    ctx: Context,
    ip_offset: u32,
}

fn collect_frames(rt: &Runtime, start: &Context) -> Vec<FrameRec> {
    let mut frames = Vec::new();
    let mut ctx = *start;
    while let Some(code) = rt.code_map.lookup(ctx.rip as usize) {
        let ip_offset = code.ip_offset(ctx.rip as usize);
        let (info, rel) = code.unwind_at(ip_offset);
        // Safety: the caller vouches for the context; see dispatch_throw.
        let caller = unsafe { virtual_unwind(info, rel, &ctx) };
        frames.push(FrameRec {
            code,
            ctx,
            ip_offset,
        });
        ctx = caller;
    }
    frames
}

fn is_entry_boundary(rt: &Runtime, frame: &FrameRec) -> bool {
    frame.code.code_base == rt.thunks.entry_code.code_base
}

fn is_funclet_call_boundary(rt: &Runtime, frame: &FrameRec) -> bool {
    frame.code.code_base == rt.thunks.call_funclet_code.code_base
}

/// Jump to `epilogue_off` of a boundary frame with `rax` as the return
/// value. Abandoning the dispatcher's Rust frames drops their service
/// guards without running them, so the nesting counter is reset here;
/// a filter invocation restores its own saved depth on return.
unsafe fn resume_to_epilogue(rt: &Runtime, frame: &FrameRec, epilogue_off: u32, rax: u64) -> ! {
    let ts = current_thread();
    (*ts)
        .in_runtime
        .store(0, std::sync::atomic::Ordering::Release);
    let state = ResumeState {
        ctx: Context {
            rip: (frame.code.code_base + epilogue_off as usize) as u64,
            ..frame.ctx
        },
        rax,
        rcx: 0,
        rdx: 0,
    };
    (rt.thunks.resume)(&state)
}

/// Invoke a filter funclet; a throw escaping it is absorbed as verdict 0.
unsafe fn invoke_filter(rt: &Runtime, frame: &FrameRec, funclet: usize, exception: ObjRef) -> u64 {
    let ts = current_thread();
    let saved_exception = (*ts).current_exception.get();
    let saved_depth = (*ts)
        .in_runtime
        .load(std::sync::atomic::Ordering::Acquire);
    (*ts).filter_depth.set((*ts).filter_depth.get() + 1);
    let entry = frame.code.code_base + frame.code.funclets[funclet].begin as usize;
    let verdict = (rt.thunks.call_funclet)(entry as u64, exception.0 as u64, frame.ctx.rbp);
    (*ts).filter_depth.set((*ts).filter_depth.get() - 1);
    (*ts).current_exception.set(saved_exception);
    // An absorbed nested throw zeroed the service-nesting counter on its
    // way out; restore this dispatch's view.
    (*ts)
        .in_runtime
        .store(saved_depth, std::sync::atomic::Ordering::Release);
    verdict
}

/// Invoke a finally/fault funclet on its parent frame.
unsafe fn invoke_handler(rt: &Runtime, frame: &FrameRec, funclet: usize, exception: ObjRef) {
    let entry = frame.code.code_base + frame.code.funclets[funclet].begin as usize;
    let _ = (rt.thunks.call_funclet)(entry as u64, exception.0 as u64, frame.ctx.rbp);
}

/// Dispatch a managed exception from `throw_ctx`. Never returns: control
/// moves to a catch funclet, an invoke boundary, a filter absorption
/// point, or the fatal handler.
///
/// # Safety
/// `throw_ctx` must describe the calling thread's live managed frames;
/// the thread must be attached.
pub unsafe fn dispatch_throw(rt: &Runtime, exception: ObjRef, throw_ctx: &Context) -> ! {
    let ts = current_thread();
    assert!(!ts.is_null(), "exception dispatch on an unattached thread");
    (*ts).current_exception.set(exception);
    // Interrupted frames stay walkable for the collector while funclets
    // and allocation run below.
    let previous_pending = (*ts).pending_walk.get();
    (*ts).pending_walk.set(Some(*throw_ctx));

    let frames = collect_frames(rt, throw_ctx);
    let exc_mt = exception.method_table();
    log::debug!(
        "eh: dispatching {} over {} frames",
        exc_mt.name(),
        frames.len()
    );

    // ---- First pass: select the handling frame and clause ----
    let mut target: Option<(usize, usize)> = None;
    let mut boundary: Option<usize> = None;
    'pass1: for (fi, frame) in frames.iter().enumerate() {
        if is_entry_boundary(rt, frame) {
            boundary = Some(fi);
            break;
        }
        if is_funclet_call_boundary(rt, frame) {
            if (*ts).filter_depth.get() > 0 {
                // A throw escaped a filter: the filter answers no-match.
                (*ts).pending_walk.set(previous_pending);
                resume_to_epilogue(rt, frame, rt.thunks.call_funclet_epilogue, 0);
            }
            // Escaping a finally/fault during unwind corrupts the pass-2
            // contract; treat as unrecoverable.
            fatal(
                "exception escaped funclet",
                "a finally or fault funclet raised during the second pass",
            );
        }
        for (ci, clause) in frame.code.eh_clauses.iter().enumerate() {
            if !clause.covers(frame.ip_offset) {
                continue;
            }
            match &clause.kind {
                NativeClauseKind::Catch { catch_type, .. } => {
                    if exc_mt.is_assignable_to(catch_type) {
                        target = Some((fi, ci));
                        break 'pass1;
                    }
                }
                NativeClauseKind::Filter { filter, .. } => {
                    if invoke_filter(rt, frame, *filter, exception) != 0 {
                        target = Some((fi, ci));
                        break 'pass1;
                    }
                }
                _ => {}
            }
        }
    }

    let Some((target_frame, target_clause)) = target else {
        if let Some(fi) = boundary {
            // Unhandled at the reflective-invocation boundary: record and
            // resume the entry thunk's epilogue with a zero result.
            (*ts).unhandled_exception.set(exception);
            (*ts).pending_walk.set(previous_pending);
            resume_to_epilogue(rt, &frames[fi], rt.thunks.entry_epilogue, 0);
        }
        log::error!("unhandled {}", exc_mt.name());
        fatal("unhandled exception", exc_mt.name());
    };

    // ---- Second pass: run finallies innermost-to-outermost ----
    for frame in frames.iter().take(target_frame) {
        for clause in &frame.code.eh_clauses {
            if clause.covers(frame.ip_offset) && clause.is_finally_or_fault() {
                invoke_handler(rt, frame, clause.handler_funclet(), exception);
            }
        }
    }
    // Finallies of the matching frame nested inside the selected clause.
    let frame = &frames[target_frame];
    for clause in frame.code.eh_clauses.iter().take(target_clause) {
        if clause.covers(frame.ip_offset) && clause.is_finally_or_fault() {
            invoke_handler(rt, frame, clause.handler_funclet(), exception);
        }
    }

    // ---- Transfer: restore the matching frame, enter the catch ----
    (*ts).pending_walk.set(previous_pending);
    (*ts)
        .in_runtime
        .store(0, std::sync::atomic::Ordering::Release);
    let handler = frame.code.eh_clauses[target_clause].handler_funclet();
    let funclet = &frame.code.funclets[handler];
    log::debug!(
        "eh: {} handles at funclet {:#x}",
        frame.code.name,
        funclet.begin
    );
    let state = ResumeState {
        ctx: Context {
            rip: (frame.code.code_base + funclet.begin as usize) as u64,
            ..frame.ctx
        },
        rax: 0,
        rcx: exception.0 as u64,
        rdx: frame.ctx.rbp,
    };
    (rt.thunks.resume)(&state)
}
