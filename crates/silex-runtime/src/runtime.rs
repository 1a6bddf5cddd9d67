//! Runtime bring-up and the exposed surface
//!
//! One process-wide `Runtime` owns the heap, collector, code heap, code
//! map, method registry, assembly registry, loader, string pool and
//! safepoint coordinator, wired together at boot. Managed code reaches
//! back in through the helper functions at the bottom of this file; every
//! one of them is entered through an emitted bridge that records the
//! caller's context in the current thread's anchor, which is where GC
//! stack walks and exception dispatch begin.

use crate::assembly::loader::TypeLoader;
use crate::assembly::AssemblyRegistry;
use crate::boot::BootInfo;
use crate::codemap::CodeMap;
use crate::defaults::MAX_INVOKE_ARGS;
use crate::error::{Result, RuntimeError};
use crate::gc::safepoint::SafepointCoordinator;
use crate::gc::{Collector, RootSource};
use crate::heap::GcHeap;
use crate::jit::code_heap::CodeHeap;
use crate::jit::compiler::{compile_method, CompileEnv, ThrowKind};
use crate::jit::registry::{CompiledMethodRegistry, MethodCell};
use crate::jit::thunks::{self, HelperAddrs, Thunks};
use crate::object::ObjRef;
use crate::platform::Platform;
use crate::strings::StringPool;
use crate::types::MethodTable;
use crate::unwind::Context;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use silex_metadata::Token;
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Per-thread runtime state. The anchor context must stay at offset
/// zero: emitted helper bridges store through `[r15 + ctx-offset]`.
#[repr(C)]
pub struct ThreadState {
    pub anchor: Context,
    /// Nesting depth of runtime-service entries; nonzero means the
    /// anchor describes the thread's managed frames.
    pub in_runtime: AtomicU32,
    /// The exception being dispatched (rethrow source, GC root).
    pub current_exception: Cell<ObjRef>,
    /// Set when an exception reached the invoke boundary unhandled.
    pub unhandled_exception: Cell<ObjRef>,
    /// Managed frames interrupted by the dispatcher, still to be walked.
    pub pending_walk: Cell<Option<Context>>,
    /// Nesting depth of filter-funclet invocations; a throw escaping a
    /// filter is absorbed as "no match".
    pub filter_depth: Cell<u32>,
    /// True while the thread is executing managed code (between entering
    /// and leaving `resolve_and_invoke`), i.e. counted as a mutator the
    /// collector must see parked or inside a service.
    pub is_mutator: Cell<bool>,
}

impl ThreadState {
    fn new() -> ThreadState {
        ThreadState {
            anchor: Context::default(),
            in_runtime: AtomicU32::new(0),
            current_exception: Cell::new(ObjRef::NULL),
            unhandled_exception: Cell::new(ObjRef::NULL),
            pending_walk: Cell::new(None),
            filter_depth: Cell::new(0),
            is_mutator: Cell::new(false),
        }
    }
}

thread_local! {
    static CURRENT_THREAD: Cell<*mut ThreadState> = const { Cell::new(std::ptr::null_mut()) };
}

/// The calling thread's state; null until attached.
pub fn current_thread() -> *mut ThreadState {
    CURRENT_THREAD.with(|c| c.get())
}

/// RAII marker for a managed thread inside a runtime service.
pub struct ServiceGuard {
    ts: *mut ThreadState,
}

impl ServiceGuard {
    fn enter() -> ServiceGuard {
        let ts = current_thread();
        if !ts.is_null() {
            // Safety: thread states are leaked and only touched by their
            // own thread plus the stopped-world collector.
            unsafe { (*ts).in_runtime.fetch_add(1, Ordering::AcqRel) };
        }
        ServiceGuard { ts }
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        if !self.ts.is_null() {
            unsafe { (*self.ts).in_runtime.fetch_sub(1, Ordering::AcqRel) };
        }
    }
}

/// Well-known managed exception types, chained from one base so typed
/// catches work over the subtype test.
pub struct ExceptionTypes {
    pub base: &'static MethodTable,
    pub null_reference: &'static MethodTable,
    pub index_out_of_range: &'static MethodTable,
    pub overflow: &'static MethodTable,
    pub divide_by_zero: &'static MethodTable,
    pub invalid_cast: &'static MethodTable,
    pub stack_overflow: &'static MethodTable,
    pub out_of_memory: &'static MethodTable,
    pub compilation_failed: &'static MethodTable,
    pub invalid_operation: &'static MethodTable,
}

impl ExceptionTypes {
    /// The exception hierarchy lives in the loader's known types so
    /// TypeRefs to `System.*Exception` resolve to the very tables the
    /// throw helpers instantiate.
    fn bootstrap(known: &crate::assembly::loader::KnownTypes) -> ExceptionTypes {
        ExceptionTypes {
            base: known.exception,
            null_reference: known.null_reference_exception,
            index_out_of_range: known.index_out_of_range_exception,
            overflow: known.overflow_exception,
            divide_by_zero: known.divide_by_zero_exception,
            invalid_cast: known.invalid_cast_exception,
            stack_overflow: known.stack_overflow_exception,
            out_of_memory: known.out_of_memory_exception,
            compilation_failed: known.compilation_failed_exception,
            invalid_operation: known.invalid_operation_exception,
        }
    }

    pub fn for_kind(&self, kind: ThrowKind) -> &'static MethodTable {
        match kind {
            ThrowKind::NullReference => self.null_reference,
            ThrowKind::IndexOutOfRange => self.index_out_of_range,
            ThrowKind::Overflow => self.overflow,
            ThrowKind::DivideByZero => self.divide_by_zero,
            ThrowKind::InvalidCast => self.invalid_cast,
            ThrowKind::StackOverflow => self.stack_overflow,
            ThrowKind::OutOfMemory => self.out_of_memory,
            ThrowKind::CompilationFailed => self.compilation_failed,
            ThrowKind::InvalidOperation => self.invalid_operation,
        }
    }
}

struct ThreadList(Vec<usize>);
// Safety: the list holds leaked pointers; access beyond registration is
// confined to stop-the-world sections.
unsafe impl Send for ThreadList {}

/// The process-wide runtime.
pub struct Runtime {
    pub platform: Arc<dyn Platform>,
    pub heap: Mutex<GcHeap>,
    pub collector: Mutex<Collector>,
    pub code_heap: CodeHeap,
    pub code_map: CodeMap,
    pub methods: Arc<CompiledMethodRegistry>,
    pub assemblies: Arc<AssemblyRegistry>,
    pub loader: TypeLoader,
    pub strings: Mutex<StringPool>,
    pub safepoints: SafepointCoordinator,
    pub thunks: Thunks,
    pub exceptions: ExceptionTypes,
    threads: Mutex<ThreadList>,
    /// Slots registered through `register_static_root`.
    extra_statics: Mutex<Vec<usize>>,
    /// Objects the runtime must keep alive across an operation.
    temp_roots: Mutex<Vec<ObjRef>>,
}

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Bring the runtime up. The first boot wins; later calls return the
/// existing instance (host test suites share one process).
pub fn boot(platform: Arc<dyn Platform>, info: BootInfo) -> &'static Runtime {
    let rt = RUNTIME.get_or_init(|| {
        crate::trace::init(platform.clone(), log::LevelFilter::Info);

        let code_heap = CodeHeap::new(platform.clone());
        let code_map = CodeMap::new();
        let helpers = HelperAddrs {
            alloc_object: helper_alloc_object as usize,
            alloc_array: helper_alloc_array as usize,
            ldstr: helper_ldstr as usize,
            box_value: helper_box_value as usize,
            unbox: helper_unbox as usize,
            isinst: helper_isinst as usize,
            castclass: helper_castclass as usize,
            throw: helper_throw as usize,
            rethrow: helper_rethrow as usize,
            throw_wellknown: helper_throw_wellknown as usize,
            safepoint_poll: helper_safepoint_poll as usize,
            lazy_compile: helper_lazy_compile as usize,
        };
        let thunks = thunks::emit_all(&code_heap, &code_map, helpers);

        let methods = Arc::new(CompiledMethodRegistry::new());
        let assemblies = Arc::new(AssemblyRegistry::new());
        let loader = TypeLoader::new(
            assemblies.clone(),
            methods.clone(),
            Box::new(|cell| runtime().emit_trampoline_for(cell)),
        );
        let exceptions = ExceptionTypes::bootstrap(&loader.known);

        Runtime {
            platform: platform.clone(),
            heap: Mutex::new(GcHeap::new(platform.clone())),
            collector: Mutex::new(Collector::new()),
            code_heap,
            code_map,
            methods,
            assemblies,
            loader,
            strings: Mutex::new(StringPool::new()),
            safepoints: SafepointCoordinator::new(),
            thunks,
            exceptions,
            threads: Mutex::new(ThreadList(Vec::new())),
            extra_statics: Mutex::new(Vec::new()),
            temp_roots: Mutex::new(Vec::new()),
        }
    });

    // Preloaded images from the boot record, copied out before the
    // loader area is reclaimed.
    for image in &info.images {
        // Safety: the boot record describes live, loader-provided memory.
        let bytes =
            unsafe { std::slice::from_raw_parts(image.base as *const u8, image.size) }.to_vec();
        if let Err(err) = rt.assemblies.load(&image.name, bytes, false) {
            log::error!("boot image {} failed to load: {err}", image.name);
        }
    }
    rt
}

/// The booted runtime.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get().expect("runtime not booted")
}

pub fn try_runtime() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// The platform, with a host fallback so fatal paths always have one.
pub fn platform() -> Arc<dyn Platform> {
    if let Some(rt) = try_runtime() {
        return rt.platform.clone();
    }
    #[cfg(unix)]
    {
        Arc::new(crate::platform::HostPlatform)
    }
    #[cfg(not(unix))]
    {
        panic!("no platform available before boot")
    }
}

/// Emit a stack trace of the current thread's managed frames to the
/// debug channel; the tail of every fatal halt.
pub fn dump_stack_trace() {
    let Some(rt) = try_runtime() else { return };
    let ts = current_thread();
    if ts.is_null() {
        return;
    }
    // Safety: own thread state.
    let anchor = unsafe { (*ts).anchor };
    if rt.code_map.lookup(anchor.rip as usize).is_none() {
        return;
    }
    // Safety: the anchor describes this thread's parked managed frames.
    unsafe {
        crate::codemap::walk_stack(&rt.code_map, &anchor, |frame| {
            log::error!("  at {} +{:#x}", frame.code.name, frame.ip_offset);
        });
    }
}

impl Runtime {
    // ---- threads ----

    /// Attach the calling thread; idempotent. Mutator registration is
    /// separate and scoped to managed execution, so a thread idling in
    /// kernel (or test-harness) code never stalls a collection.
    pub fn attach_thread(&self) -> *mut ThreadState {
        let existing = current_thread();
        if !existing.is_null() {
            return existing;
        }
        let ts = Box::leak(Box::new(ThreadState::new())) as *mut ThreadState;
        CURRENT_THREAD.with(|c| c.set(ts));
        self.threads.lock().0.push(ts as usize);
        ts
    }

    // ---- allocation and collection ----

    pub fn alloc_object(&self, mt: &'static MethodTable) -> Result<ObjRef> {
        let mut heap = self.heap.lock();
        self.maybe_collect(&mut heap);
        heap.alloc_object(mt).ok_or(RuntimeError::OutOfMemory)
    }

    pub fn alloc_array(&self, mt: &'static MethodTable, len: usize) -> Result<ObjRef> {
        let mut heap = self.heap.lock();
        self.maybe_collect(&mut heap);
        heap.alloc_array(mt, len).ok_or(RuntimeError::OutOfMemory)
    }

    fn maybe_collect(&self, heap: &mut GcHeap) {
        let should = self.collector.lock().should_collect(heap);
        if should {
            self.collect_locked(heap);
        }
    }

    /// Force a collection. Returns (objects freed, bytes freed).
    pub fn collect(&self) -> (usize, usize) {
        let mut heap = self.heap.lock();
        self.collect_locked(&mut heap)
    }

    fn collect_locked(&self, heap: &mut GcHeap) -> (usize, usize) {
        // Stop the world: raise the trap, prod the other CPUs, and wait
        // until every other mutator is either parked at a safepoint or
        // inside a runtime service (whose anchor covers its frames).
        self.safepoints.raise_trap(self.platform.as_ref());
        let me = current_thread();
        // Safety: own thread state.
        let me_is_mutator = !me.is_null() && unsafe { (*me).is_mutator.get() };
        let mut backoff = 1u32;
        loop {
            // Mutators may finish (deregister) while we wait, so the
            // target is re-read every iteration.
            let others = self
                .safepoints
                .mutator_count()
                .saturating_sub(usize::from(me_is_mutator));
            let parked = self.safepoints.parked_count();
            let in_services = self.count_threads_in_runtime();
            if parked + in_services >= others {
                break;
            }
            for _ in 0..backoff {
                std::hint::spin_loop();
            }
            backoff = (backoff * 2).min(1024);
        }

        // Roots: static slots, interned strings, runtime handles and
        // every relevant thread context.
        let mut statics = self.assemblies.static_roots();
        statics.extend_from_slice(&self.extra_statics.lock());

        let mut handles: Vec<ObjRef> = Vec::new();
        {
            let strings = self.strings.lock();
            handles.extend_from_slice(strings.roots());
        }
        handles.extend_from_slice(&self.temp_roots.lock());

        let mut contexts = self.safepoints.parked_contexts();
        for &ts_addr in &self.threads.lock().0 {
            let ts = ts_addr as *mut ThreadState;
            // Safety: leaked thread states; the world is stopped.
            unsafe {
                if (*ts).in_runtime.load(Ordering::Acquire) > 0
                    && self.code_map.lookup((*ts).anchor.rip as usize).is_some()
                {
                    contexts.push((*ts).anchor);
                }
                if let Some(pending) = (*ts).pending_walk.get() {
                    contexts.push(pending);
                }
                let exc = (*ts).current_exception.get();
                if !exc.is_null() {
                    handles.push(exc);
                }
                let unhandled = (*ts).unhandled_exception.get();
                if !unhandled.is_null() {
                    handles.push(unhandled);
                }
            }
        }

        let roots = RootSource {
            statics: &statics,
            handles: &handles,
            thread_contexts: &contexts,
        };
        // Safety: world stopped, contexts parked, heap locked.
        let freed = unsafe { self.collector.lock().collect(heap, &self.code_map, &roots) };
        self.safepoints.resume();
        freed
    }

    fn count_threads_in_runtime(&self) -> usize {
        let me = current_thread() as usize;
        self.threads
            .lock()
            .0
            .iter()
            .filter(|&&ts| {
                ts != me
                    && unsafe { (*(ts as *mut ThreadState)).in_runtime.load(Ordering::Acquire) }
                        > 0
            })
            .count()
    }

    /// Keep `obj` alive across a runtime operation.
    pub fn push_temp_root(&self, obj: ObjRef) {
        self.temp_roots.lock().push(obj);
    }

    pub fn pop_temp_root(&self) {
        self.temp_roots.lock().pop();
    }

    /// Register a static slot holding an object reference as a GC root.
    pub fn register_static_root(&self, slot: usize) {
        self.extra_statics.lock().push(slot);
    }

    // ---- strings ----

    pub fn load_user_string(&self, assembly: u32, token: u32) -> Result<ObjRef> {
        let record = self.assemblies.get(assembly)?;
        let units = record.view.user_strings().get(token & 0x00FF_FFFF)?;
        let mut heap = self.heap.lock();
        self.maybe_collect(&mut heap);
        self.strings
            .lock()
            .intern_literal(assembly, token, &units, &mut heap, self.loader.known.string)
            .ok_or(RuntimeError::OutOfMemory)
    }

    /// Intern a native string; the kernel-facing `Intern` surface.
    pub fn intern_str(&self, s: &str) -> Result<ObjRef> {
        let units: Vec<u16> = s.encode_utf16().collect();
        let mut heap = self.heap.lock();
        self.maybe_collect(&mut heap);
        let obj = crate::strings::alloc_string(&mut heap, self.loader.known.string, &units)
            .ok_or(RuntimeError::OutOfMemory)?;
        // Safety: freshly allocated string.
        Ok(unsafe { self.strings.lock().intern(obj) })
    }

    /// Intern an existing managed string.
    ///
    /// # Safety
    /// `obj` must be a live string instance.
    pub unsafe fn intern(&self, obj: ObjRef) -> ObjRef {
        self.strings.lock().intern(obj)
    }

    // ---- assemblies ----

    pub fn load_assembly(&self, name: &str, bytes: Vec<u8>, bare_metadata: bool) -> Result<u32> {
        self.assemblies.load(name, bytes, bare_metadata)
    }

    /// Dependency-checked unload reclaiming code, cells and map entries.
    pub fn unload_assembly(&self, id: u32) -> Result<()> {
        self.assemblies.unload(id)?;
        self.code_map.unregister_assembly(id);
        self.methods.unload_assembly(id);
        self.code_heap.unload_assembly(id);
        Ok(())
    }

    // ---- compilation and invocation ----

    fn emit_trampoline_for(&self, cell: &Arc<MethodCell>) -> usize {
        thunks::emit_trampoline(
            &self.code_heap,
            &self.code_map,
            self.thunks.bridges.lazy_compile,
            Arc::as_ptr(cell) as usize,
            cell.assembly,
            cell.token,
        )
    }

    /// Get-or-create the registry cell (and trampoline) for a method.
    pub fn ensure_cell(&self, assembly: u32, token: u32) -> Arc<MethodCell> {
        self.methods
            .reserve(assembly, token, |cell| self.emit_trampoline_for(cell))
    }

    /// Reflective invocation: resolve, compile on first call through the
    /// trampoline, marshal an argument blob and run.
    pub fn resolve_and_invoke(
        &self,
        assembly: u32,
        token: u32,
        args: &[u64],
    ) -> Result<u64> {
        if args.len() > MAX_INVOKE_ARGS {
            return Err(RuntimeError::TooManyArgs(args.len()));
        }
        let ts = self.attach_thread();
        let resolved = self.loader.resolve_method(assembly, Token(token))?;
        let cell = self.ensure_cell(resolved.assembly, resolved.token);

        // Count as a mutator only while managed code can actually run.
        struct MutatorGuard<'a>(&'a Runtime, *mut ThreadState);
        impl Drop for MutatorGuard<'_> {
            fn drop(&mut self) {
                // Safety: own thread state.
                unsafe { (*self.1).is_mutator.set(false) };
                self.0.safepoints.deregister_mutator();
            }
        }
        self.safepoints.register_mutator();
        // Safety: own thread state.
        unsafe { (*ts).is_mutator.set(true) };
        let _mutator = MutatorGuard(self, ts);

        let mut argv = args.to_vec();
        argv.resize(args.len().max(4), 0);
        let entry = cell.call_target();

        // Safety: the entry thunk follows the documented convention; the
        // target is a trampoline or published method entry.
        let ret = unsafe {
            (self.thunks.entry)(
                entry as u64,
                argv.as_ptr() as u64,
                args.len() as u64,
                ts as u64,
            )
        };

        // Safety: own thread state.
        let unhandled = unsafe { (*ts).unhandled_exception.get() };
        if !unhandled.is_null() {
            unsafe { (*ts).unhandled_exception.set(ObjRef::NULL) };
            log::debug!("invoke: unhandled managed exception {:#x}", unhandled.0);
            return Err(RuntimeError::ManagedException);
        }

        // Float results come back mirrored into argv[0] by the thunk.
        match resolved.sig.ret {
            silex_metadata::TypeSig::R4 | silex_metadata::TypeSig::R8 => Ok(argv[0]),
            _ => Ok(ret),
        }
    }

    pub(crate) fn compile_env<'a>(
        &'a self,
        reserve: &'a dyn Fn(u32, u32) -> Arc<MethodCell>,
    ) -> CompileEnv<'a> {
        CompileEnv {
            loader: &self.loader,
            bridges: self.thunks.bridges,
            trap_flag: self.safepoints.trap_flag_addr(),
            reserve,
        }
    }

    /// Allocate a well-known exception instance.
    pub fn new_exception(&self, mt: &'static MethodTable) -> ObjRef {
        match self.alloc_object(mt) {
            Ok(obj) => obj,
            // Allocation failure while building an exception: fall back
            // to the preallocated path by halting; Tier-0 keeps no
            // reserve object.
            Err(_) => crate::error::fatal("out of memory", "while allocating an exception"),
        }
    }

    /// Raise a managed exception from runtime (kernel) code.
    pub fn throw(&self, exception: ObjRef) -> ! {
        let ts = current_thread();
        assert!(!ts.is_null(), "throw from an unattached thread");
        // Safety: own thread state; anchor was set by the helper bridge
        // (or by the kernel fault path).
        unsafe {
            let ctx = (*ts).anchor;
            crate::eh::dispatch::dispatch_throw(self, exception, &ctx)
        }
    }
}

// ---- helpers reachable from emitted code ----
//
// Every helper is extern "win64" so emitted call sites and Rust agree on
// the convention on the host as well as the target.

macro_rules! managed_helper {
    ($(#[$meta:meta])* fn $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty $body:block) => {
        #[cfg(target_arch = "x86_64")]
        $(#[$meta])*
        pub unsafe extern "win64" fn $name($($arg: $ty),*) -> $ret $body
        #[cfg(not(target_arch = "x86_64"))]
        $(#[$meta])*
        pub unsafe extern "C" fn $name($($arg: $ty),*) -> $ret $body
    };
}

fn throw_wellknown(rt: &Runtime, kind: ThrowKind) -> ! {
    let mt = rt.exceptions.for_kind(kind);
    let exception = rt.new_exception(mt);
    let ts = current_thread();
    // Safety: helpers run on attached threads with a bridge-set anchor.
    unsafe {
        let ctx = (*ts).anchor;
        crate::eh::dispatch::dispatch_throw(rt, exception, &ctx)
    }
}

managed_helper! {
    /// Allocate an instance; GC on pressure; OutOfMemory on exhaustion.
    fn helper_alloc_object(mt: usize) -> usize {
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        let mt = &*(mt as *const MethodTable);
        match rt.alloc_object(mt) {
            Ok(obj) => obj.0,
            Err(_) => throw_wellknown(rt, ThrowKind::OutOfMemory),
        }
    }
}

managed_helper! {
    fn helper_alloc_array(mt: usize, len: i64) -> usize {
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        if len < 0 {
            throw_wellknown(rt, ThrowKind::Overflow);
        }
        let mt = &*(mt as *const MethodTable);
        match rt.alloc_array(mt, len as usize) {
            Ok(obj) => obj.0,
            Err(_) => throw_wellknown(rt, ThrowKind::OutOfMemory),
        }
    }
}

managed_helper! {
    fn helper_ldstr(assembly: u64, token: u64) -> usize {
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        match rt.load_user_string(assembly as u32, token as u32) {
            Ok(obj) => obj.0,
            Err(_) => throw_wellknown(rt, ThrowKind::InvalidOperation),
        }
    }
}

managed_helper! {
    /// Box the value at `src` as an instance of `mt`.
    fn helper_box_value(mt: usize, src: usize) -> usize {
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        let mt = &*(mt as *const MethodTable);
        let size = mt.base_size().max(1);
        let block = 16 + 8 + (size + 7) / 8 * 8;
        let obj = {
            let mut heap = rt.heap.lock();
            rt.maybe_collect(&mut heap);
            heap.alloc_block(block)
        };
        match obj {
            Some(obj) => {
                obj.set_method_table(mt);
                std::ptr::copy_nonoverlapping(
                    src as *const u8,
                    obj.field_ptr(crate::object::FIELDS_OFFSET),
                    size,
                );
                obj.0
            }
            None => throw_wellknown(rt, ThrowKind::OutOfMemory),
        }
    }
}

managed_helper! {
    /// Type-checked unbox: the interior pointer to the boxed value.
    fn helper_unbox(obj: usize, mt: usize) -> usize {
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        if obj == 0 {
            throw_wellknown(rt, ThrowKind::NullReference);
        }
        let obj = ObjRef(obj);
        let expected = mt as *const MethodTable;
        if !std::ptr::eq(obj.method_table(), expected) {
            throw_wellknown(rt, ThrowKind::InvalidCast);
        }
        obj.0 + crate::object::FIELDS_OFFSET
    }
}

managed_helper! {
    fn helper_isinst(obj: usize, mt: usize) -> usize {
        if obj == 0 {
            return 0;
        }
        let _guard = ServiceGuard::enter();
        let target = &*(mt as *const MethodTable);
        if ObjRef(obj).method_table().is_assignable_to(target) {
            obj
        } else {
            0
        }
    }
}

managed_helper! {
    fn helper_castclass(obj: usize, mt: usize) -> usize {
        if obj == 0 {
            return 0; // a null reference casts to anything
        }
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        let target = &*(mt as *const MethodTable);
        if ObjRef(obj).method_table().is_assignable_to(target) {
            obj
        } else {
            throw_wellknown(rt, ThrowKind::InvalidCast)
        }
    }
}

managed_helper! {
    fn helper_throw(exception: usize) -> usize {
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        let ts = current_thread();
        let ctx = (*ts).anchor;
        crate::eh::dispatch::dispatch_throw(rt, ObjRef(exception), &ctx)
    }
}

managed_helper! {
    fn helper_rethrow() -> usize {
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        let ts = current_thread();
        let exception = (*ts).current_exception.get();
        if exception.is_null() {
            throw_wellknown(rt, ThrowKind::InvalidOperation);
        }
        let ctx = (*ts).anchor;
        crate::eh::dispatch::dispatch_throw(rt, exception, &ctx)
    }
}

managed_helper! {
    fn helper_throw_wellknown(kind: u64) -> usize {
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        let kind = match kind {
            0 => ThrowKind::NullReference,
            1 => ThrowKind::IndexOutOfRange,
            2 => ThrowKind::Overflow,
            3 => ThrowKind::DivideByZero,
            4 => ThrowKind::InvalidCast,
            5 => ThrowKind::StackOverflow,
            6 => ThrowKind::OutOfMemory,
            7 => ThrowKind::CompilationFailed,
            _ => ThrowKind::InvalidOperation,
        };
        throw_wellknown(rt, kind)
    }
}

managed_helper! {
    /// Back-edge poll slow path: park on the bridge-recorded context.
    fn helper_safepoint_poll() -> usize {
        let rt = runtime();
        if rt.safepoints.trap_pending() {
            let ts = current_thread();
            let ctx = (*ts).anchor;
            rt.safepoints.park(ctx);
        }
        0
    }
}

managed_helper! {
    /// First-invocation path behind every trampoline: compile (or wait
    /// for the racing winner), publish, return the entry.
    fn helper_lazy_compile(cell: usize) -> usize {
        let rt = runtime();
        let _guard = ServiceGuard::enter();
        let cell = &*(cell as *const MethodCell);
        loop {
            if cell.is_ready() {
                return cell.call_target();
            }
            if rt.methods.begin_compile(cell) {
                let reserve = |a: u32, t: u32| rt.ensure_cell(a, t);
                let env = rt.compile_env(&reserve);
                match compile_method(&env, &rt.code_heap, &rt.code_map, cell.assembly, cell.token)
                {
                    Ok(code) => {
                        rt.methods.finish(cell, code);
                        return cell.call_target();
                    }
                    Err(err) => {
                        log::error!(
                            "jit: method {:#x} of assembly {} failed: {err}",
                            cell.token,
                            cell.assembly
                        );
                        rt.methods.fail_compile(cell);
                        throw_wellknown(rt, ThrowKind::CompilationFailed);
                    }
                }
            }
            rt.methods.wait_not_compiling(cell);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_state_anchor_is_first() {
        // The emitted bridges write the anchor at [r15 + 0].
        assert_eq!(std::mem::offset_of!(ThreadState, anchor), 0);
    }

    #[test]
    fn test_exception_types_subtype_chain() {
        let known = crate::assembly::loader::KnownTypes::bootstrap();
        let kinds = ExceptionTypes::bootstrap(&known);
        assert!(kinds.null_reference.is_assignable_to(kinds.base));
        assert!(kinds.overflow.is_assignable_to(kinds.base));
        assert!(kinds.base.is_assignable_to(known.object));
        assert!(!kinds.base.is_assignable_to(kinds.null_reference));
        assert!(std::ptr::eq(
            kinds.for_kind(ThrowKind::DivideByZero),
            kinds.divide_by_zero
        ));
    }
}
