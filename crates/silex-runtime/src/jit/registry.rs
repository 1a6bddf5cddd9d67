//! Compiled-method registry
//!
//! A concurrent table keyed by `(assembly, method token)`. Every call site
//! the compiler emits goes through a registered cell's entry word, which
//! holds the method's trampoline until the method is Ready and its native
//! entry afterwards. Reservations exist before any code references them,
//! so recursive and mutually-recursive compilation always has a stable
//! target. The `Reserved → Compiling` transition is a compare-and-set:
//! exactly one thread compiles, racers wait on the state.

use crate::codemap::CompiledCode;
use crate::types::MethodTable;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

const STATE_RESERVED: u8 = 0;
const STATE_COMPILING: u8 = 1;
const STATE_READY: u8 = 2;

/// Registry lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    NotPresent,
    /// Slot exists; calls land on the trampoline.
    Reserved(usize),
    /// Compilation in progress; calls still land on the trampoline.
    Compiling(usize),
    /// Native entry address.
    Ready(usize),
}

/// One method's registry cell. Stable address for the lifetime of the
/// assembly; emitted call sites hold a pointer to [`MethodCell::entry`].
pub struct MethodCell {
    pub assembly: u32,
    pub token: u32,
    state: AtomicU8,
    /// The word call sites load and call through.
    pub entry: AtomicUsize,
    trampoline: AtomicUsize,
    /// `(method table, slot)` pairs to patch when the method is Ready.
    patch_sites: Mutex<Vec<(&'static MethodTable, usize)>>,
    /// Published code, once Ready.
    pub code: Mutex<Option<Arc<CompiledCode>>>,
}

impl MethodCell {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == STATE_READY
    }

    /// Address of the entry word, for emitting indirect call sites.
    pub fn entry_slot_addr(&self) -> usize {
        &self.entry as *const AtomicUsize as *const u8 as usize
    }

    /// Current call target (trampoline or native entry).
    pub fn call_target(&self) -> usize {
        self.entry.load(Ordering::Acquire)
    }

    pub fn trampoline(&self) -> usize {
        self.trampoline.load(Ordering::Acquire)
    }
}

/// Compile statistics.
#[derive(Debug, Default)]
pub struct JitStats {
    pub methods_compiled: AtomicUsize,
    pub code_bytes: AtomicUsize,
}

/// The registry.
#[derive(Default)]
pub struct CompiledMethodRegistry {
    cells: DashMap<(u32, u32), Arc<MethodCell>>,
    pub stats: JitStats,
}

impl CompiledMethodRegistry {
    pub fn new() -> CompiledMethodRegistry {
        CompiledMethodRegistry::default()
    }

    /// Get or create the cell for a method. `make_trampoline` runs at most
    /// once per cell, after the cell address is stable, so the emitted
    /// trampoline can embed a pointer to it.
    pub fn reserve(
        &self,
        assembly: u32,
        token: u32,
        make_trampoline: impl FnOnce(&Arc<MethodCell>) -> usize,
    ) -> Arc<MethodCell> {
        let cell = self
            .cells
            .entry((assembly, token))
            .or_insert_with(|| {
                Arc::new(MethodCell {
                    assembly,
                    token,
                    state: AtomicU8::new(STATE_RESERVED),
                    entry: AtomicUsize::new(0),
                    trampoline: AtomicUsize::new(0),
                    patch_sites: Mutex::new(Vec::new()),
                    code: Mutex::new(None),
                })
            })
            .clone();
        if cell.trampoline.load(Ordering::Acquire) == 0 {
            let stub = make_trampoline(&cell);
            // First writer wins; a racing stub is merely wasted space.
            if cell
                .trampoline
                .compare_exchange(0, stub, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _ = cell.entry.compare_exchange(
                    0,
                    stub,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        cell
    }

    pub fn lookup(&self, assembly: u32, token: u32) -> Lookup {
        match self.cells.get(&(assembly, token)) {
            None => Lookup::NotPresent,
            Some(cell) => match cell.state() {
                STATE_RESERVED => Lookup::Reserved(cell.trampoline()),
                STATE_COMPILING => Lookup::Compiling(cell.trampoline()),
                _ => Lookup::Ready(cell.call_target()),
            },
        }
    }

    pub fn get(&self, assembly: u32, token: u32) -> Option<Arc<MethodCell>> {
        self.cells.get(&(assembly, token)).map(|c| c.clone())
    }

    /// Try to take the cell from Reserved to Compiling. Exactly one caller
    /// wins; the rest keep calling the trampoline (recursion) or wait for
    /// Ready (racing threads).
    pub fn begin_compile(&self, cell: &MethodCell) -> bool {
        cell.state
            .compare_exchange(
                STATE_RESERVED,
                STATE_COMPILING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Publish a compiled method: store the entry, flip to Ready, patch
    /// every recorded vtable slot.
    pub fn finish(&self, cell: &MethodCell, code: Arc<CompiledCode>) {
        let entry = code.entry();
        self.stats.code_bytes.fetch_add(code.code_len as usize, Ordering::Relaxed);
        self.stats.methods_compiled.fetch_add(1, Ordering::Relaxed);
        *cell.code.lock() = Some(code);
        cell.entry.store(entry, Ordering::Release);
        cell.state.store(STATE_READY, Ordering::Release);
        for (mt, slot) in cell.patch_sites.lock().drain(..) {
            mt.patch_vtable_slot(slot, entry);
        }
    }

    /// Compilation failed: back to Reserved so the trampoline stays the
    /// entry and the failure resurfaces on every invocation.
    pub fn fail_compile(&self, cell: &MethodCell) {
        cell.state.store(STATE_RESERVED, Ordering::Release);
    }

    /// Record a vtable slot that must hold this method's entry. Patches
    /// immediately when already Ready.
    pub fn add_vtable_patch(&self, cell: &MethodCell, mt: &'static MethodTable, slot: usize) {
        if cell.is_ready() {
            mt.patch_vtable_slot(slot, cell.call_target());
        } else {
            cell.patch_sites.lock().push((mt, slot));
            // The method may have become Ready between the check and the
            // push; re-check so the patch is never lost.
            if cell.is_ready() {
                for (mt, slot) in cell.patch_sites.lock().drain(..) {
                    mt.patch_vtable_slot(slot, cell.call_target());
                }
            }
        }
    }

    /// Wait until `cell` leaves Compiling (a racing thread publishing or
    /// failing). Used by the lazy-compile path when it loses the CAS.
    pub fn wait_not_compiling(&self, cell: &MethodCell) {
        let mut backoff = 1u32;
        while cell.state() == STATE_COMPILING {
            for _ in 0..backoff {
                std::hint::spin_loop();
            }
            backoff = (backoff * 2).min(1024);
        }
    }

    /// Drop every cell of an assembly on unload.
    pub fn unload_assembly(&self, assembly: u32) {
        self.cells.retain(|(a, _), _| *a != assembly);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::stackmap::{StackMap, StackMapBuilder};
    use crate::types::MethodTableBuilder;
    use crate::unwind::UnwindInfo;

    fn ready_code(entry: usize) -> Arc<CompiledCode> {
        Arc::new(CompiledCode {
            assembly: 1,
            token: 0x0600_0001,
            name: "m".into(),
            code_base: entry,
            code_len: 32,
            prologue_len: 4,
            unwind: UnwindInfo::default(),
            stack_map: StackMap::decode(&StackMapBuilder::new().encode(32)).unwrap(),
            eh_clauses: Vec::new(),
            funclets: Vec::new(),
        })
    }

    #[test]
    fn test_reserve_then_lookup() {
        let reg = CompiledMethodRegistry::new();
        assert_eq!(reg.lookup(1, 2), Lookup::NotPresent);

        let cell = reg.reserve(1, 2, |_| 0xAAA0);
        assert_eq!(reg.lookup(1, 2), Lookup::Reserved(0xAAA0));
        assert_eq!(cell.call_target(), 0xAAA0);

        // A second reserve reuses the cell and trampoline.
        let again = reg.reserve(1, 2, |_| panic!("trampoline rebuilt"));
        assert!(Arc::ptr_eq(&cell, &again));
    }

    #[test]
    fn test_state_machine() {
        let reg = CompiledMethodRegistry::new();
        let cell = reg.reserve(1, 2, |_| 0xAAA0);

        assert!(reg.begin_compile(&cell));
        assert!(!reg.begin_compile(&cell), "second CAS must lose");
        assert_eq!(reg.lookup(1, 2), Lookup::Compiling(0xAAA0));

        reg.finish(&cell, ready_code(0xBBB0));
        assert_eq!(reg.lookup(1, 2), Lookup::Ready(0xBBB0));
        assert!(cell.is_ready());
        assert_eq!(reg.stats.methods_compiled.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fail_returns_to_reserved() {
        let reg = CompiledMethodRegistry::new();
        let cell = reg.reserve(1, 2, |_| 0xAAA0);
        assert!(reg.begin_compile(&cell));
        reg.fail_compile(&cell);
        assert_eq!(reg.lookup(1, 2), Lookup::Reserved(0xAAA0));
        // The failure is retryable.
        assert!(reg.begin_compile(&cell));
    }

    #[test]
    fn test_vtable_patching() {
        let reg = CompiledMethodRegistry::new();
        let mt = {
            let mut b = MethodTableBuilder::new("C");
            b.vtable = vec![0x1111, 0x2222];
            b.build()
        };
        let cell = reg.reserve(1, 2, |_| 0x1111);
        reg.add_vtable_patch(&cell, mt, 0);
        assert_eq!(mt.vtable_slot(0), 0x1111);

        assert!(reg.begin_compile(&cell));
        reg.finish(&cell, ready_code(0x3333));
        assert_eq!(mt.vtable_slot(0), 0x3333);
        assert_eq!(mt.vtable_slot(1), 0x2222);

        // Late patch request on a Ready method patches immediately.
        reg.add_vtable_patch(&cell, mt, 1);
        assert_eq!(mt.vtable_slot(1), 0x3333);
    }

    #[test]
    fn test_unload_assembly() {
        let reg = CompiledMethodRegistry::new();
        reg.reserve(1, 2, |_| 0xA);
        reg.reserve(2, 2, |_| 0xB);
        reg.unload_assembly(1);
        assert_eq!(reg.lookup(1, 2), Lookup::NotPresent);
        assert!(matches!(reg.lookup(2, 2), Lookup::Reserved(_)));
    }

    #[test]
    fn test_racing_compilers_cooperate() {
        use std::sync::atomic::AtomicUsize;

        let reg = Arc::new(CompiledMethodRegistry::new());
        let cell = reg.reserve(1, 2, |_| 0xAAA0);
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                let cell = cell.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if reg.begin_compile(&cell) {
                        winners.fetch_add(1, Ordering::SeqCst);
                        reg.finish(&cell, ready_code(0xCCC0));
                    } else {
                        // Either the winner has not started yet or it is
                        // mid-compile; both resolve to Ready eventually.
                        while !cell.is_ready() {
                            reg.wait_not_compiling(&cell);
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(reg.lookup(1, 2), Lookup::Ready(0xCCC0));
    }
}
