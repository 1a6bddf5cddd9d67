//! Stop-the-world mark-sweep collection
//!
//! Precise, non-moving, non-generational. Roots come from static-field
//! arenas, the string pool's handles, and every parked thread's stack,
//! decoded frame-by-frame with the unwinder and each method's stack map.
//! Marking runs an explicit work list over GCDesc series; the sweep walks
//! regions linearly by block-size header and feeds the free list.

pub mod safepoint;
pub mod stackmap;

use crate::codemap::CodeMap;
use crate::error::fatal;
use crate::heap::GcHeap;
use crate::object::ObjRef;
use crate::unwind::{virtual_unwind, Context};
use self::stackmap::{SlotBase, SlotLocation};

/// Collector statistics across cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Total number of collections.
    pub collections: usize,
    /// Total objects freed.
    pub objects_freed: usize,
    /// Total bytes freed.
    pub bytes_freed: usize,
    /// Objects marked in the last collection.
    pub last_marked: usize,
    /// Objects freed in the last collection.
    pub last_freed: usize,
    /// Bytes freed in the last collection.
    pub last_freed_bytes: usize,
    /// Live bytes after the last collection.
    pub live_bytes: usize,
}

/// Roots for one collection.
pub struct RootSource<'a> {
    /// Addresses of static slots holding object references.
    pub statics: &'a [usize],
    /// Direct handles (string pool entries and other permanent roots).
    pub handles: &'a [ObjRef],
    /// Managed contexts of every parked thread.
    pub thread_contexts: &'a [Context],
}

/// The mark-sweep collector.
pub struct Collector {
    threshold: usize,
    stats: GcStats,
}

impl Default for Collector {
    fn default() -> Self {
        Collector::new()
    }
}

impl Collector {
    pub fn new() -> Collector {
        Collector {
            threshold: crate::defaults::GC_THRESHOLD,
            stats: GcStats::default(),
        }
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn set_threshold(&mut self, bytes: usize) {
        self.threshold = bytes;
    }

    /// True when the next allocation should trigger a collection first.
    pub fn should_collect(&self, heap: &GcHeap) -> bool {
        heap.allocated_bytes() > self.threshold
    }

    /// Run one full collection. The world must already be stopped; the
    /// caller passes the parked threads' contexts in `roots`.
    ///
    /// # Safety
    /// All contexts must describe parked threads whose frames are covered
    /// by `code_map`; heap headers must satisfy the walk invariant.
    pub unsafe fn collect(
        &mut self,
        heap: &mut GcHeap,
        code_map: &CodeMap,
        roots: &RootSource<'_>,
    ) -> (usize, usize) {
        let mut marker = Marker {
            heap,
            worklist: Vec::new(),
            marked: 0,
        };

        // Static slots.
        for &slot in roots.statics {
            marker.candidate(*(slot as *const usize), false);
        }
        // Permanent handles.
        for &handle in roots.handles {
            marker.candidate(handle.0, false);
        }
        // Thread stacks.
        for ctx in roots.thread_contexts {
            mark_thread_stack(&mut marker, code_map, ctx);
        }

        // Transitive closure.
        while let Some(obj) = marker.worklist.pop() {
            let mt = obj.method_table();
            mt.for_each_ref(obj, |slot| {
                let value = *(slot as *const usize);
                marker.candidate(value, false);
            });
        }
        let marked = marker.marked;

        // Sweep: collect victims first, then release, then clear marks.
        let mut victims = Vec::new();
        let mut survivors = Vec::new();
        heap.walk(|obj| {
            if obj.is_free_block() {
                return;
            }
            if obj.is_marked() {
                survivors.push(obj);
            } else {
                victims.push(obj);
            }
        });
        let mut freed_bytes = 0usize;
        for obj in &victims {
            freed_bytes += obj.block_size();
            heap.release(*obj);
        }
        for obj in &survivors {
            obj.clear_flag(crate::object::ObjFlags::MARK);
        }

        // Stats and threshold adaptation.
        self.stats.collections += 1;
        self.stats.objects_freed += victims.len();
        self.stats.bytes_freed += freed_bytes;
        self.stats.last_marked = marked;
        self.stats.last_freed = victims.len();
        self.stats.last_freed_bytes = freed_bytes;
        self.stats.live_bytes = heap.allocated_bytes();
        self.threshold = (heap.allocated_bytes() * 2).max(crate::defaults::GC_THRESHOLD);

        log::debug!(
            "gc: cycle {} marked {} freed {} ({} bytes), {} bytes live",
            self.stats.collections,
            marked,
            victims.len(),
            freed_bytes,
            self.stats.live_bytes
        );
        (victims.len(), freed_bytes)
    }
}

struct Marker<'a> {
    heap: &'a GcHeap,
    worklist: Vec<ObjRef>,
    marked: usize,
}

impl Marker<'_> {
    /// Consider one root value; mark and enqueue when it addresses a live
    /// heap object. Interior pointers resolve to their containing block.
    unsafe fn candidate(&mut self, value: usize, interior: bool) {
        let obj = if interior {
            match self.heap.find_object(value) {
                Some(o) => o,
                None => return,
            }
        } else {
            if !self.heap.is_object_start(value) {
                return;
            }
            ObjRef(value)
        };
        if obj.is_marked() {
            return;
        }
        obj.set_flag(crate::object::ObjFlags::MARK);
        self.marked += 1;
        self.worklist.push(obj);
    }
}

/// Enumerate one parked thread's stack roots: every live slot of every
/// frame's stack map at the frame's return site.
unsafe fn mark_thread_stack(marker: &mut Marker<'_>, code_map: &CodeMap, start: &Context) {
    let mut ctx = *start;
    while let Some(code) = code_map.lookup(ctx.rip as usize) {
        let ip_offset = code.ip_offset(ctx.rip as usize);
        let (info, rel) = code.unwind_at(ip_offset);
        let caller = virtual_unwind(info, rel, &ctx);

        let live = match code.stack_map.live_slots_at(ip_offset) {
            Some(live) => live,
            None => fatal(
                "stack-map coverage",
                &format!(
                    "no safepoint at offset {:#x} of {} (rip {:#x})",
                    ip_offset, code.name, ctx.rip
                ),
            ),
        };
        for (_, slot) in live {
            let addr = match slot.location {
                SlotLocation::Register(reg) => {
                    marker.candidate(ctx.reg(reg) as usize, slot.interior);
                    continue;
                }
                SlotLocation::Offset { base, offset } => {
                    let base_value = match base {
                        SlotBase::Frame => ctx.rbp,
                        SlotBase::CalleeSp => ctx.rsp,
                        SlotBase::CallerSp => caller.rsp,
                    };
                    (base_value as i64 + offset as i64) as usize
                }
            };
            let value = *(addr as *const usize);
            marker.candidate(value, slot.interior);
        }
        ctx = caller;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::heap::GcHeap;
    use crate::platform::HostPlatform;
    use crate::types::{GcSeries, MethodTableBuilder, MtFlags};
    use std::sync::Arc;

    fn heap() -> GcHeap {
        GcHeap::new(Arc::new(HostPlatform))
    }

    fn node_mt() -> &'static crate::types::MethodTable {
        // A node with one reference field at offset 8 and a payload at 16.
        let mut b = MethodTableBuilder::new("Node");
        b.base_size = 24;
        b.flags = MtFlags::HAS_REFERENCES;
        b.series = vec![GcSeries {
            offset: 8,
            run_bytes: 8,
        }];
        b.build()
    }

    unsafe fn link(parent: ObjRef, child: ObjRef) {
        *(parent.field_ptr(8) as *mut usize) = child.0;
    }

    #[test]
    fn test_unreachable_objects_are_swept() {
        let mut h = heap();
        let map = CodeMap::new();
        let mt = node_mt();
        let keep = h.alloc_object(mt).unwrap();
        let drop1 = h.alloc_object(mt).unwrap();
        let drop2 = h.alloc_object(mt).unwrap();

        let mut collector = Collector::new();
        let handles = [keep];
        let roots = RootSource {
            statics: &[],
            handles: &handles,
            thread_contexts: &[],
        };
        let (freed, freed_bytes) = unsafe { collector.collect(&mut h, &map, &roots) };
        assert_eq!(freed, 2);
        assert_eq!(freed_bytes, 2 * (16 + 24));
        unsafe {
            assert!(!keep.is_marked());
            assert!(drop1.is_free_block());
            assert!(drop2.is_free_block());
        }
        h.verify();
    }

    #[test]
    fn test_transitive_marking() {
        let mut h = heap();
        let map = CodeMap::new();
        let mt = node_mt();
        let a = h.alloc_object(mt).unwrap();
        let b = h.alloc_object(mt).unwrap();
        let c = h.alloc_object(mt).unwrap();
        let orphan = h.alloc_object(mt).unwrap();
        unsafe {
            link(a, b);
            link(b, c);
        }

        let mut collector = Collector::new();
        let handles = [a];
        let roots = RootSource {
            statics: &[],
            handles: &handles,
            thread_contexts: &[],
        };
        let (freed, _) = unsafe { collector.collect(&mut h, &map, &roots) };
        assert_eq!(freed, 1);
        unsafe {
            assert!(!a.is_free_block());
            assert!(!b.is_free_block());
            assert!(!c.is_free_block());
            assert!(orphan.is_free_block());
        }
    }

    #[test]
    fn test_cycle_does_not_loop() {
        let mut h = heap();
        let map = CodeMap::new();
        let mt = node_mt();
        let a = h.alloc_object(mt).unwrap();
        let b = h.alloc_object(mt).unwrap();
        unsafe {
            link(a, b);
            link(b, a);
        }
        let mut collector = Collector::new();
        let handles = [a];
        let roots = RootSource {
            statics: &[],
            handles: &handles,
            thread_contexts: &[],
        };
        let (freed, _) = unsafe { collector.collect(&mut h, &map, &roots) };
        assert_eq!(freed, 0);
        assert_eq!(collector.stats().last_marked, 2);
    }

    #[test]
    fn test_static_root_keeps_object() {
        let mut h = heap();
        let map = CodeMap::new();
        let mt = node_mt();
        let obj = h.alloc_object(mt).unwrap();
        let slot: usize = obj.0;
        let slot_addr = &slot as *const usize as usize;

        let mut collector = Collector::new();
        let statics = [slot_addr];
        let roots = RootSource {
            statics: &statics,
            handles: &[],
            thread_contexts: &[],
        };
        let (freed, _) = unsafe { collector.collect(&mut h, &map, &roots) };
        assert_eq!(freed, 0);
    }

    #[test]
    fn test_second_collection_frees_nothing() {
        let mut h = heap();
        let map = CodeMap::new();
        let mt = node_mt();
        let keep = h.alloc_object(mt).unwrap();
        let _garbage = h.alloc_object(mt).unwrap();

        let mut collector = Collector::new();
        let handles = [keep];
        let roots = RootSource {
            statics: &[],
            handles: &handles,
            thread_contexts: &[],
        };
        unsafe {
            let (freed, _) = collector.collect(&mut h, &map, &roots);
            assert_eq!(freed, 1);
            let live_before = h.allocated_bytes();
            let (freed, bytes) = collector.collect(&mut h, &map, &roots);
            assert_eq!(freed, 0);
            assert_eq!(bytes, 0);
            assert_eq!(h.allocated_bytes(), live_before);
        }
        assert_eq!(collector.stats().collections, 2);
    }

    #[test]
    fn test_non_heap_values_ignored() {
        let mut h = heap();
        let map = CodeMap::new();
        let mt = node_mt();
        let obj = h.alloc_object(mt).unwrap();
        // A static slot holding a small integer must not confuse marking.
        let bogus: usize = 42;
        let statics = [&bogus as *const usize as usize];
        let handles = [obj];
        let mut collector = Collector::new();
        let roots = RootSource {
            statics: &statics,
            handles: &handles,
            thread_contexts: &[],
        };
        let (freed, _) = unsafe { collector.collect(&mut h, &map, &roots) };
        assert_eq!(freed, 0);
    }
}
